//! `drover fetch` – download URLs through the full engine.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use drover_core::file::FileStatus;
use drover_core::package::Destination;
use drover_core::store::FileStore;

use super::{build_engine, format_size};

pub async fn run(
    urls: Vec<String>,
    out: Option<PathBuf>,
    chunks: Option<usize>,
    max_downloads: Option<usize>,
    limit_rate: Option<i64>,
) -> Result<()> {
    let mut cfg = drover_core::config::load_or_init().unwrap_or_default();
    if let Some(out) = out {
        cfg.general.storage_folder = out;
    }
    if let Some(chunks) = chunks {
        cfg.download.chunks = chunks.max(1);
    }
    if let Some(max) = max_downloads {
        cfg.download.max_downloads = max.max(1);
    }
    if let Some(rate) = limit_rate {
        cfg.download.limit_speed = rate > 0;
        cfg.download.max_speed = rate;
    }

    let (ctx, sched, api) = build_engine(cfg);

    let pids = api.generate_and_add_packages(&urls, Destination::Queue);
    let total: usize = pids
        .iter()
        .map(|pid| ctx.store.package_files(*pid).len())
        .sum();
    if total == 0 {
        println!("No supported URLs given.");
        return Ok(());
    }
    tracing::info!("fetching {} file(s) in {} package(s)", total, pids.len());

    sched.start();
    sched.unpause();

    // The control loop runs on a blocking thread: ticks can stall on the
    // reconnect protocol and must not block the runtime.
    let loop_sched = sched.clone();
    let loop_ctx = ctx.clone();
    let loop_pids = pids.clone();
    let mut done = tokio::task::spawn_blocking(move || loop {
        loop_sched.tick();

        let files: Vec<_> = loop_pids
            .iter()
            .flat_map(|pid| loop_ctx.store.package_files(*pid))
            .collect();
        if files.iter().all(|f| f.status().is_terminal()) {
            break files
                .iter()
                .filter(|f| f.status() != FileStatus::Finished)
                .count();
        }
        std::thread::sleep(Duration::from_millis(500));
    });

    // Progress printing stays on the runtime.
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let failed: usize = loop {
        tokio::select! {
            res = &mut done => break res?,
            _ = interval.tick() => {
                for row in api.status_downloads() {
                    println!(
                        "  {}  {} / {} ({}%)  {}/s",
                        row.name,
                        format_size(row.size.saturating_sub(row.bytes_left)),
                        format_size(row.size),
                        row.percent,
                        format_size(row.speed),
                    );
                }
            }
        }
    };

    if failed == 0 {
        println!("All downloads finished.");
        Ok(())
    } else {
        anyhow::bail!("{} download(s) did not finish", failed);
    }
}
