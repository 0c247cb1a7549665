//! `drover check` – probe online status without downloading.

use std::time::Duration;

use anyhow::Result;
use drover_core::config::load_or_init;

use super::{build_engine, format_size};

pub async fn run(urls: Vec<String>) -> Result<()> {
    let cfg = load_or_init().unwrap_or_default();
    let (_ctx, _sched, api) = build_engine(cfg);

    let check = api.check_online_status(&urls);
    if check.results.is_empty() {
        println!("No supported URLs given.");
        return Ok(());
    }

    let rid = check.rid as u64;
    let mut results = check.results;

    // Poll until the probe signals that no more data will come.
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let partial = api.poll_results(rid);
        let drained = partial.rid == -1;
        results.extend(partial.results);
        if drained {
            break;
        }
    }

    for (url, status) in &results {
        let size = if status.size > 0 {
            format_size(status.size)
        } else {
            "-".to_string()
        };
        println!(
            "{:10} {:10} {:>10}  {}",
            status.status.as_str(),
            status.plugin,
            size,
            url
        );
    }
    Ok(())
}
