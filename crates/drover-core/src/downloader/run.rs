//! Transfer event loop: bootstrap, chunk fan-out, perform/wait/messages,
//! merge.
//!
//! Network failures leave chunk files and the sidecar untouched so the next
//! attempt resumes; only a successful merge cleans them up.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

use crate::error::Aborted;
use crate::utils::sanitize_filename;

use super::chunk::{ChunkHandler, ChunkShared};
use super::info::{ChunkInfo, SidecarError};
use super::{DownloadProgress, HttpDownload};

/// How often the progress callback fires.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub(super) fn run(dl: &HttpDownload) -> Result<PathBuf> {
    if let Some(parent) = dl.target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let shared = ChunkShared::new(Arc::clone(&dl.abort), dl.bucket.clone());
    let (info, resume) = plan_or_resume(dl)?;

    let multi = curl::multi::Multi::new();
    let mut active: Vec<(usize, curl::multi::Easy2Handle<ChunkHandler>)> = Vec::new();
    let mut finished: BTreeMap<usize, curl::easy::Easy2<ChunkHandler>> = BTreeMap::new();
    // Bytes already on disk in chunks that will not transfer again.
    let mut settled_bytes: u64 = 0;

    let mut info = info;
    if resume {
        // Layout is fixed; open every incomplete chunk with its remaining range.
        shared.size.store(info.size(), Ordering::Relaxed);
        shared.chunk_support.store(true, Ordering::Relaxed);
        shared.headers_done.store(true, Ordering::Relaxed);
        for i in 0..info.count() {
            let on_disk = chunk_file_len(&info, i);
            if on_disk >= info.chunk_len(i) {
                settled_bytes += on_disk;
                continue;
            }
            let handle = add_resumed_chunk(&multi, dl, &shared, &info, i, on_disk)?;
            active.push((i, handle));
        }
    } else {
        // Bootstrap: chunk 0 alone, unbounded, parsing headers.
        let path = ChunkInfo::chunk_path(&dl.target, 0);
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let handler = ChunkHandler::new(0, Arc::clone(&shared), file, 0, 0, true);
        let handle = add_transfer(&multi, dl, handler, None)?;
        active.push((0, handle));
    }

    let mut planned = resume;
    let mut first_error: Option<anyhow::Error> = None;
    let mut last_progress = Instant::now();
    let mut last_arrived = settled_bytes;
    let mut speed: u64 = 0;

    while !active.is_empty() {
        let running = multi
            .perform()
            .map_err(|e| anyhow::anyhow!("curl multi perform: {}", e))?;

        if !planned && shared.headers_done.load(Ordering::Relaxed) {
            planned = true;
            split_into_chunks(dl, &multi, &shared, &mut info, &mut active)?;
        }

        let mut completed: Vec<(usize, Result<(), curl::Error>)> = Vec::new();
        multi.messages(|msg| {
            for (pos, (_, handle)) in active.iter().enumerate() {
                if let Some(res) = msg.result_for2(handle) {
                    completed.push((pos, res));
                    break;
                }
            }
        });
        completed.sort_by(|a, b| b.0.cmp(&a.0));

        for (pos, res) in completed {
            let (index, handle) = active.remove(pos);
            let mut easy = multi
                .remove2(handle)
                .map_err(|e| anyhow::anyhow!("curl multi remove: {}", e))?;
            let code = easy.response_code().unwrap_or(0);
            let handler = easy.get_ref();

            if dl.abort.load(Ordering::Relaxed) {
                first_error.get_or_insert_with(|| Aborted.into());
                continue;
            }

            let ok = if handler.is_satisfied() {
                // Range delivered; a deliberate short write (server over-send)
                // surfaces as a curl write error and is still success.
                true
            } else {
                match res {
                    Ok(()) => {
                        let http_ok = code == 0 || (200..300).contains(&code) || code == 226;
                        if !http_ok {
                            first_error.get_or_insert_with(|| {
                                anyhow::anyhow!("chunk {}: HTTP {}", index, code)
                            });
                        }
                        http_ok
                    }
                    Err(e) => {
                        first_error
                            .get_or_insert_with(|| anyhow::anyhow!("chunk {}: {}", index, e));
                        false
                    }
                }
            };

            if ok {
                settled_bytes += handler.arrived();
                finished.insert(index, easy);
            }
        }

        if first_error.is_some() {
            break;
        }

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            let arrived: u64 = settled_bytes
                + active
                    .iter()
                    .map(|(_, h)| h.get_ref().arrived())
                    .sum::<u64>();
            let elapsed = last_progress.elapsed().as_secs_f64();
            let instant = ((arrived.saturating_sub(last_arrived)) as f64 / elapsed) as u64;
            speed = (speed * 7 + instant * 3) / 10;
            last_arrived = arrived;
            last_progress = Instant::now();
            if let Some(cb) = &dl.progress {
                cb(DownloadProgress {
                    arrived,
                    size: shared.size.load(Ordering::Relaxed),
                    speed,
                });
            }
        }

        if running > 0 {
            multi
                .wait(&mut [], Duration::from_millis(100))
                .map_err(|e| anyhow::anyhow!("curl multi wait: {}", e))?;
        }
    }

    if let Some(err) = first_error {
        // Keep chunk files and sidecar so the owning plugin can retry/resume.
        return Err(err);
    }
    if dl.abort.load(Ordering::Relaxed) {
        return Err(Aborted.into());
    }

    // Flush and fsync chunk files in index order before merging.
    for (index, easy) in finished.iter_mut() {
        easy.get_mut()
            .finish_file()
            .with_context(|| format!("failed to sync chunk {}", index))?;
    }
    drop(finished);

    let final_path = final_path_for(dl, &shared);
    merge_chunks(&info, &dl.target, &final_path)?;

    if let Some(cb) = &dl.progress {
        let size = shared.size.load(Ordering::Relaxed);
        cb(DownloadProgress {
            arrived: size,
            size,
            speed,
        });
    }

    Ok(final_path)
}

/// Decide between resuming a prior layout and starting fresh.
fn plan_or_resume(dl: &HttpDownload) -> Result<(ChunkInfo, bool)> {
    match ChunkInfo::load(&dl.target) {
        Ok(loaded) if loaded.count() > 0 && loaded.size() > 0 => {
            if resumable(&loaded) {
                tracing::debug!(
                    "resuming {} with {} chunks",
                    dl.target.display(),
                    loaded.count()
                );
                return Ok((loaded, true));
            }
            tracing::warn!(
                "chunk files for {} exceed their ranges, restarting",
                dl.target.display()
            );
            discard_layout(&loaded);
        }
        Ok(_) => {}
        Err(SidecarError::WrongFormat) => {
            tracing::warn!(
                "malformed chunk sidecar for {}, restarting from zero",
                dl.target.display()
            );
            ChunkInfo::new(&dl.target).remove();
        }
        Err(SidecarError::Io(_)) => {}
    }
    Ok((ChunkInfo::new(&dl.target), false))
}

/// A layout resumes only when every chunk file fits inside its range.
fn resumable(info: &ChunkInfo) -> bool {
    (0..info.count()).all(|i| chunk_file_len(info, i) <= info.chunk_len(i))
}

fn chunk_file_len(info: &ChunkInfo, index: usize) -> u64 {
    std::fs::metadata(info.chunk_name(index))
        .map(|m| m.len())
        .unwrap_or(0)
}

fn discard_layout(info: &ChunkInfo) {
    for i in 0..info.count() {
        let _ = std::fs::remove_file(info.chunk_name(i));
    }
    info.remove();
}

/// After the bootstrap headers arrive: fix the layout and fan out the
/// remaining chunks. Falls back to a bounded single stream when the server
/// lacks range support.
fn split_into_chunks(
    dl: &HttpDownload,
    multi: &curl::multi::Multi,
    shared: &Arc<ChunkShared>,
    info: &mut ChunkInfo,
    active: &mut Vec<(usize, curl::multi::Easy2Handle<ChunkHandler>)>,
) -> Result<()> {
    let size = shared.size.load(Ordering::Relaxed);
    if size == 0 {
        return Ok(());
    }
    let support = shared.chunk_support.load(Ordering::Relaxed);
    let want = if support { dl.chunk_count } else { 1 };

    info.set_size(size);
    info.create_chunks(want.max(1));

    // Bound the in-flight bootstrap chunk to its share.
    if let Some((_, handle)) = active.iter_mut().find(|(i, _)| *i == 0) {
        handle.get_mut().set_expected(info.chunk_len(0));
    }

    if info.count() > 1 {
        info.save().context("failed to write chunk sidecar")?;
        tracing::debug!("split {} into {} chunks", dl.target.display(), info.count());
        for i in 1..info.count() {
            let path = info.chunk_name(i).to_path_buf();
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let handler =
                ChunkHandler::new(i, Arc::clone(shared), file, info.chunk_len(i), 0, false);
            let (start, end) = info.chunk_range(i);
            let range = if i == info.count() - 1 {
                // Last chunk: no explicit end, tolerating servers that put
                // the final byte off by one.
                format!("{}-", start)
            } else {
                format!("{}-{}", start, end)
            };
            let handle = add_transfer(multi, dl, handler, Some(&range))?;
            active.push((i, handle));
        }
    }
    Ok(())
}

fn add_resumed_chunk(
    multi: &curl::multi::Multi,
    dl: &HttpDownload,
    shared: &Arc<ChunkShared>,
    info: &ChunkInfo,
    index: usize,
    on_disk: u64,
) -> Result<curl::multi::Easy2Handle<ChunkHandler>> {
    let path = info.chunk_name(index);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let handler = ChunkHandler::new(
        index,
        Arc::clone(shared),
        file,
        info.chunk_len(index),
        on_disk,
        false,
    );
    let (start, end) = info.chunk_range(index);
    let range = if index == info.count() - 1 {
        format!("{}-", start + on_disk)
    } else {
        format!("{}-{}", start + on_disk, end)
    };
    tracing::debug!("chunk {} resumes with range {}", index, range);
    add_transfer(multi, dl, handler, Some(&range))
}

/// Configure one Easy2 transfer and add it to the multi handle.
fn add_transfer(
    multi: &curl::multi::Multi,
    dl: &HttpDownload,
    handler: ChunkHandler,
    range: Option<&str>,
) -> Result<curl::multi::Easy2Handle<ChunkHandler>> {
    let mut easy = curl::easy::Easy2::new(handler);
    easy.url(&dl.url).context("invalid URL")?;
    easy.useragent(concat!("drover/", env!("CARGO_PKG_VERSION")))
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    easy.follow_location(true)
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    easy.max_redirections(10)
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    easy.connect_timeout(Duration::from_secs(30))
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    easy.low_speed_limit(1024)
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    easy.low_speed_time(Duration::from_secs(60))
        .map_err(|e| anyhow::anyhow!("curl: {}", e))?;

    if let Some(range) = range {
        easy.range(range).map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    }
    if let Some(referer) = &dl.referer {
        easy.referer(referer)
            .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    }
    if let Some(cookies) = &dl.cookies {
        easy.cookie(cookies)
            .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    }
    if let Some(body) = &dl.post {
        easy.post(true).map_err(|e| anyhow::anyhow!("curl: {}", e))?;
        easy.post_fields_copy(body.as_bytes())
            .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    }
    if !dl.headers.is_empty() {
        let mut list = curl::easy::List::new();
        for (k, v) in &dl.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))
                .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
        }
        easy.http_headers(list)
            .map_err(|e| anyhow::anyhow!("curl: {}", e))?;
    }

    multi
        .add2(easy)
        .map_err(|e| anyhow::anyhow!("curl multi add: {}", e))
}

/// Final output path, honoring a content-disposition rename.
fn final_path_for(dl: &HttpDownload, shared: &ChunkShared) -> PathBuf {
    let disposition = shared.disposition.lock().unwrap().clone();
    match disposition {
        Some(name) => {
            let name = sanitize_filename(&name);
            if name.is_empty() {
                dl.target.clone()
            } else {
                dl.target.with_file_name(name)
            }
        }
        None => dl.target.clone(),
    }
}

/// Concatenate chunk files into the target and remove them plus the sidecar.
fn merge_chunks(info: &ChunkInfo, target: &std::path::Path, final_path: &std::path::Path) -> Result<()> {
    let count = info.count();
    if count <= 1 {
        // Single stream: the lone chunk file becomes the output.
        let chunk0 = ChunkInfo::chunk_path(target, 0);
        std::fs::rename(&chunk0, final_path).with_context(|| {
            format!("failed to move {} to {}", chunk0.display(), final_path.display())
        })?;
        info.remove();
        return Ok(());
    }

    let mut out = File::create(final_path)
        .with_context(|| format!("failed to create {}", final_path.display()))?;
    for i in 0..count {
        let path = info.chunk_name(i);
        let mut part = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        std::io::copy(&mut part, &mut out)
            .with_context(|| format!("failed to append chunk {}", i))?;
    }
    out.sync_all().context("failed to sync merged output")?;
    drop(out);

    for i in 0..count {
        let _ = std::fs::remove_file(info.chunk_name(i));
    }
    info.remove();
    Ok(())
}
