//! Easy2 handler for one chunk transfer.
//!
//! Chunk 0 runs without a range first ("bootstrap") and parses response
//! headers into the shared state: content-length fixes the total size,
//! `Accept-Ranges: bytes` (or an FTP size line) enables multi-chunking, and
//! content-disposition may rename the target. Ranged chunks skip header
//! parsing and clamp writes to their range so over-sending servers cannot
//! corrupt the merge.

use std::fs::File;
use std::io::Write;
use std::str;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bucket::BandwidthBucket;

/// State shared between all chunk handlers of one download.
pub(super) struct ChunkShared {
    /// Total resource size; 0 until known.
    pub size: AtomicU64,
    /// Server supports byte ranges (header or FTP size line seen).
    pub chunk_support: AtomicBool,
    /// Response headers of the bootstrap chunk have been fully parsed.
    pub headers_done: AtomicBool,
    /// Filename override from content-disposition.
    pub disposition: Mutex<Option<String>>,
    /// User abort; every write callback observes this.
    pub abort: Arc<AtomicBool>,
    pub bucket: Option<Arc<BandwidthBucket>>,
}

impl ChunkShared {
    pub fn new(abort: Arc<AtomicBool>, bucket: Option<Arc<BandwidthBucket>>) -> Arc<Self> {
        Arc::new(ChunkShared {
            size: AtomicU64::new(0),
            chunk_support: AtomicBool::new(false),
            headers_done: AtomicBool::new(false),
            disposition: Mutex::new(None),
            abort,
            bucket,
        })
    }
}

pub(super) struct ChunkHandler {
    pub index: usize,
    shared: Arc<ChunkShared>,
    file: Option<File>,
    /// Bytes this chunk must deliver; 0 = unbounded (size unknown).
    expected: u64,
    /// Bytes on disk for this chunk, including any resumed prefix.
    arrived: u64,
    /// Bootstrap chunk: parse headers, strip BOM.
    bootstrap: bool,
    header_lines: Vec<String>,
    bom_checked: bool,
    /// Range satisfied; a short write ended the transfer on purpose.
    range_complete: bool,
    /// Adaptive self-throttle state (no bucket attached).
    sleep: Duration,
    last_size: usize,
}

impl ChunkHandler {
    pub fn new(
        index: usize,
        shared: Arc<ChunkShared>,
        file: File,
        expected: u64,
        resumed: u64,
        bootstrap: bool,
    ) -> Self {
        ChunkHandler {
            index,
            shared,
            file: Some(file),
            expected,
            arrived: resumed,
            bootstrap,
            header_lines: Vec::new(),
            // A resumed chunk is past byte 0; nothing to strip.
            bom_checked: !bootstrap || resumed > 0,
            range_complete: false,
            sleep: Duration::ZERO,
            last_size: 0,
        }
    }

    pub fn arrived(&self) -> u64 {
        self.arrived
    }

    /// Bound this chunk after the layout is planned mid-transfer (chunk 0
    /// keeps running while the remaining chunks are added).
    pub fn set_expected(&mut self, expected: u64) {
        self.expected = expected;
        if expected > 0 && self.arrived >= expected {
            self.range_complete = true;
        }
    }

    pub fn range_complete(&self) -> bool {
        self.range_complete
    }

    /// True when the chunk delivered everything it was asked for.
    pub fn is_satisfied(&self) -> bool {
        self.range_complete || (self.expected > 0 && self.arrived >= self.expected)
    }

    /// Flush, fsync and close the chunk file. Must happen before merging.
    pub fn finish_file(&mut self) -> std::io::Result<()> {
        if let Some(mut fp) = self.file.take() {
            fp.flush()?;
            fp.sync_all()?;
        }
        Ok(())
    }

    fn parse_headers(&mut self) {
        for raw in &self.header_lines {
            let line = raw.trim().to_ascii_lowercase();
            if line.starts_with("accept-ranges") && line.contains("bytes") {
                self.shared.chunk_support.store(true, Ordering::Relaxed);
            }
            if line.starts_with("content-disposition") && line.contains("filename=") {
                if let Some(name) = raw.split_once("filename=").map(|(_, n)| n) {
                    let name = name
                        .trim()
                        .trim_matches(|c| c == '"' || c == '\'' || c == ';')
                        .trim();
                    if !name.is_empty() {
                        tracing::debug!("content-disposition: {}", name);
                        *self.shared.disposition.lock().unwrap() = Some(name.to_string());
                    }
                }
            }
            if line.starts_with("content-length") {
                if let Some(len) = line
                    .split_once(':')
                    .and_then(|(_, v)| v.trim().parse::<u64>().ok())
                {
                    self.shared.size.store(len, Ordering::Relaxed);
                }
            }
        }
        self.shared.headers_done.store(true, Ordering::Relaxed);
    }
}

impl curl::easy::Handler for ChunkHandler {
    fn header(&mut self, data: &[u8]) -> bool {
        if !self.bootstrap {
            return true;
        }
        let Ok(s) = str::from_utf8(data) else {
            return true;
        };
        let line = s.trim_end();

        if line.starts_with("HTTP/") {
            // A redirect starts a fresh header block.
            self.header_lines.clear();
            self.header_lines.push(line.to_string());
            return true;
        }

        // FTP transfers announce the size in the 150 status line.
        if line.starts_with("150") && line.contains("data connection") {
            if let Some(size) = line
                .split('(')
                .nth(1)
                .and_then(|s| s.split_whitespace().next())
                .and_then(|s| s.parse::<u64>().ok())
            {
                self.shared.size.store(size, Ordering::Relaxed);
                self.shared.chunk_support.store(true, Ordering::Relaxed);
            }
            return true;
        }

        if line.is_empty() {
            self.parse_headers();
        } else {
            self.header_lines.push(line.to_string());
        }
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, curl::easy::WriteError> {
        if self.shared.abort.load(Ordering::Relaxed) {
            return Ok(0);
        }
        // Headers are done once the body starts flowing.
        if self.bootstrap && !self.shared.headers_done.load(Ordering::Relaxed) {
            self.shared.headers_done.store(true, Ordering::Relaxed);
        }

        let mut buf = data;
        if !self.bom_checked {
            // A UTF-8 BOM at byte 0 confuses downstream unpackers; drop it.
            if self.arrived == 0 && buf.starts_with(&[0xEF, 0xBB, 0xBF]) {
                buf = &buf[3..];
            }
            self.bom_checked = true;
        }

        // Clamp to the chunk's remaining budget so an over-sending server
        // (off-by-one range arithmetic) cannot spill into the next chunk.
        let mut clamped = false;
        if self.expected > 0 {
            let remaining = self.expected.saturating_sub(self.arrived);
            if buf.len() as u64 > remaining {
                buf = &buf[..remaining as usize];
                clamped = true;
            }
        }

        if let Some(fp) = self.file.as_mut() {
            if let Err(err) = fp.write_all(buf) {
                tracing::warn!("chunk {} write failed: {}", self.index, err);
                return Ok(0);
            }
        }
        self.arrived += buf.len() as u64;

        let received = data.len();
        if let Some(bucket) = &self.shared.bucket {
            let pause = bucket.consumed(received);
            if pause > Duration::ZERO {
                std::thread::sleep(pause);
            }
        } else {
            // Adaptive self-throttle: shrinking buffers mean we poll faster
            // than the server delivers, so back off; otherwise decay the
            // sleep toward zero. Converges to steady buffer sizes without
            // burning CPU on tiny reads.
            if received < self.last_size {
                self.sleep += Duration::from_millis(2);
            } else {
                self.sleep = self.sleep.mul_f64(0.7);
            }
            self.last_size = received;
            if self.sleep > Duration::ZERO {
                std::thread::sleep(self.sleep);
            }
        }

        if self.expected > 0 && self.arrived >= self.expected {
            self.range_complete = true;
            if clamped {
                // Short count ends the transfer; the run loop treats a
                // satisfied range as success.
                return Ok(buf.len());
            }
        }
        Ok(received)
    }
}
