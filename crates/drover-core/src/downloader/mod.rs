//! Chunked HTTP/FTP downloader.
//!
//! Owns one transfer per file: chunk 0 bootstraps alone to read response
//! headers, then up to K parallel range-chunks run over one `curl::multi`
//! handle, each writing its own chunk file. Progress persists through the
//! `.chunks` sidecar so an interrupted transfer resumes across restarts;
//! finished chunks are merged into the target in index order.

mod chunk;
pub mod info;
mod run;

pub use info::{ChunkInfo, SidecarError};

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;

use crate::bucket::BandwidthBucket;

/// Snapshot handed to the progress callback during a transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadProgress {
    /// Bytes on disk across all chunks.
    pub arrived: u64,
    /// Total size; 0 while unknown.
    pub size: u64,
    /// Smoothed rate in bytes/s.
    pub speed: u64,
}

pub type ProgressFn = dyn Fn(DownloadProgress) + Send + Sync;

/// One file transfer. Build with the setters, then call [`HttpDownload::download`].
pub struct HttpDownload {
    url: String,
    target: PathBuf,
    post: Option<String>,
    referer: Option<String>,
    cookies: Option<String>,
    headers: Vec<(String, String)>,
    chunk_count: usize,
    bucket: Option<Arc<BandwidthBucket>>,
    abort: Arc<AtomicBool>,
    progress: Option<Box<ProgressFn>>,
}

impl HttpDownload {
    pub fn new(url: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        HttpDownload {
            url: url.into(),
            target: target.into(),
            post: None,
            referer: None,
            cookies: None,
            headers: Vec::new(),
            chunk_count: 1,
            bucket: None,
            abort: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Request body; switches the initial request to POST.
    pub fn post(mut self, body: impl Into<String>) -> Self {
        self.post = Some(body.into());
        self
    }

    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Cookie header value (`name=value; name2=value2`).
    pub fn cookies(mut self, cookies: impl Into<String>) -> Self {
        self.cookies = Some(cookies.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Desired parallel chunks; clamped to 1 when the server lacks range
    /// support or the size is unknown.
    pub fn chunks(mut self, count: usize) -> Self {
        self.chunk_count = count.max(1);
        self
    }

    /// Attach the shared bandwidth bucket; chunk writes sleep as it advises.
    pub fn bucket(mut self, bucket: Arc<BandwidthBucket>) -> Self {
        self.bucket = Some(bucket);
        self
    }

    /// Abort token observed by every chunk write; typically the owning
    /// file's token so `stop_downloads` reaches the transport.
    pub fn abort_token(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn on_progress(mut self, f: impl Fn(DownloadProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Run the transfer to completion and return the final output path
    /// (content-disposition may override the requested name).
    ///
    /// Blocks the calling thread. Network failures leave chunk files and the
    /// sidecar in place for a later resume; an abort surfaces as
    /// [`crate::error::Aborted`].
    pub fn download(&self) -> Result<PathBuf> {
        run::run(self)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_clamps_to_one() {
        let dl = HttpDownload::new("http://h/f", "/tmp/f").chunks(0);
        assert_eq!(dl.chunk_count, 1);
    }

    #[test]
    fn builder_accumulates_headers() {
        let dl = HttpDownload::new("http://h/f", "/tmp/f")
            .header("X-Token", "abc")
            .header("X-Other", "def")
            .referer("http://h/")
            .cookies("session=1");
        assert_eq!(dl.headers.len(), 2);
        assert_eq!(dl.referer.as_deref(), Some("http://h/"));
        assert_eq!(dl.cookies.as_deref(), Some("session=1"));
    }
}
