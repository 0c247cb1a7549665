//! Shared file entry: the unit of work handed to worker slots.
//!
//! A file is owned by at most one slot at a time; other components read
//! snapshots. Mutable fields are atomics or small mutexed cells so slots,
//! the scheduler, and API callers never contend on a single big lock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::package::PackageId;
use crate::utils::unix_now;

pub type FileId = u64;

/// Lifecycle states of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Queued,
    Decrypting,
    Online,
    Offline,
    Waiting,
    Downloading,
    Failed,
    Aborted,
    Finished,
    Skipped,
    Processing,
    Unknown,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Queued => "queued",
            FileStatus::Decrypting => "decrypting",
            FileStatus::Online => "online",
            FileStatus::Offline => "offline",
            FileStatus::Waiting => "waiting",
            FileStatus::Downloading => "downloading",
            FileStatus::Failed => "failed",
            FileStatus::Aborted => "aborted",
            FileStatus::Finished => "finished",
            FileStatus::Skipped => "skipped",
            FileStatus::Processing => "processing",
            FileStatus::Unknown => "unknown",
        }
    }

    /// Terminal states: the file will not be picked up again without a restart.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileStatus::Failed
                | FileStatus::Aborted
                | FileStatus::Finished
                | FileStatus::Skipped
                | FileStatus::Offline
        )
    }
}

/// One download entry. Shared as `FileRef`; created by the store.
pub struct FileEntry {
    pub id: FileId,
    pub url: String,
    pub plugin_name: String,
    pub package_id: PackageId,

    name: RwLock<String>,
    status: Mutex<FileStatus>,
    error: Mutex<Option<String>>,
    size: AtomicU64,
    bytes_done: AtomicU64,
    /// Smoothed transfer rate in bytes/s, updated by the downloader.
    speed: AtomicU64,
    /// Unix seconds until which the plugin is waiting; 0 = not waiting.
    wait_until: AtomicI64,
    order: AtomicU32,
    /// Shared with the transport so a stop request reaches the next write
    /// callback directly.
    abort: Arc<AtomicBool>,
}

pub type FileRef = Arc<FileEntry>;

impl FileEntry {
    pub fn new(
        id: FileId,
        url: impl Into<String>,
        plugin_name: impl Into<String>,
        package_id: PackageId,
        order: u32,
    ) -> FileRef {
        let url = url.into();
        let name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&url)
            .to_string();
        Arc::new(FileEntry {
            id,
            url,
            plugin_name: plugin_name.into(),
            package_id,
            name: RwLock::new(name),
            status: Mutex::new(FileStatus::Queued),
            error: Mutex::new(None),
            size: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            speed: AtomicU64::new(0),
            wait_until: AtomicI64::new(0),
            order: AtomicU32::new(order),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write().unwrap() = name.to_string();
    }

    pub fn status(&self) -> FileStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: FileStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    pub fn set_error(&self, msg: impl Into<String>) {
        *self.error.lock().unwrap() = Some(msg.into());
    }

    pub fn clear_error(&self) {
        *self.error.lock().unwrap() = None;
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn set_bytes_done(&self, n: u64) {
        self.bytes_done.store(n, Ordering::Relaxed);
    }

    pub fn bytes_left(&self) -> u64 {
        self.size().saturating_sub(self.bytes_done())
    }

    pub fn percent(&self) -> u8 {
        let size = self.size();
        if size == 0 {
            return 0;
        }
        ((self.bytes_done() * 100) / size).min(100) as u8
    }

    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn set_speed(&self, bytes_per_sec: u64) {
        self.speed.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Seconds until completion at the current rate; `None` when unknown.
    pub fn eta_secs(&self) -> Option<u64> {
        let speed = self.speed();
        if speed == 0 {
            return None;
        }
        Some(self.bytes_left() / speed)
    }

    pub fn wait_until(&self) -> i64 {
        self.wait_until.load(Ordering::Relaxed)
    }

    pub fn set_wait(&self, seconds: i64) {
        self.wait_until
            .store(unix_now() + seconds, Ordering::Relaxed);
        self.set_status(FileStatus::Waiting);
    }

    /// True while the plugin-imposed wait window is still running.
    pub fn is_waiting(&self) -> bool {
        self.wait_until() > unix_now()
    }

    pub fn order(&self) -> u32 {
        self.order.load(Ordering::Relaxed)
    }

    pub fn set_order(&self, order: u32) {
        self.order.store(order, Ordering::Relaxed);
    }

    /// Request the owning transfer to stop at the next write callback.
    pub fn abort_download(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Token observed by the chunk write callbacks of this file's transfer.
    pub fn abort_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::Relaxed);
    }

    /// Reset to queued for a fresh attempt.
    pub fn restart(&self) {
        self.clear_abort();
        self.clear_error();
        self.set_bytes_done(0);
        self.set_speed(0);
        self.wait_until.store(0, Ordering::Relaxed);
        self.set_status(FileStatus::Queued);
    }
}

impl std::fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEntry")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("plugin", &self.plugin_name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_derived_from_url_tail() {
        let f = FileEntry::new(1, "http://host/path/archive.bin", "http", 1, 0);
        assert_eq!(f.name(), "archive.bin");
    }

    #[test]
    fn percent_and_bytes_left() {
        let f = FileEntry::new(1, "http://host/f", "http", 1, 0);
        f.set_size(200);
        f.set_bytes_done(50);
        assert_eq!(f.percent(), 25);
        assert_eq!(f.bytes_left(), 150);
    }

    #[test]
    fn abort_flag_round_trip() {
        let f = FileEntry::new(1, "http://host/f", "http", 1, 0);
        assert!(!f.abort_requested());
        f.abort_download();
        assert!(f.abort_requested());
        f.restart();
        assert!(!f.abort_requested());
        assert_eq!(f.status(), FileStatus::Queued);
    }

    #[test]
    fn wait_window() {
        let f = FileEntry::new(1, "http://host/f", "http", 1, 0);
        assert!(!f.is_waiting());
        f.set_wait(60);
        assert!(f.is_waiting());
        assert_eq!(f.status(), FileStatus::Waiting);
    }
}
