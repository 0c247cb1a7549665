//! File store boundary.
//!
//! The engine consumes packages and files through this trait; how they are
//! persisted is not its concern. The store owns job ordering and the
//! deferred-job cache; the scheduler never reorders. [`memory::MemoryStore`]
//! backs the CLI and the test suites.

pub mod memory;

use crate::error::CoreError;
use crate::file::{FileId, FileRef};
use crate::package::{Destination, PackageId, PackageRef, PackageStats};

pub trait FileStore: Send + Sync {
    // -- scheduler-facing --------------------------------------------------

    /// Highest-priority ready job whose plugin is not in `occupied`.
    /// The returned file is marked processing; hand it back via `release`.
    fn next_job(&self, occupied: &[String]) -> Option<FileRef>;

    /// Next ready job handled by a decrypter plugin (runs off-slot).
    fn next_decrypt_job(&self) -> Option<FileRef>;

    /// Park a job that could not get a slot, keyed by the occupied set that
    /// was current when it was pulled.
    fn defer_job(&self, occupied: &[String], fid: FileId);

    /// Return a file after processing; non-terminal files go back to queued.
    fn release(&self, file: &FileRef);

    // -- contents ----------------------------------------------------------

    fn add_package(&self, name: &str, folder: &str, destination: Destination) -> PackageId;

    /// Append `(url, plugin)` links to a package; returns the new file ids.
    fn add_links(&self, pid: PackageId, links: &[(String, String)]) -> Vec<FileId>;

    fn package(&self, pid: PackageId) -> Option<PackageRef>;
    fn file(&self, fid: FileId) -> Option<FileRef>;

    /// Packages of one destination, ordered.
    fn packages(&self, destination: Destination) -> Vec<PackageRef>;

    /// Files of one package, ordered.
    fn package_files(&self, pid: PackageId) -> Vec<FileRef>;

    /// Every file in the store (both destinations).
    fn all_files(&self) -> Vec<FileRef>;

    fn delete_package(&self, pid: PackageId) -> Result<(), CoreError>;
    fn delete_file(&self, fid: FileId) -> Result<(), CoreError>;

    fn set_package_destination(&self, pid: PackageId, destination: Destination);

    /// Move a package/file to `position` within its ordering; peers shift.
    fn reorder_package(&self, pid: PackageId, position: u32);
    fn reorder_file(&self, fid: FileId, position: u32);

    fn package_stats(&self, pid: PackageId) -> PackageStats;

    /// Count of files still waiting in the queue destination.
    fn queue_count(&self) -> usize;
    fn file_count(&self) -> usize;

    fn restart_file(&self, fid: FileId);
    fn restart_package(&self, pid: PackageId);
    /// Reset every failed file to queued.
    fn restart_failed(&self);

    /// Drop finished files and now-empty packages; returns removed packages.
    fn delete_finished(&self) -> Vec<PackageId>;
}
