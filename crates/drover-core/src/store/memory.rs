//! In-memory file store used by the CLI and the test suites.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use crate::error::CoreError;
use crate::events::{CoreEvent, ElementType, EventBus, EventKind};
use crate::file::{FileEntry, FileId, FileRef, FileStatus};
use crate::package::{Destination, PackageEntry, PackageId, PackageRef, PackageStats};

use super::FileStore;

struct Inner {
    packages: BTreeMap<PackageId, PackageRef>,
    files: BTreeMap<FileId, FileRef>,
    /// File membership per package, kept in insertion order; the files'
    /// `order` fields are authoritative for scheduling.
    members: BTreeMap<PackageId, Vec<FileId>>,
    /// Deferred jobs keyed by the occupied set current at defer time.
    deferred: HashMap<Vec<String>, Vec<FileId>>,
    next_pid: PackageId,
    next_fid: FileId,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: Arc<EventBus>,
    /// Plugin names handled off-slot by decrypters.
    decrypters: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        MemoryStore {
            inner: Mutex::new(Inner {
                packages: BTreeMap::new(),
                files: BTreeMap::new(),
                members: BTreeMap::new(),
                deferred: HashMap::new(),
                next_pid: 1,
                next_fid: 1,
            }),
            events,
            decrypters: RwLock::new(HashSet::new()),
        }
    }

    /// Declare which plugin names are decrypters; their files are only
    /// handed out via `next_decrypt_job`.
    pub fn set_decrypter_plugins(&self, names: impl IntoIterator<Item = String>) {
        *self.decrypters.write().unwrap() = names.into_iter().collect();
    }

    fn is_decrypter(&self, plugin: &str) -> bool {
        self.decrypters.read().unwrap().contains(plugin)
    }

    /// Queue packages in order, then their files in order, filtered to ready
    /// candidates. Marks the winner processing under the same lock so no two
    /// callers can pull the same file.
    fn pull_ready(&self, filter: impl Fn(&FileRef) -> bool) -> Option<FileRef> {
        let inner = self.inner.lock().unwrap();
        let mut packages: Vec<&PackageRef> = inner
            .packages
            .values()
            .filter(|p| p.destination() == Destination::Queue)
            .collect();
        packages.sort_by_key(|p| (p.order(), p.id));

        for package in packages {
            let Some(members) = inner.members.get(&package.id) else {
                continue;
            };
            let mut files: Vec<&FileRef> =
                members.iter().filter_map(|fid| inner.files.get(fid)).collect();
            files.sort_by_key(|f| (f.order(), f.id));
            for file in files {
                if file.status() != FileStatus::Queued || file.is_waiting() {
                    continue;
                }
                if !filter(file) {
                    continue;
                }
                file.set_status(FileStatus::Processing);
                return Some(Arc::clone(file));
            }
        }
        None
    }

    fn push_event(&self, kind: EventKind, destination: Destination, element: ElementType, id: u64) {
        self.events
            .push(CoreEvent::changed(kind, destination, element, id));
    }

    /// Reassign contiguous orders after a move: stable sort by (order, id),
    /// then number 0..n. One deterministic pass, no collision loops.
    fn normalize_package_orders(inner: &Inner, destination: Destination) {
        let mut packs: Vec<&PackageRef> = inner
            .packages
            .values()
            .filter(|p| p.destination() == destination)
            .collect();
        packs.sort_by_key(|p| (p.order(), p.id));
        for (i, p) in packs.iter().enumerate() {
            p.set_order(i as u32);
        }
    }

    fn normalize_file_orders(inner: &Inner, pid: PackageId) {
        let Some(members) = inner.members.get(&pid) else {
            return;
        };
        let mut files: Vec<&FileRef> =
            members.iter().filter_map(|fid| inner.files.get(fid)).collect();
        files.sort_by_key(|f| (f.order(), f.id));
        for (i, f) in files.iter().enumerate() {
            f.set_order(i as u32);
        }
    }
}

impl FileStore for MemoryStore {
    fn next_job(&self, occupied: &[String]) -> Option<FileRef> {
        // Deferred jobs parked under this exact occupied set go first.
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(ids) = inner.deferred.remove(occupied) {
                let mut chosen = None;
                let mut rest = Vec::new();
                for fid in ids {
                    if chosen.is_some() {
                        rest.push(fid);
                        continue;
                    }
                    match inner.files.get(&fid) {
                        Some(file) if file.status() == FileStatus::Queued && !file.is_waiting() => {
                            file.set_status(FileStatus::Processing);
                            chosen = Some(Arc::clone(file));
                        }
                        _ => {}
                    }
                }
                if !rest.is_empty() {
                    inner.deferred.insert(occupied.to_vec(), rest);
                }
                if chosen.is_some() {
                    return chosen;
                }
            }
        }

        self.pull_ready(|f| !occupied.iter().any(|p| p == &f.plugin_name))
    }

    fn next_decrypt_job(&self) -> Option<FileRef> {
        self.pull_ready(|f| self.is_decrypter(&f.plugin_name))
    }

    fn defer_job(&self, occupied: &[String], fid: FileId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.files.get(&fid) {
            // Back to queued so a later pull can claim it again.
            if file.status() == FileStatus::Processing {
                file.set_status(FileStatus::Queued);
            }
        }
        inner
            .deferred
            .entry(occupied.to_vec())
            .or_default()
            .push(fid);
    }

    fn release(&self, file: &FileRef) {
        if !file.status().is_terminal() && file.status() != FileStatus::Waiting {
            file.set_status(FileStatus::Queued);
        }
        if let Some(package) = self.package(file.package_id) {
            self.push_event(
                EventKind::Update,
                package.destination(),
                ElementType::File,
                file.id,
            );
        }
    }

    fn add_package(&self, name: &str, folder: &str, destination: Destination) -> PackageId {
        let mut inner = self.inner.lock().unwrap();
        let pid = inner.next_pid;
        inner.next_pid += 1;
        let order = inner
            .packages
            .values()
            .filter(|p| p.destination() == destination)
            .count() as u32;
        let package = PackageEntry::new(pid, name, folder, destination, order);
        inner.packages.insert(pid, package);
        inner.members.insert(pid, Vec::new());
        drop(inner);
        self.push_event(EventKind::Insert, destination, ElementType::Package, pid);
        pid
    }

    fn add_links(&self, pid: PackageId, links: &[(String, String)]) -> Vec<FileId> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.packages.contains_key(&pid) {
            return Vec::new();
        }
        let destination = inner.packages[&pid].destination();
        let base_order = inner.members.get(&pid).map(|m| m.len()).unwrap_or(0) as u32;
        let mut ids = Vec::with_capacity(links.len());
        for (i, (url, plugin)) in links.iter().enumerate() {
            let fid = inner.next_fid;
            inner.next_fid += 1;
            let file = FileEntry::new(fid, url.clone(), plugin.clone(), pid, base_order + i as u32);
            inner.files.insert(fid, file);
            inner.members.get_mut(&pid).unwrap().push(fid);
            ids.push(fid);
        }
        drop(inner);
        for fid in &ids {
            self.push_event(EventKind::Insert, destination, ElementType::File, *fid);
        }
        ids
    }

    fn package(&self, pid: PackageId) -> Option<PackageRef> {
        self.inner.lock().unwrap().packages.get(&pid).cloned()
    }

    fn file(&self, fid: FileId) -> Option<FileRef> {
        self.inner.lock().unwrap().files.get(&fid).cloned()
    }

    fn packages(&self, destination: Destination) -> Vec<PackageRef> {
        let inner = self.inner.lock().unwrap();
        let mut packs: Vec<PackageRef> = inner
            .packages
            .values()
            .filter(|p| p.destination() == destination)
            .cloned()
            .collect();
        packs.sort_by_key(|p| (p.order(), p.id));
        packs
    }

    fn package_files(&self, pid: PackageId) -> Vec<FileRef> {
        let inner = self.inner.lock().unwrap();
        let mut files: Vec<FileRef> = inner
            .members
            .get(&pid)
            .map(|m| m.iter().filter_map(|fid| inner.files.get(fid)).cloned().collect())
            .unwrap_or_default();
        files.sort_by_key(|f| (f.order(), f.id));
        files
    }

    fn all_files(&self) -> Vec<FileRef> {
        self.inner.lock().unwrap().files.values().cloned().collect()
    }

    fn delete_package(&self, pid: PackageId) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        let package = inner
            .packages
            .remove(&pid)
            .ok_or(CoreError::PackageDoesNotExists(pid))?;
        let destination = package.destination();
        if let Some(members) = inner.members.remove(&pid) {
            for fid in members {
                if let Some(file) = inner.files.remove(&fid) {
                    file.abort_download();
                }
            }
        }
        Self::normalize_package_orders(&inner, destination);
        drop(inner);
        self.push_event(EventKind::Remove, destination, ElementType::Package, pid);
        Ok(())
    }

    fn delete_file(&self, fid: FileId) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .files
            .remove(&fid)
            .ok_or(CoreError::FileDoesNotExists(fid))?;
        file.abort_download();
        let pid = file.package_id;
        if let Some(members) = inner.members.get_mut(&pid) {
            members.retain(|id| *id != fid);
        }
        Self::normalize_file_orders(&inner, pid);
        let destination = inner
            .packages
            .get(&pid)
            .map(|p| p.destination())
            .unwrap_or(Destination::Queue);
        drop(inner);
        self.push_event(EventKind::Remove, destination, ElementType::File, fid);
        Ok(())
    }

    fn set_package_destination(&self, pid: PackageId, destination: Destination) {
        let Some(package) = self.package(pid) else {
            return;
        };
        let old = package.destination();
        if old == destination {
            return;
        }
        package.set_destination(destination);
        {
            let inner = self.inner.lock().unwrap();
            Self::normalize_package_orders(&inner, old);
            Self::normalize_package_orders(&inner, destination);
        }
        self.push_event(EventKind::Remove, old, ElementType::Package, pid);
        self.push_event(EventKind::Insert, destination, ElementType::Package, pid);
    }

    fn reorder_package(&self, pid: PackageId, position: u32) {
        let Some(package) = self.package(pid) else {
            return;
        };
        let destination = package.destination();
        {
            let inner = self.inner.lock().unwrap();
            // Peers at or past the slot shift down; the normalize pass
            // resolves the tie deterministically with the moved package first.
            for peer in inner.packages.values() {
                if peer.id != pid
                    && peer.destination() == destination
                    && peer.order() >= position
                {
                    peer.set_order(peer.order() + 1);
                }
            }
            package.set_order(position);
            Self::normalize_package_orders(&inner, destination);
        }
        self.push_event(EventKind::Order, destination, ElementType::Package, pid);
    }

    fn reorder_file(&self, fid: FileId, position: u32) {
        let Some(file) = self.file(fid) else {
            return;
        };
        let pid = file.package_id;
        let destination = self
            .package(pid)
            .map(|p| p.destination())
            .unwrap_or(Destination::Queue);
        {
            let inner = self.inner.lock().unwrap();
            if let Some(members) = inner.members.get(&pid) {
                for peer_id in members {
                    if let Some(peer) = inner.files.get(peer_id) {
                        if peer.id != fid && peer.order() >= position {
                            peer.set_order(peer.order() + 1);
                        }
                    }
                }
            }
            file.set_order(position);
            Self::normalize_file_orders(&inner, pid);
        }
        self.push_event(EventKind::Order, destination, ElementType::File, fid);
    }

    fn package_stats(&self, pid: PackageId) -> PackageStats {
        let files = self.package_files(pid);
        let mut stats = PackageStats::default();
        for file in &files {
            stats.links_total += 1;
            stats.size_total += file.size();
            stats.size_done += file.bytes_done();
            if matches!(file.status(), FileStatus::Finished | FileStatus::Skipped) {
                stats.links_done += 1;
            }
        }
        stats
    }

    fn queue_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .values()
            .filter(|f| {
                inner
                    .packages
                    .get(&f.package_id)
                    .map(|p| p.destination() == Destination::Queue)
                    .unwrap_or(false)
                    && !f.status().is_terminal()
            })
            .count()
    }

    fn file_count(&self) -> usize {
        self.inner.lock().unwrap().files.len()
    }

    fn restart_file(&self, fid: FileId) {
        if let Some(file) = self.file(fid) {
            file.restart();
            self.release(&file);
        }
    }

    fn restart_package(&self, pid: PackageId) {
        for file in self.package_files(pid) {
            file.restart();
        }
        if let Some(package) = self.package(pid) {
            self.events.push(CoreEvent::reload(package.destination()));
        }
    }

    fn restart_failed(&self) {
        for file in self.all_files() {
            if file.status() == FileStatus::Failed {
                file.restart();
            }
        }
    }

    fn delete_finished(&self) -> Vec<PackageId> {
        let mut inner = self.inner.lock().unwrap();
        let finished: Vec<FileId> = inner
            .files
            .values()
            .filter(|f| f.status() == FileStatus::Finished)
            .map(|f| f.id)
            .collect();
        for fid in &finished {
            if let Some(file) = inner.files.remove(fid) {
                if let Some(members) = inner.members.get_mut(&file.package_id) {
                    members.retain(|id| id != fid);
                }
            }
        }
        let empty: Vec<PackageId> = inner
            .members
            .iter()
            .filter(|(_, members)| members.is_empty())
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &empty {
            inner.packages.remove(pid);
            inner.members.remove(pid);
        }
        drop(inner);
        self.events.push(CoreEvent::reload(Destination::Queue));
        self.events.push(CoreEvent::reload(Destination::Collector));
        empty
    }
}
