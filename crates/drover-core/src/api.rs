//! Internal API surface consumed by RPC frontends and the CLI.
//!
//! Every method is listed in [`PERM_TABLE`] with the permission bits it
//! requires; admins bypass the table. Methods not listed are admin-only.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::context::Context;
use crate::error::CoreError;
use crate::events::EventKind;
use crate::file::{FileId, FileRef};
use crate::names::parse_names;
use crate::package::{Destination, PackageId};
use crate::plugin::OnlineStatus;
use crate::scheduler::{Scheduler, ALL_INFO_FETCHED};
use crate::store::FileStore;
use crate::utils::free_space;

/// Permission bits. A method requires its declared bits:
/// `method_bits == user_bits & method_bits`.
pub mod perms {
    /// Requires no permission, but login.
    pub const ALL: u32 = 0;
    pub const ADD: u32 = 1;
    pub const DELETE: u32 = 2;
    pub const STATUS: u32 = 4;
    pub const LIST: u32 = 16;
    pub const MODIFY: u32 = 32;
    pub const DOWNLOAD: u32 = 64;
    pub const SETTINGS: u32 = 128;
    pub const ACCOUNTS: u32 = 256;
    pub const LOGS: u32 = 512;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Admins hold every permission implicitly.
    Admin,
    User,
}

/// Method name → required permission bits. Kept beside the methods so the
/// RPC layer can authorize without knowing their signatures.
pub const PERM_TABLE: &[(&str, u32)] = &[
    ("pause_server", perms::STATUS),
    ("unpause_server", perms::STATUS),
    ("toggle_pause", perms::STATUS),
    ("toggle_reconnect", perms::STATUS),
    ("status_server", perms::LIST),
    ("free_space", perms::STATUS),
    ("is_time_download", perms::STATUS),
    ("is_time_reconnect", perms::STATUS),
    ("status_downloads", perms::LIST),
    ("add_package", perms::ADD),
    ("add_files", perms::ADD),
    ("parse_urls", perms::ADD),
    ("check_urls", perms::ADD),
    ("check_online_status", perms::ADD),
    ("poll_results", perms::ADD),
    ("generate_packages", perms::ADD),
    ("generate_and_add_packages", perms::ADD),
    ("check_and_add_packages", perms::ADD),
    ("delete_files", perms::DELETE),
    ("delete_packages", perms::DELETE),
    ("delete_finished", perms::DELETE),
    ("push_to_queue", perms::MODIFY),
    ("pull_from_queue", perms::MODIFY),
    ("move_package", perms::MODIFY),
    ("restart_package", perms::MODIFY),
    ("restart_file", perms::MODIFY),
    ("restart_failed", perms::MODIFY),
    ("stop_all_downloads", perms::MODIFY),
    ("stop_downloads", perms::MODIFY),
    ("set_package_name", perms::MODIFY),
    ("order_package", perms::MODIFY),
    ("order_file", perms::MODIFY),
    ("get_package_order", perms::LIST),
    ("get_file_order", perms::LIST),
    ("get_events", perms::STATUS),
    ("is_captcha_waiting", perms::STATUS),
    ("get_captcha_task", perms::STATUS),
    ("get_captcha_task_status", perms::STATUS),
    ("set_captcha_result", perms::STATUS),
    ("update_account", perms::ACCOUNTS),
    ("remove_account", perms::ACCOUNTS),
    ("get_log", perms::LOGS),
    ("set_speed_limit", perms::SETTINGS),
];

pub fn has_permission(user_bits: u32, method_bits: u32) -> bool {
    method_bits == (user_bits & method_bits)
}

/// Authorization check for one method call. Unlisted methods are admin-only.
pub fn is_authorized(method: &str, role: Role, user_bits: u32) -> bool {
    if role == Role::Admin {
        return true;
    }
    PERM_TABLE
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, bits)| has_permission(user_bits, *bits))
        .unwrap_or(false)
}

fn url_matcher() -> &'static Regex {
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| {
        Regex::new(r"(?i)(https?|ftps?)://[\w\d:#@%/;$()~_?+\-=\\.&]+").unwrap()
    })
}

/// General information about the current server state.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub paused: bool,
    pub active: usize,
    pub queue: usize,
    pub total: usize,
    /// Aggregate transfer rate in bytes/s.
    pub speed: u64,
    pub download_allowed: bool,
    pub reconnect_allowed: bool,
    pub captcha_waiting: bool,
}

/// Progress row for one running download.
#[derive(Debug, Clone)]
pub struct DownloadInfo {
    pub fid: FileId,
    pub name: String,
    pub speed: u64,
    pub eta_secs: Option<u64>,
    pub bytes_left: u64,
    pub size: u64,
    pub percent: u8,
    pub status: &'static str,
    pub package_id: PackageId,
    pub plugin: String,
}

/// Result-id plus accumulated online statuses; rid -1 means drained.
#[derive(Debug, Clone)]
pub struct OnlineCheck {
    pub rid: i64,
    pub results: HashMap<String, OnlineStatus>,
}

/// Captcha challenge as shipped over RPC; `id == -1` means none available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaTaskWire {
    pub id: i64,
    pub data: String,
    pub format: String,
    pub result_type: String,
}

impl CaptchaTaskWire {
    fn none() -> Self {
        CaptchaTaskWire {
            id: -1,
            data: String::new(),
            format: String::new(),
            result_type: String::new(),
        }
    }
}

/// Event as shipped over RPC.
///
/// `element_type` is a JSON number for update/remove/insert but the raw
/// variant name for order events — the original backend skipped the numeric
/// conversion on that branch and clients grew to depend on it.
#[derive(Debug, Clone)]
pub struct EventInfo {
    pub eventname: &'static str,
    pub id: Option<u64>,
    pub element_type: Option<serde_json::Value>,
    pub destination: Option<u8>,
}

pub struct Api {
    ctx: Arc<Context>,
    sched: Arc<Scheduler>,
}

impl Api {
    pub fn new(ctx: Arc<Context>, sched: Arc<Scheduler>) -> Self {
        Api { ctx, sched }
    }

    // -- server state ------------------------------------------------------

    /// Pause: nothing new starts, nothing gets aborted.
    pub fn pause_server(&self) {
        self.sched.pause();
    }

    pub fn unpause_server(&self) {
        self.sched.unpause();
    }

    pub fn toggle_pause(&self) -> bool {
        self.sched.toggle_pause()
    }

    pub fn toggle_reconnect(&self) -> bool {
        let mut enabled = false;
        self.ctx.update_config(|cfg| {
            cfg.reconnect.enabled = !cfg.reconnect.enabled;
            enabled = cfg.reconnect.enabled;
        });
        enabled
    }

    pub fn free_space(&self) -> u64 {
        free_space(&self.ctx.config().general.storage_folder)
    }

    pub fn is_time_download(&self) -> bool {
        self.sched.is_time_download()
    }

    pub fn is_time_reconnect(&self) -> bool {
        self.sched.is_time_reconnect()
    }

    pub fn status_server(&self) -> ServerStatus {
        let active = self.sched.get_active_files();
        ServerStatus {
            paused: self.sched.is_paused(),
            active: active.len(),
            queue: self.ctx.store.queue_count(),
            total: self.ctx.store.file_count(),
            speed: active.iter().map(|f| f.speed()).sum(),
            download_allowed: !self.sched.is_paused() && self.sched.is_time_download(),
            reconnect_allowed: self.sched.is_time_reconnect(),
            captcha_waiting: self.ctx.captcha.get_task().is_some(),
        }
    }

    pub fn status_downloads(&self) -> Vec<DownloadInfo> {
        self.sched
            .get_active_files()
            .iter()
            .map(|f| DownloadInfo {
                fid: f.id,
                name: f.name(),
                speed: f.speed(),
                eta_secs: f.eta_secs(),
                bytes_left: f.bytes_left(),
                size: f.size(),
                percent: f.percent(),
                status: f.status().as_str(),
                package_id: f.package_id,
                plugin: f.plugin_name.clone(),
            })
            .collect()
    }

    // -- adding ------------------------------------------------------------

    /// Add a package with links to the given destination; returns its id.
    pub fn add_package(&self, name: &str, links: &[String], destination: Destination) -> PackageId {
        let folder = if self.ctx.config().general.folder_per_package {
            name.replace("http://", "")
                .replace(':', "")
                .replace(['/', '\\'], "_")
        } else {
            String::new()
        };
        let pid = self.ctx.store.add_package(name, &folder, destination);
        let parsed = self.ctx.registry.parse_urls(links);
        let count = parsed.len();
        self.ctx.store.add_links(pid, &parsed);
        tracing::info!("added package {} containing {} links", name, count);
        pid
    }

    pub fn add_files(&self, pid: PackageId, links: &[String]) {
        let parsed = self.ctx.registry.parse_urls(links);
        tracing::info!("added {} links to package #{}", parsed.len(), pid);
        self.ctx.store.add_links(pid, &parsed);
    }

    /// Scan arbitrary text for URLs and group the hits by claiming plugin.
    pub fn parse_urls(&self, text: &str) -> HashMap<String, Vec<String>> {
        let urls: Vec<String> = url_matcher()
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();
        let mut deduped = urls;
        deduped.sort();
        deduped.dedup();
        self.check_urls(&deduped)
    }

    /// Map URLs to the plugins claiming them.
    pub fn check_urls(&self, urls: &[String]) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for (url, plugin) in self.ctx.registry.parse_urls(urls) {
            out.entry(plugin).or_default().push(url);
        }
        out
    }

    /// Kick off an online check; the skeleton maps every URL to an unknown
    /// status grouped by inferred package name. Poll with `poll_results`.
    pub fn check_online_status(&self, urls: &[String]) -> OnlineCheck {
        let data = self.ctx.registry.parse_urls(urls);
        let rid = self.sched.create_result_thread(data.clone(), false);

        let pairs = data.into_iter().map(|(url, plugin)| {
            let status = OnlineStatus::unknown(&url, plugin);
            (url.clone(), (url, status))
        });
        let mut results = HashMap::new();
        for (package_name, entries) in parse_names(pairs) {
            for (url, mut status) in entries {
                status.package_name = package_name.clone();
                results.insert(url, status);
            }
        }
        OnlineCheck {
            rid: rid as i64,
            results,
        }
    }

    /// Poll accumulated probe results. Once the drain sentinel shows up it
    /// is removed and the returned rid is -1: no more data will come.
    pub fn poll_results(&self, rid: u64) -> OnlineCheck {
        let mut results = self.sched.get_info_result(rid);
        if results.remove(ALL_INFO_FETCHED).is_some() {
            OnlineCheck { rid: -1, results }
        } else {
            OnlineCheck {
                rid: rid as i64,
                results,
            }
        }
    }

    /// Group links into packages by inferred name, without adding them.
    pub fn generate_packages(&self, links: &[String]) -> BTreeMap<String, Vec<String>> {
        parse_names(links.iter().map(|l| (l.clone(), l.clone())))
    }

    pub fn generate_and_add_packages(
        &self,
        links: &[String],
        destination: Destination,
    ) -> Vec<PackageId> {
        self.generate_packages(links)
            .into_iter()
            .map(|(name, urls)| self.add_package(&name, &urls, destination))
            .collect()
    }

    /// Check online status and let the probe auto-create packages from the
    /// resolved names.
    pub fn check_and_add_packages(&self, links: &[String]) {
        let data = self.ctx.registry.parse_urls(links);
        self.sched.create_result_thread(data, true);
    }

    // -- queue management --------------------------------------------------

    pub fn delete_files(&self, fids: &[FileId]) -> Result<(), CoreError> {
        for fid in fids {
            self.ctx.store.delete_file(*fid)?;
        }
        Ok(())
    }

    pub fn delete_packages(&self, pids: &[PackageId]) -> Result<(), CoreError> {
        for pid in pids {
            self.ctx.store.delete_package(*pid)?;
        }
        Ok(())
    }

    pub fn delete_finished(&self) -> Vec<PackageId> {
        self.ctx.store.delete_finished()
    }

    pub fn push_to_queue(&self, pid: PackageId) {
        self.ctx.store.set_package_destination(pid, Destination::Queue);
    }

    pub fn pull_from_queue(&self, pid: PackageId) {
        self.ctx
            .store
            .set_package_destination(pid, Destination::Collector);
    }

    pub fn move_package(&self, destination: u8, pid: PackageId) {
        if let Some(dest) = Destination::from_value(destination) {
            self.ctx.store.set_package_destination(pid, dest);
        }
    }

    pub fn restart_package(&self, pid: PackageId) {
        self.ctx.store.restart_package(pid);
    }

    pub fn restart_file(&self, fid: FileId) {
        self.ctx.store.restart_file(fid);
    }

    pub fn restart_failed(&self) {
        self.ctx.store.restart_failed();
    }

    pub fn set_package_name(&self, pid: PackageId, name: &str) -> Result<(), CoreError> {
        let package = self
            .ctx
            .store
            .package(pid)
            .ok_or(CoreError::PackageDoesNotExists(pid))?;
        package.set_name(name);
        Ok(())
    }

    /// Abort every running download; the transports observe the flag at
    /// their next write.
    pub fn stop_all_downloads(&self) {
        for file in self.ctx.store.all_files() {
            file.abort_download();
        }
    }

    pub fn stop_downloads(&self, fids: &[FileId]) {
        for file in self.ctx.store.all_files() {
            if fids.contains(&file.id) {
                file.abort_download();
            }
        }
    }

    pub fn order_package(&self, pid: PackageId, position: u32) {
        self.ctx.store.reorder_package(pid, position);
    }

    pub fn order_file(&self, fid: FileId, position: u32) {
        self.ctx.store.reorder_file(fid, position);
    }

    /// Order → package id for one destination. Colliding orders are bumped
    /// upward until free, mirroring the historical disambiguation.
    pub fn get_package_order(&self, destination: Destination) -> BTreeMap<u32, PackageId> {
        let mut order: BTreeMap<u32, PackageId> = BTreeMap::new();
        for package in self.ctx.store.packages(destination) {
            let mut slot = package.order();
            while order.contains_key(&slot) {
                slot += 1;
            }
            order.insert(slot, package.id);
        }
        order
    }

    /// Order → file id within one package, with the same bump rule.
    pub fn get_file_order(&self, pid: PackageId) -> BTreeMap<u32, FileId> {
        let mut order: BTreeMap<u32, FileId> = BTreeMap::new();
        for file in self.ctx.store.package_files(pid) {
            let mut slot = file.order();
            while order.contains_key(&slot) {
                slot += 1;
            }
            order.insert(slot, file.id);
        }
        order
    }

    pub fn file_data(&self, fid: FileId) -> Result<FileRef, CoreError> {
        self.ctx
            .store
            .file(fid)
            .ok_or(CoreError::FileDoesNotExists(fid))
    }

    // -- captcha RPC -------------------------------------------------------

    /// True when a captcha task is available. Counts as a client poll.
    pub fn is_captcha_waiting(&self) -> bool {
        self.ctx.captcha.touch_client();
        self.ctx.captcha.get_task().is_some()
    }

    /// Fetch a task for solving; reserves it for the caller when
    /// `exclusive`. Returns the id -1 shape when none is open.
    pub fn get_captcha_task(&self, exclusive: bool) -> CaptchaTaskWire {
        self.ctx.captcha.touch_client();
        match self.ctx.captcha.get_task() {
            Some(task) => {
                task.set_waiting_for_user(exclusive);
                CaptchaTaskWire {
                    id: task.id.parse().unwrap_or(-1),
                    data: task.params.to_string(),
                    format: task.format.clone(),
                    result_type: task.result_type.as_str().to_string(),
                }
            }
            None => CaptchaTaskWire::none(),
        }
    }

    /// Status string for a task; empty when the task is closed or unknown.
    pub fn get_captcha_task_status(&self, tid: &str) -> String {
        self.ctx.captcha.touch_client();
        self.ctx
            .captcha
            .get_task_by_id(tid)
            .map(|t| t.status().as_str().to_string())
            .unwrap_or_default()
    }

    /// Submit a solution; the task leaves the broker queue.
    pub fn set_captcha_result(&self, tid: &str, result: &str) {
        self.ctx.captcha.touch_client();
        if let Some(task) = self.ctx.captcha.get_task_by_id(tid) {
            task.set_result(result);
            self.ctx.captcha.remove_task(&task);
        }
    }

    // -- events ------------------------------------------------------------

    pub fn get_events(&self, uuid: &str) -> Vec<EventInfo> {
        self.ctx
            .events
            .drain(uuid)
            .into_iter()
            .map(|e| {
                let eventname = e.kind.as_str();
                match e.kind {
                    EventKind::Update | EventKind::Remove | EventKind::Insert => EventInfo {
                        eventname,
                        id: e.id,
                        element_type: e
                            .element
                            .map(|t| serde_json::Value::from(t.value())),
                        destination: Some(e.destination.value()),
                    },
                    EventKind::Order => EventInfo {
                        eventname,
                        id: e.id,
                        // Raw variant name, not the numeric value: kept
                        // bug-compatible with the original order branch.
                        element_type: e
                            .element
                            .map(|t| serde_json::Value::from(t.name())),
                        destination: Some(e.destination.value()),
                    },
                    EventKind::Reload => EventInfo {
                        eventname,
                        id: None,
                        element_type: None,
                        destination: Some(e.destination.value()),
                    },
                }
            })
            .collect()
    }

    // -- settings / logs ---------------------------------------------------

    /// Change the bandwidth cap; the bucket is reconfigured in place so
    /// running chunks pick it up without restarting.
    pub fn set_speed_limit(&self, limit_speed: bool, max_speed_kib: i64) {
        self.ctx.update_config(|cfg| {
            cfg.download.limit_speed = limit_speed;
            cfg.download.max_speed = max_speed_kib;
        });
    }

    /// Most recent log lines starting at `offset`.
    pub fn get_log(&self, offset: usize) -> Vec<String> {
        let dir = self.ctx.config().log.filelog_folder;
        let path = dir.join("drover.log");
        match std::fs::read_to_string(&path) {
            Ok(data) => data.lines().skip(offset).map(str::to_string).collect(),
            Err(_) => vec!["No log available".to_string()],
        }
    }

    // -- accounts ----------------------------------------------------------

    pub fn update_account(
        &self,
        plugin: &str,
        login: &str,
        password: Option<&str>,
        options: HashMap<String, Vec<String>>,
    ) {
        self.ctx.accounts.update_account(plugin, login, password, options);
    }

    pub fn remove_account(&self, plugin: &str, login: &str) {
        self.ctx.accounts.remove_account(plugin, login);
    }
}
