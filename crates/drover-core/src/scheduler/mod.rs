//! Job scheduler: owns the worker-slot pool, assigns jobs under policy
//! constraints, runs the reconnect protocol, and hosts the info/result cache.
//!
//! The control loop calls [`Scheduler::tick`] repeatedly; a tick (1) attempts
//! a reconnect, (2) resizes the pool toward `download.max_downloads`,
//! (3) assigns at most one job, and (4) expires the info cache. Failures in
//! any step are logged and never abort the tick.

mod assign;
mod probe;
mod reconnect;
mod slot;

pub use probe::ALL_INFO_FETCHED;
pub use slot::Job;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::file::{FileId, FileRef};
use crate::plugin::OnlineStatus;
use crate::utils::compare_time;

use slot::WorkerSlot;

/// Info/result cache entries expire 5 minutes after the last touch.
const CACHE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// One IP-echo endpoint and the regex extracting the address from its body.
#[derive(Debug, Clone)]
pub struct IpService {
    pub url: String,
    pub pattern: String,
}

impl IpService {
    pub fn new(url: &str, pattern: &str) -> Self {
        IpService {
            url: url.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

fn default_ip_services() -> Vec<IpService> {
    vec![
        IpService::new("https://api.ipify.org", r"(\S+)"),
        IpService::new("https://checkip.amazonaws.com", r"(\S+)"),
        IpService::new("http://checkip.dyndns.org/", r"Current IP Address: ([\d.]+)"),
    ]
}

struct InfoCache {
    results: HashMap<u64, HashMap<String, OnlineStatus>>,
    next_rid: u64,
    /// Purge deadline; refreshed by every probe creation, merge or retrieval.
    deadline: Option<Instant>,
}

pub struct Scheduler {
    ctx: Arc<Context>,
    slots: Mutex<Vec<WorkerSlot>>,
    /// Short-lived decrypter executors, tracked for active-file views.
    decrypters: Arc<Mutex<Vec<Job>>>,
    pause: AtomicBool,
    reconnecting: AtomicBool,
    info: Mutex<InfoCache>,
    ip_services: RwLock<Vec<IpService>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Scheduler {
            ctx,
            slots: Mutex::new(Vec::new()),
            decrypters: Arc::new(Mutex::new(Vec::new())),
            pause: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            info: Mutex::new(InfoCache {
                results: HashMap::new(),
                next_rid: 0,
                deadline: None,
            }),
            ip_services: RwLock::new(default_ip_services()),
        })
    }

    /// Initialize transport state and spawn the initial slot pool. The
    /// scheduler starts paused.
    pub fn start(&self) {
        // libcurl global state: once per process, before any slot runs.
        curl::init();
        let count = self.ctx.config().download.max_downloads;
        let mut slots = self.slots.lock().unwrap();
        while slots.len() < count {
            slots.push(WorkerSlot::spawn(Arc::clone(&self.ctx)));
        }
        tracing::debug!("scheduler started with {} slots", slots.len());
    }

    /// One control step; call repeatedly from the main loop.
    pub fn tick(self: &Arc<Self>) {
        if let Err(err) = reconnect::try_reconnect(self) {
            tracing::error!("reconnect failed: {:#}", err);
            self.reconnecting.store(false, Ordering::Relaxed);
        }

        self.check_slot_count();

        if let Err(err) = assign::assign_job(self) {
            tracing::warn!("assign job error: {:#}", err);
            // Possibly a transient store hiccup; back off and retry once.
            std::thread::sleep(Duration::from_millis(500));
            if let Err(err) = assign::assign_job(self) {
                tracing::warn!("assign job retry failed: {:#}", err);
            }
        }

        self.expire_info_cache();
    }

    // -- pause / reconnect flags ------------------------------------------

    /// Pause: no new downloads start; in-flight transfers continue.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    pub fn unpause(&self) {
        self.pause.store(false, Ordering::Relaxed);
    }

    pub fn toggle_pause(&self) -> bool {
        !self.pause.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    /// True while the reconnect protocol runs; set and cleared only here.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Relaxed)
    }

    /// Downloads may start: unpaused and inside the configured time window.
    pub fn is_time_download(&self) -> bool {
        let cfg = self.ctx.config();
        compare_time(&cfg.download.start_time, &cfg.download.end_time)
    }

    /// Reconnect is allowed: enabled and inside its time window.
    pub fn is_time_reconnect(&self) -> bool {
        let cfg = self.ctx.config();
        cfg.reconnect.enabled && compare_time(&cfg.reconnect.start_time, &cfg.reconnect.end_time)
    }

    /// Override the IP-echo endpoints (tests point this at a local server).
    pub fn set_ip_services(&self, services: Vec<IpService>) {
        *self.ip_services.write().unwrap() = services;
    }

    // -- pool sizing -------------------------------------------------------

    /// Grow by one slot or retire one idle slot per tick toward the
    /// configured cap. Active slots are never killed.
    fn check_slot_count(&self) {
        let want = self.ctx.config().download.max_downloads;
        let mut slots = self.slots.lock().unwrap();
        match slots.len() {
            n if n < want => slots.push(WorkerSlot::spawn(Arc::clone(&self.ctx))),
            n if n > want => {
                if let Some(pos) = slots.iter().position(|s| s.is_free()) {
                    let slot = slots.remove(pos);
                    slot.quit();
                }
            }
            _ => {}
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    // -- snapshots ---------------------------------------------------------

    /// Jobs currently on worker slots (excludes decrypter executors).
    pub fn slot_jobs(&self) -> Vec<Job> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.active_job())
            .collect()
    }

    /// Every file being processed: slot jobs plus decrypter executors.
    pub fn get_active_files(&self) -> Vec<FileRef> {
        let mut files: Vec<FileRef> = self
            .slot_jobs()
            .into_iter()
            .map(|j| j.file)
            .collect();
        files.extend(
            self.decrypters
                .lock()
                .unwrap()
                .iter()
                .map(|j| Arc::clone(&j.file)),
        );
        files
    }

    pub fn processing_ids(&self) -> Vec<FileId> {
        self.get_active_files().iter().map(|f| f.id).collect()
    }

    // -- info/result cache -------------------------------------------------

    fn touch_cache(cache: &mut InfoCache) {
        cache.deadline = Some(Instant::now() + CACHE_WINDOW);
    }

    /// Merge partial probe results into the bucket for `rid`. Buckets purged
    /// in the meantime swallow the delta.
    pub fn set_info_results(&self, rid: u64, delta: HashMap<String, OnlineStatus>) {
        let mut cache = self.info.lock().unwrap();
        Self::touch_cache(&mut cache);
        if let Some(bucket) = cache.results.get_mut(&rid) {
            bucket.extend(delta);
        }
    }

    /// Destructive read: the bucket is replaced with an empty map in the
    /// same critical section, so two consecutive reads never overlap.
    pub fn get_info_result(&self, rid: u64) -> HashMap<String, OnlineStatus> {
        let mut cache = self.info.lock().unwrap();
        Self::touch_cache(&mut cache);
        match cache.results.get_mut(&rid) {
            Some(bucket) => std::mem::take(bucket),
            None => HashMap::new(),
        }
    }

    fn expire_info_cache(&self) {
        let mut cache = self.info.lock().unwrap();
        let expired = cache
            .deadline
            .map(|d| Instant::now() > d)
            .unwrap_or(false);
        if expired && !cache.results.is_empty() {
            cache.results.clear();
            tracing::debug!("cleared result cache");
        }
    }

    #[cfg(test)]
    pub(crate) fn force_cache_deadline(&self, past: Duration) {
        let mut cache = self.info.lock().unwrap();
        cache.deadline = Instant::now().checked_sub(past);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::events::EventBus;
    use crate::store::memory::MemoryStore;

    fn scheduler() -> Arc<Scheduler> {
        let events = Arc::new(EventBus::new());
        let store = Arc::new(MemoryStore::new(Arc::clone(&events)));
        let ctx = Context::new(CoreConfig::default(), store, events);
        Scheduler::new(ctx)
    }

    #[test]
    fn starts_paused_and_toggles() {
        let sched = scheduler();
        assert!(sched.is_paused());
        assert!(!sched.toggle_pause());
        assert!(!sched.is_paused());
        assert!(sched.toggle_pause());
        assert!(sched.is_paused());
    }

    #[test]
    fn result_ids_are_monotonic() {
        let sched = scheduler();
        let a = sched.create_result_thread(Vec::new(), false);
        let b = sched.create_result_thread(Vec::new(), false);
        assert!(b > a);
    }

    #[test]
    fn info_retrieval_is_destructive() {
        let sched = scheduler();
        let rid = sched.create_result_thread(Vec::new(), false);
        sched.set_info_results(
            rid,
            HashMap::from([(
                "http://h/f".to_string(),
                OnlineStatus::unknown("f", "http"),
            )]),
        );
        // wait out the worker's sentinel so the read below is deterministic
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let first = sched.get_info_result(rid);
            if first.contains_key("http://h/f") {
                break;
            }
            assert!(Instant::now() < deadline, "probe result never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }
        let second = sched.get_info_result(rid);
        assert!(!second.contains_key("http://h/f"), "second read must be empty");
    }

    #[test]
    fn expired_cache_is_flushed_on_tick() {
        let sched = scheduler();
        let rid = sched.create_result_thread(Vec::new(), false);
        sched.set_info_results(
            rid,
            HashMap::from([("u".to_string(), OnlineStatus::unknown("u", "http"))]),
        );
        sched.force_cache_deadline(Duration::from_secs(1));
        sched.tick();
        assert!(sched.get_info_result(rid).is_empty());
    }

    #[test]
    fn pool_grows_and_shrinks_one_per_tick() {
        let sched = scheduler();
        assert_eq!(sched.slot_count(), 0);
        sched.check_slot_count();
        assert_eq!(sched.slot_count(), 1);
        sched.check_slot_count();
        sched.check_slot_count();
        assert_eq!(sched.slot_count(), 3);
        sched.ctx.update_config(|c| c.download.max_downloads = 1);
        sched.check_slot_count();
        assert_eq!(sched.slot_count(), 2);
        sched.check_slot_count();
        assert_eq!(sched.slot_count(), 1);
        sched.check_slot_count();
        assert_eq!(sched.slot_count(), 1);
    }
}
