//! Integration tests: scheduler policy with mock hoster plugins.
//!
//! Exercises per-account parallelism caps, the disk-space floor, the
//! off-slot decrypter path, and the full reconnect protocol against a local
//! IP-echo server and a real shell script.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use drover_core::config::CoreConfig;
use drover_core::context::Context;
use drover_core::events::EventBus;
use drover_core::file::{FileRef, FileStatus};
use drover_core::package::Destination;
use drover_core::plugin::{AddonCaps, AddonPlugin, HosterPlugin, PluginKind};
use drover_core::scheduler::{IpService, Scheduler};
use drover_core::store::memory::MemoryStore;
use drover_core::store::FileStore;

fn build(cfg: CoreConfig) -> (Arc<Context>, Arc<Scheduler>, Arc<MemoryStore>) {
    let events = Arc::new(EventBus::new());
    let store = Arc::new(MemoryStore::new(Arc::clone(&events)));
    let ctx = Context::new(cfg, Arc::clone(&store) as Arc<dyn FileStore>, events);
    let sched = Scheduler::new(Arc::clone(&ctx));
    (ctx, sched, store)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn tmp_config(dir: &std::path::Path) -> CoreConfig {
    let mut cfg = CoreConfig::default();
    cfg.general.storage_folder = dir.to_path_buf();
    cfg.general.min_free_space = 0;
    cfg
}

// -- blocking plugin: runs until released ---------------------------------

struct BlockingPlugin {
    release: Arc<AtomicBool>,
    login: Option<String>,
    multi: bool,
}

impl HosterPlugin for BlockingPlugin {
    fn multi_dl(&self) -> bool {
        self.multi
    }

    fn account_login(&self) -> Option<String> {
        self.login.clone()
    }

    fn process(&self, _file: &FileRef, _ctx: &Context) -> Result<()> {
        while !self.release.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

#[test]
fn account_limit_caps_parallel_slots_per_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = tmp_config(dir.path());
    cfg.download.max_downloads = 3;
    let (ctx, sched, store) = build(cfg);

    let release = Arc::new(AtomicBool::new(false));
    let factory_release = Arc::clone(&release);
    ctx.registry.register(
        "limited",
        r"https?://limited\.example/",
        Box::new(move || {
            Arc::new(BlockingPlugin {
                release: Arc::clone(&factory_release),
                login: Some("alice".to_string()),
                multi: true,
            })
        }),
    );
    ctx.accounts.update_account(
        "limited",
        "alice",
        None,
        HashMap::from([("limitDL".to_string(), vec!["2".to_string()])]),
    );

    let pid = store.add_package("p", "p", Destination::Queue);
    store.add_links(
        pid,
        &[
            ("http://limited.example/a".to_string(), "limited".to_string()),
            ("http://limited.example/b".to_string(), "limited".to_string()),
            ("http://limited.example/c".to_string(), "limited".to_string()),
        ],
    );

    sched.start();
    sched.unpause();
    for _ in 0..4 {
        sched.tick();
    }

    assert!(wait_until(Duration::from_secs(2), || sched
        .get_active_files()
        .len()
        == 2));
    // another tick must not assign the third file
    sched.tick();
    assert_eq!(sched.get_active_files().len(), 2);
    assert!(sched.get_active_files().len() <= sched.slot_count());

    release.store(true, Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(2), || {
        sched.tick();
        store
            .package_files(pid)
            .iter()
            .all(|f| f.status() == FileStatus::Finished)
    }));
}

#[test]
fn non_parallel_plugin_occupies_after_first_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = tmp_config(dir.path());
    cfg.download.max_downloads = 3;
    let (ctx, sched, store) = build(cfg);

    let release = Arc::new(AtomicBool::new(false));
    let factory_release = Arc::clone(&release);
    ctx.registry.register(
        "solo",
        r"https?://solo\.example/",
        Box::new(move || {
            Arc::new(BlockingPlugin {
                release: Arc::clone(&factory_release),
                login: None,
                multi: false,
            })
        }),
    );

    let pid = store.add_package("p", "p", Destination::Queue);
    store.add_links(
        pid,
        &[
            ("http://solo.example/a".to_string(), "solo".to_string()),
            ("http://solo.example/b".to_string(), "solo".to_string()),
        ],
    );

    sched.start();
    sched.unpause();
    for _ in 0..3 {
        sched.tick();
    }

    assert!(wait_until(Duration::from_secs(2), || sched
        .get_active_files()
        .len()
        == 1));
    sched.tick();
    assert_eq!(sched.get_active_files().len(), 1, "solo hoster allows one slot");

    release.store(true, Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(2), || {
        sched.tick();
        store
            .package_files(pid)
            .iter()
            .all(|f| f.status() == FileStatus::Finished)
    }));
}

#[test]
fn disk_floor_pauses_scheduler_without_assigning() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = tmp_config(dir.path());
    // Free space can never satisfy this floor.
    cfg.general.min_free_space = u64::MAX >> 21;
    let (ctx, sched, store) = build(cfg);

    let release = Arc::new(AtomicBool::new(true));
    let factory_release = Arc::clone(&release);
    ctx.registry.register(
        "floorhost",
        r"https?://floor\.example/",
        Box::new(move || {
            Arc::new(BlockingPlugin {
                release: Arc::clone(&factory_release),
                login: None,
                multi: true,
            })
        }),
    );

    let pid = store.add_package("p", "p", Destination::Queue);
    store.add_links(
        pid,
        &[("http://floor.example/a".to_string(), "floorhost".to_string())],
    );

    sched.start();
    sched.unpause();
    sched.tick();

    assert!(sched.is_paused(), "disk floor must pause the scheduler");
    assert!(sched.get_active_files().is_empty());
    // the pulled job went back through the deferred cache, not into a slot
    assert_eq!(store.package_files(pid)[0].status(), FileStatus::Queued);
}

// -- decrypter: expands a container link off-slot --------------------------

struct ExpandingDecrypter;

impl HosterPlugin for ExpandingDecrypter {
    fn kind(&self) -> PluginKind {
        PluginKind::Decrypter
    }

    fn process(&self, file: &FileRef, ctx: &Context) -> Result<()> {
        ctx.store.add_links(
            file.package_id,
            &[
                ("http://plain.example/a".to_string(), "plain".to_string()),
                ("http://plain.example/b".to_string(), "plain".to_string()),
            ],
        );
        Ok(())
    }
}

#[test]
fn decrypter_runs_off_slot_and_expands_links() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, sched, store) = build(tmp_config(dir.path()));

    ctx.registry.register(
        "vault",
        r"https?://vault\.example/",
        Box::new(|| Arc::new(ExpandingDecrypter)),
    );
    store.set_decrypter_plugins(["vault".to_string()]);

    let pid = store.add_package("p", "p", Destination::Queue);
    store.add_links(
        pid,
        &[("http://vault.example/folder".to_string(), "vault".to_string())],
    );

    sched.start();
    sched.unpause();
    sched.tick();

    assert!(wait_until(Duration::from_secs(2), || {
        store.package_files(pid).len() == 3
    }));
    // no worker slot was consumed by the decrypter
    assert!(sched.slot_jobs().is_empty());
}

// -- reconnect protocol ----------------------------------------------------

struct WaiterState {
    armed: Arc<AtomicBool>,
    waiting: AtomicBool,
}

struct WaitingPlugin {
    state: Arc<WaiterState>,
    sched: Arc<Scheduler>,
}

impl HosterPlugin for WaitingPlugin {
    fn want_reconnect(&self) -> bool {
        true
    }

    fn waiting(&self) -> bool {
        self.state.waiting.load(Ordering::Relaxed)
    }

    fn process(&self, _file: &FileRef, _ctx: &Context) -> Result<()> {
        let mut saw_reconnect = false;
        loop {
            if self.sched.is_reconnecting() {
                // Observe the barrier: stop consuming the wait.
                self.state.waiting.store(false, Ordering::Relaxed);
                saw_reconnect = true;
            } else if saw_reconnect {
                break;
            } else if self.state.armed.load(Ordering::Relaxed) {
                self.state.waiting.store(true, Ordering::Relaxed);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingAddon {
    before: Mutex<Vec<String>>,
    after: Mutex<Vec<String>>,
}

impl AddonPlugin for RecordingAddon {
    fn name(&self) -> &str {
        "recorder"
    }

    fn before_reconnect(&self, ip: &str) {
        self.before.lock().unwrap().push(ip.to_string());
    }

    fn after_reconnect(&self, ip: &str) {
        self.after.lock().unwrap().push(ip.to_string());
    }
}

/// Tiny HTTP server answering each request with the next body in `bodies`
/// (the last one repeats).
fn ip_echo_server(bodies: Vec<&'static str>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let counter = Arc::new(AtomicUsize::new(0));
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let mut stream = stream;
            let idx = counter.fetch_add(1, Ordering::Relaxed).min(bodies.len() - 1);
            let body = bodies[idx];
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://127.0.0.1:{}/", port)
}

#[test]
fn reconnect_quiesces_workers_and_fires_addon_events() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("reconnected.marker");
    let script = dir.path().join("reconnect.sh");
    std::fs::write(&script, format!("#!/bin/sh\ntouch {}\n", marker.display())).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut cfg = tmp_config(dir.path());
    cfg.download.max_downloads = 2;
    cfg.reconnect.enabled = true;
    cfg.reconnect.script = script;
    let (ctx, sched, store) = build(cfg);

    sched.set_ip_services(vec![IpService::new(
        &ip_echo_server(vec!["1.2.3.4", "5.6.7.8"]),
        r"(\S+)",
    )]);

    let armed = Arc::new(AtomicBool::new(false));
    let states: Arc<Mutex<Vec<Arc<WaiterState>>>> = Arc::new(Mutex::new(Vec::new()));
    let factory_armed = Arc::clone(&armed);
    let factory_states = Arc::clone(&states);
    let factory_sched = Arc::clone(&sched);
    ctx.registry.register(
        "waiter",
        r"https?://waiter\.example/",
        Box::new(move || {
            let state = Arc::new(WaiterState {
                armed: Arc::clone(&factory_armed),
                waiting: AtomicBool::new(false),
            });
            factory_states.lock().unwrap().push(Arc::clone(&state));
            Arc::new(WaitingPlugin {
                state,
                sched: Arc::clone(&factory_sched),
            })
        }),
    );

    let addon = Arc::new(RecordingAddon::default());
    ctx.addons.register(
        Arc::clone(&addon) as Arc<dyn AddonPlugin>,
        AddonCaps {
            reconnect: true,
            ..Default::default()
        },
    );

    let pid = store.add_package("p", "p", Destination::Queue);
    store.add_links(
        pid,
        &[
            ("http://waiter.example/a".to_string(), "waiter".to_string()),
            ("http://waiter.example/b".to_string(), "waiter".to_string()),
        ],
    );

    sched.start();
    sched.unpause();
    sched.tick();
    sched.tick();
    assert!(wait_until(Duration::from_secs(2), || sched
        .get_active_files()
        .len()
        == 2));

    // Both transfers now sit in a hoster wait and ask for a new IP.
    armed.store(true, Ordering::Relaxed);
    assert!(wait_until(Duration::from_secs(2), || {
        let states = states.lock().unwrap();
        states.len() == 2 && states.iter().all(|s| s.waiting.load(Ordering::Relaxed))
    }));

    // This tick runs the whole protocol inline.
    sched.tick();

    assert!(!sched.is_reconnecting(), "flag must be cleared");
    assert!(marker.exists(), "reconnect script must have run");
    assert_eq!(*addon.before.lock().unwrap(), vec!["1.2.3.4".to_string()]);
    assert_eq!(*addon.after.lock().unwrap(), vec!["5.6.7.8".to_string()]);

    assert!(wait_until(Duration::from_secs(2), || {
        store
            .package_files(pid)
            .iter()
            .all(|f| f.status() == FileStatus::Finished)
    }));
}
