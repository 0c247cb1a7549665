//! Online-status probe workers.
//!
//! A probe worker fans `(url, plugin)` pairs out to plugin `get_info`
//! implementations, streaming partial results into the scheduler's cache.
//! When fully drained it plants the `ALL_INFO_FETCHED` sentinel, which the
//! API layer translates into the "no more data" result id.

use std::collections::HashMap;
use std::sync::Arc;

use crate::names::parse_names;
use crate::package::Destination;
use crate::plugin::{OnlineStatus, ProbeStatus};
use crate::store::FileStore;

use super::Scheduler;

/// Sentinel key marking a fully drained probe bucket. Never returned to
/// callers.
pub const ALL_INFO_FETCHED: &str = "ALL_INFO_FETCHED";

/// Probe batches sent to one plugin at a time.
const BATCH_SIZE: usize = 25;

impl Scheduler {
    /// Register and start an info probe over `(url, plugin)` pairs; returns
    /// the monotonically increasing result id to poll. With `add` set,
    /// packages are auto-created from the resolved names once the probe
    /// drains.
    pub fn create_result_thread(
        self: &Arc<Self>,
        data: Vec<(String, String)>,
        add: bool,
    ) -> u64 {
        let rid = {
            let mut cache = self.info.lock().unwrap();
            Self::touch_cache(&mut cache);
            let rid = cache.next_rid;
            cache.next_rid += 1;
            cache.results.insert(rid, HashMap::new());
            rid
        };

        let sched = Arc::clone(self);
        std::thread::spawn(move || probe_worker(sched, rid, data, add));
        rid
    }
}

fn probe_worker(sched: Arc<Scheduler>, rid: u64, data: Vec<(String, String)>, add: bool) {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for (url, plugin) in data {
        groups.entry(plugin).or_default().push(url);
    }

    // (resolved name, url) pairs collected for package auto-creation.
    let mut resolved: Vec<(String, String)> = Vec::new();

    for (plugin_name, urls) in groups {
        let plugin = match sched.ctx.registry.create(&plugin_name) {
            Ok(plugin) => plugin,
            Err(err) => {
                tracing::warn!("probe cannot init plugin {}: {:#}", plugin_name, err);
                let delta: HashMap<String, OnlineStatus> = urls
                    .into_iter()
                    .map(|u| {
                        let mut st = OnlineStatus::unknown(&u, &plugin_name);
                        st.status = ProbeStatus::Unknown;
                        (u, st)
                    })
                    .collect();
                sched.set_info_results(rid, delta);
                continue;
            }
        };

        for batch in urls.chunks(BATCH_SIZE) {
            let infos = plugin.get_info(batch);
            let delta: HashMap<String, OnlineStatus> = infos
                .into_iter()
                .map(|(url, mut status)| {
                    if status.plugin.is_empty() {
                        status.plugin = plugin_name.clone();
                    }
                    (url, status)
                })
                .collect();
            if add {
                resolved.extend(
                    delta
                        .iter()
                        .filter(|(_, s)| s.status != ProbeStatus::Offline)
                        .map(|(url, s)| (s.name.clone(), url.clone())),
                );
            }
            sched.set_info_results(rid, delta);
        }
    }

    if add && !resolved.is_empty() {
        add_resolved_packages(&sched, resolved);
    }

    sched.set_info_results(
        rid,
        HashMap::from([(
            ALL_INFO_FETCHED.to_string(),
            OnlineStatus::unknown(ALL_INFO_FETCHED, ""),
        )]),
    );
}

/// Group resolved names into packages and add the links to the queue.
fn add_resolved_packages(sched: &Arc<Scheduler>, resolved: Vec<(String, String)>) {
    for (package_name, urls) in parse_names(resolved) {
        let links = sched
            .ctx
            .registry
            .parse_urls(&urls);
        if links.is_empty() {
            continue;
        }
        let pid = sched
            .ctx
            .store
            .add_package(&package_name, &package_name, Destination::Queue);
        sched.ctx.store.add_links(pid, &links);
        tracing::info!(
            "added package {} containing {} links",
            package_name,
            links.len()
        );
    }
}
