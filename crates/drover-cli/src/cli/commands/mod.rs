pub mod check;
pub mod fetch;

use std::sync::Arc;

use drover_core::api::Api;
use drover_core::config::CoreConfig;
use drover_core::context::Context;
use drover_core::events::EventBus;
use drover_core::scheduler::Scheduler;
use drover_core::store::memory::MemoryStore;
use drover_core::store::FileStore;

/// Wire up a full in-memory engine for one CLI invocation.
pub(super) fn build_engine(cfg: CoreConfig) -> (Arc<Context>, Arc<Scheduler>, Api) {
    let events = Arc::new(EventBus::new());
    let store: Arc<dyn FileStore> = Arc::new(MemoryStore::new(Arc::clone(&events)));
    let ctx = Context::new(cfg, store, events);
    let sched = Scheduler::new(Arc::clone(&ctx));
    let api = Api::new(Arc::clone(&ctx), Arc::clone(&sched));
    (ctx, sched, api)
}

pub(super) fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
