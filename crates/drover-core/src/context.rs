//! Shared collaborator context threaded into every component.
//!
//! There are no module-level singletons: the registry, accounts, addon bus,
//! captcha broker, bandwidth bucket, event bus and file store all live here
//! and are passed by `Arc<Context>` at construction time.

use std::sync::{Arc, RwLock};

use crate::accounts::AccountStore;
use crate::bucket::BandwidthBucket;
use crate::captcha::CaptchaBroker;
use crate::config::CoreConfig;
use crate::events::EventBus;
use crate::plugin::{AddonBus, PluginRegistry};
use crate::store::FileStore;

pub struct Context {
    config: RwLock<CoreConfig>,
    pub store: Arc<dyn FileStore>,
    pub registry: Arc<PluginRegistry>,
    pub accounts: Arc<AccountStore>,
    pub addons: Arc<AddonBus>,
    pub captcha: Arc<CaptchaBroker>,
    pub bucket: Arc<BandwidthBucket>,
    pub events: Arc<EventBus>,
}

impl Context {
    /// Build a context over `store` with the built-in plugin registry and
    /// empty collaborator sets. The bandwidth bucket starts at the
    /// configured limit.
    pub fn new(config: CoreConfig, store: Arc<dyn FileStore>, events: Arc<EventBus>) -> Arc<Self> {
        let bucket = Arc::new(BandwidthBucket::new());
        bucket.set_rate(config.speed_limit_bytes());
        Arc::new(Context {
            config: RwLock::new(config),
            store,
            registry: Arc::new(PluginRegistry::with_builtin()),
            accounts: Arc::new(AccountStore::new()),
            addons: Arc::new(AddonBus::new()),
            captcha: Arc::new(CaptchaBroker::new()),
            bucket,
            events,
        })
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> CoreConfig {
        self.config.read().unwrap().clone()
    }

    /// Mutate the configuration; speed-limit changes reconfigure the bucket
    /// in place so in-flight chunks pick them up without restarting.
    pub fn update_config(&self, f: impl FnOnce(&mut CoreConfig)) {
        let mut cfg = self.config.write().unwrap();
        f(&mut cfg);
        self.bucket.set_rate(cfg.speed_limit_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn speed_limit_change_reconfigures_bucket() {
        let events = Arc::new(EventBus::new());
        let store = Arc::new(MemoryStore::new(Arc::clone(&events)));
        let ctx = Context::new(CoreConfig::default(), store, events);
        assert_eq!(ctx.bucket.rate(), None);

        ctx.update_config(|cfg| {
            cfg.download.limit_speed = true;
            cfg.download.max_speed = 256;
        });
        assert_eq!(ctx.bucket.rate(), Some(256 * 1024));

        ctx.update_config(|cfg| cfg.download.limit_speed = false);
        assert_eq!(ctx.bucket.rate(), None);
    }
}
