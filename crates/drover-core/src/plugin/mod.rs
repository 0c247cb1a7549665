//! Plugin capability interfaces and the registry.
//!
//! Hoster plugins adapt one hoster each: they claim URLs via a pattern,
//! probe online status, and drive the transfer for a file. Addon plugins
//! hook cross-cutting events (captcha offers, reconnect). The registry maps
//! URLs to plugin names and builds fresh instances per job.

pub mod http;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use regex::Regex;

use crate::captcha::CaptchaTask;
use crate::context::Context;
use crate::file::FileRef;

/// What a plugin does with the files it claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Transfers the file itself.
    Hoster,
    /// Expands a container/crypted link into new links; runs off-slot.
    Decrypter,
}

/// Online-status outcome of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Online,
    Offline,
    Unknown,
    Queued,
    Downloading,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeStatus::Online => "online",
            ProbeStatus::Offline => "offline",
            ProbeStatus::Unknown => "unknown",
            ProbeStatus::Queued => "queued",
            ProbeStatus::Downloading => "downloading",
        }
    }
}

/// Per-URL result of an online probe.
#[derive(Debug, Clone)]
pub struct OnlineStatus {
    pub name: String,
    pub plugin: String,
    pub package_name: String,
    pub status: ProbeStatus,
    pub size: u64,
    pub hash: Option<String>,
}

impl OnlineStatus {
    pub fn unknown(name: impl Into<String>, plugin: impl Into<String>) -> Self {
        OnlineStatus {
            name: name.into(),
            plugin: plugin.into(),
            package_name: String::new(),
            status: ProbeStatus::Unknown,
            size: 0,
            hash: None,
        }
    }
}

/// A hoster adapter. One instance serves one job; `want_reconnect` and
/// `waiting` are polled from the scheduler thread while `process` runs, so
/// implementations back them with atomics.
pub trait HosterPlugin: Send + Sync {
    fn kind(&self) -> PluginKind {
        PluginKind::Hoster
    }

    /// False when the hoster forbids parallel downloads without an account.
    fn multi_dl(&self) -> bool {
        true
    }

    /// Login of the premium account in use, for per-account limits.
    fn account_login(&self) -> Option<String> {
        None
    }

    /// True when the hoster imposed a wait the plugin would rather skip by
    /// changing IP.
    fn want_reconnect(&self) -> bool {
        false
    }

    /// True while the plugin is sitting out a hoster-imposed wait (no
    /// bandwidth is being consumed).
    fn waiting(&self) -> bool {
        false
    }

    /// Run the job to completion. Status transitions on `file` are owned by
    /// the calling slot except where the plugin sets wait/online states.
    fn process(&self, file: &FileRef, ctx: &Context) -> Result<()>;

    /// Resolve online status without downloading. The default marks
    /// everything unknown; real hosters override.
    fn get_info(&self, urls: &[String]) -> Vec<(String, OnlineStatus)> {
        urls.iter()
            .map(|u| {
                let name = u.rsplit('/').next().unwrap_or(u).to_string();
                (u.clone(), OnlineStatus::unknown(name, ""))
            })
            .collect()
    }
}

/// Cross-cutting hooks. Hooks a plugin does not implement are declared
/// absent at registration so the bus can skip it during dispatch.
pub trait AddonPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Inactive addons are skipped by every dispatch.
    fn active(&self) -> bool {
        true
    }

    /// Offered every new captcha challenge; return true to register this
    /// addon as a handler for the task.
    fn new_captcha_task(&self, _task: &Arc<CaptchaTask>) -> bool {
        false
    }

    fn captcha_correct(&self, _task: &Arc<CaptchaTask>) {}
    fn captcha_invalid(&self, _task: &Arc<CaptchaTask>) {}

    fn before_reconnect(&self, _ip: &str) {}
    fn after_reconnect(&self, _ip: &str) {}
}

/// Hooks an addon implements, declared at registration time.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddonCaps {
    pub captcha: bool,
    pub reconnect: bool,
}

struct AddonEntry {
    addon: Arc<dyn AddonPlugin>,
    caps: AddonCaps,
}

/// Registry of addon plugins plus which hooks each implements.
#[derive(Default)]
pub struct AddonBus {
    entries: RwLock<Vec<AddonEntry>>,
}

impl AddonBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addon: Arc<dyn AddonPlugin>, caps: AddonCaps) {
        self.entries.write().unwrap().push(AddonEntry { addon, caps });
    }

    /// Active addons implementing the captcha hooks.
    pub fn captcha_addons(&self) -> Vec<Arc<dyn AddonPlugin>> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.caps.captcha && e.addon.active())
            .map(|e| Arc::clone(&e.addon))
            .collect()
    }

    pub fn before_reconnect(&self, ip: &str) {
        for entry in self.entries.read().unwrap().iter() {
            if entry.caps.reconnect && entry.addon.active() {
                entry.addon.before_reconnect(ip);
            }
        }
    }

    pub fn after_reconnect(&self, ip: &str) {
        for entry in self.entries.read().unwrap().iter() {
            if entry.caps.reconnect && entry.addon.active() {
                entry.addon.after_reconnect(ip);
            }
        }
    }
}

type PluginFactory = Box<dyn Fn() -> Arc<dyn HosterPlugin> + Send + Sync>;

struct RegistryEntry {
    name: String,
    pattern: Regex,
    factory: PluginFactory,
}

/// Maps URLs to plugin names and instantiates plugins per job.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<Vec<RegistryEntry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in direct HTTP/FTP plugin as fallback.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(
            http::PLUGIN_NAME,
            http::URL_PATTERN,
            Box::new(|| Arc::new(http::BasicHttp::new())),
        );
        registry
    }

    /// Registers a plugin; `pattern` must be a valid regex over full URLs.
    /// Later registrations take precedence over earlier ones, so specific
    /// hoster plugins shadow the built-in fallback.
    pub fn register(&self, name: &str, pattern: &str, factory: PluginFactory) {
        let pattern = match Regex::new(pattern) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!("plugin {} has invalid url pattern: {}", name, err);
                return;
            }
        };
        self.entries.write().unwrap().push(RegistryEntry {
            name: name.to_string(),
            pattern,
            factory,
        });
    }

    /// Name of the plugin claiming `url`, if any.
    pub fn match_url(&self, url: &str) -> Option<String> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .rev()
            .find(|e| e.pattern.is_match(url))
            .map(|e| e.name.clone())
    }

    /// Maps each URL to its claiming plugin; unmatched URLs are dropped.
    pub fn parse_urls(&self, urls: &[String]) -> Vec<(String, String)> {
        urls.iter()
            .filter_map(|u| self.match_url(u).map(|p| (u.clone(), p)))
            .collect()
    }

    /// Fresh plugin instance for a job. Fails when the plugin is unknown.
    pub fn create(&self, name: &str) -> Result<Arc<dyn HosterPlugin>> {
        let entries = self.entries.read().unwrap();
        let entry = entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| anyhow::anyhow!("unknown plugin: {}", name))?;
        Ok((entry.factory)())
    }

    /// Groups URLs by claiming plugin, for batched probes.
    pub fn group_by_plugin(&self, urls: &[String]) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for (url, plugin) in self.parse_urls(urls) {
            out.entry(plugin).or_default().push(url);
        }
        out
    }
}
