//! Premium-account records and per-plugin parallelism limits.
//!
//! The scheduler only consumes `limit_dl`; the rest of the record exists so
//! plugins can authenticate. Accounts are keyed by plugin name, then login.

use std::collections::HashMap;
use std::sync::RwLock;

/// One account entry for a hoster plugin.
#[derive(Debug, Clone, Default)]
pub struct AccountData {
    pub login: String,
    pub password: String,
    /// Free-form options; `limitDL` caps parallel downloads for this account.
    pub options: HashMap<String, Vec<String>>,
    pub valid: bool,
}

impl AccountData {
    /// Per-plugin parallel download cap from the `limitDL` option; 0 = unlimited.
    pub fn limit_dl(&self) -> u32 {
        self.options
            .get("limitDL")
            .and_then(|v| v.first())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// Process-wide account registry.
#[derive(Default)]
pub struct AccountStore {
    accounts: RwLock<HashMap<String, Vec<AccountData>>>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_account(
        &self,
        plugin: &str,
        login: &str,
        password: Option<&str>,
        options: HashMap<String, Vec<String>>,
    ) {
        let mut accounts = self.accounts.write().unwrap();
        let list = accounts.entry(plugin.to_string()).or_default();
        if let Some(acc) = list.iter_mut().find(|a| a.login == login) {
            if let Some(pw) = password {
                acc.password = pw.to_string();
            }
            acc.options.extend(options);
        } else {
            list.push(AccountData {
                login: login.to_string(),
                password: password.unwrap_or_default().to_string(),
                options,
                valid: true,
            });
        }
    }

    pub fn remove_account(&self, plugin: &str, login: &str) {
        let mut accounts = self.accounts.write().unwrap();
        if let Some(list) = accounts.get_mut(plugin) {
            list.retain(|a| a.login != login);
        }
    }

    pub fn account(&self, plugin: &str, login: &str) -> Option<AccountData> {
        self.accounts
            .read()
            .unwrap()
            .get(plugin)?
            .iter()
            .find(|a| a.login == login)
            .cloned()
    }

    /// Download cap for `login` on `plugin`; 0 = unlimited or no such account.
    pub fn limit_dl(&self, plugin: &str, login: &str) -> u32 {
        self.account(plugin, login)
            .map(|a| a.limit_dl())
            .unwrap_or(0)
    }

    pub fn plugins_with_accounts(&self) -> Vec<String> {
        self.accounts.read().unwrap().keys().cloned().collect()
    }
}
