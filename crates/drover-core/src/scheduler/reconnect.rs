//! Reconnect controller: quiesce workers, run the external IP-change script,
//! resume.
//!
//! Runs only when every active slot sits in a hoster wait and wants a new
//! IP. The script's exit status is not interpreted; success is inferred from
//! the IP changing between the probes around it.

use std::process::Command;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;

use super::Scheduler;

/// Poll granularity while waiting for workers to observe the flag and idle.
const QUIESCE_POLL: Duration = Duration::from_millis(250);

const IP_PROBE_ATTEMPTS: usize = 10;

pub(super) fn try_reconnect(sched: &Arc<Scheduler>) -> Result<()> {
    if !sched.is_time_reconnect() {
        return Ok(());
    }

    // Every active slot must both want the reconnect and be sitting in a
    // wait; a single busy slot vetoes. No active slots: nothing to gain.
    let jobs = sched.slot_jobs();
    if jobs.is_empty()
        || !jobs
            .iter()
            .all(|j| j.plugin.want_reconnect() && j.plugin.waiting())
    {
        return Ok(());
    }

    let script = sched.ctx.config().reconnect.script;
    if !script.is_file() {
        tracing::warn!("reconnect script not found, disabling reconnect");
        sched.ctx.update_config(|cfg| cfg.reconnect.enabled = false);
        return Ok(());
    }

    sched.reconnecting.store(true, Ordering::Relaxed);
    tracing::info!("starting reconnect");

    // Bandwidth consumers observe the flag; wait until no slot reports
    // waiting anymore (their plugins park the wait when reconnecting).
    while sched
        .slot_jobs()
        .iter()
        .any(|j| j.plugin.waiting())
    {
        std::thread::sleep(QUIESCE_POLL);
    }

    let old_ip = get_ip(sched);
    sched.ctx.addons.before_reconnect(&old_ip);
    tracing::debug!("old IP: {}", old_ip);

    let output = match Command::new("sh").arg("-c").arg(&script).output() {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!("failed executing reconnect script: {}", err);
            sched.ctx.update_config(|cfg| cfg.reconnect.enabled = false);
            sched.reconnecting.store(false, Ordering::Relaxed);
            return Ok(());
        }
    };
    if !output.status.success() {
        tracing::warn!("reconnect script exited with {}", output.status);
    }
    if !output.stdout.is_empty() {
        tracing::debug!(
            "reconnect script stdout: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
    }
    if !output.stderr.is_empty() {
        tracing::debug!(
            "reconnect script stderr: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    // Give the link a moment to settle before probing again.
    std::thread::sleep(Duration::from_secs(1));

    let new_ip = get_ip(sched);
    sched.ctx.addons.after_reconnect(&new_ip);
    tracing::info!("reconnected, new IP: {}", new_ip);

    sched.reconnecting.store(false, Ordering::Relaxed);
    Ok(())
}

/// Current public IP via the configured echo endpoints. Rotates through the
/// list with up to 10 attempts and 1 s backoff; empty string when all fail.
pub(super) fn get_ip(sched: &Arc<Scheduler>) -> String {
    let services = sched.ip_services.read().unwrap().clone();
    if services.is_empty() {
        return String::new();
    }

    for attempt in 0..IP_PROBE_ATTEMPTS {
        let service = &services[attempt % services.len()];
        match fetch_body(&service.url) {
            Ok(body) => {
                let extracted = Regex::new(&service.pattern)
                    .ok()
                    .and_then(|re| re.captures(&body))
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string());
                if let Some(ip) = extracted {
                    return ip;
                }
            }
            Err(err) => {
                tracing::debug!("IP probe {} failed: {:#}", service.url, err);
            }
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    String::new()
}

/// Small GET returning the response body as text.
fn fetch_body(url: &str) -> Result<String> {
    let mut body = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.connect_timeout(Duration::from_secs(10))?;
    easy.timeout(Duration::from_secs(10))?;

    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| {
            body.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.perform()?;
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}
