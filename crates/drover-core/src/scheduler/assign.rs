//! Job assignment: compute the occupied set, pull a compatible job from the
//! store, and hand it to a free slot (or defer it).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;

use crate::file::FileStatus;
use crate::plugin::PluginKind;
use crate::store::FileStore;
use crate::utils::free_space;

use super::slot::{spawn_decrypter, Job};
use super::Scheduler;

/// Try to assign at most one job. Called once per tick.
pub(super) fn assign_job(sched: &Arc<Scheduler>) -> Result<()> {
    if sched.is_paused() || !sched.is_time_download() {
        return Ok(());
    }

    let occupied = occupied_plugins(sched);

    let Some(file) = sched.ctx.store.next_job(&occupied) else {
        return Ok(());
    };

    // Plugin init failure is terminal for the file.
    let plugin = match sched.ctx.registry.create(&file.plugin_name) {
        Ok(plugin) => plugin,
        Err(err) => {
            tracing::error!("plugin init failed for {}: {:#}", file.name(), err);
            file.set_status(FileStatus::Failed);
            file.set_error(format!("{:#}", err));
            sched.ctx.store.release(&file);
            return Ok(());
        }
    };
    let job = Job { file, plugin };

    match job.plugin.kind() {
        PluginKind::Hoster => assign_download(sched, job, &occupied),
        PluginKind::Decrypter => {
            spawn_decrypter(
                Arc::clone(&sched.ctx),
                Arc::clone(&sched.decrypters),
                job,
            );
            Ok(())
        }
    }
}

fn assign_download(sched: &Arc<Scheduler>, job: Job, occupied: &[String]) -> Result<()> {
    let cfg = sched.ctx.config();

    // Disk-space floor: pause the whole scheduler, keep running transfers.
    let space_mib = free_space(&cfg.general.storage_folder) >> 20;
    if space_mib < cfg.general.min_free_space {
        tracing::warn!(
            "not enough space left on device ({} MiB < {} MiB), pausing",
            space_mib,
            cfg.general.min_free_space
        );
        sched.pause();
    }

    if !sched.is_paused() {
        let slots = sched.slots.lock().unwrap();
        if let Some(slot) = slots.iter().find(|s| s.is_free()) {
            slot.assign(job);
            return Ok(());
        }
    }

    // No slot (or paused mid-check): park the job under the occupied set it
    // was pulled with, then see whether a decrypter can use the time.
    sched.ctx.store.defer_job(occupied, job.file.id);
    if let Some(file) = sched.ctx.store.next_decrypt_job() {
        match sched.ctx.registry.create(&file.plugin_name) {
            Ok(plugin) => {
                spawn_decrypter(
                    Arc::clone(&sched.ctx),
                    Arc::clone(&sched.decrypters),
                    Job { file, plugin },
                );
            }
            Err(err) => {
                tracing::error!("plugin init failed for {}: {:#}", file.name(), err);
                file.set_status(FileStatus::Failed);
                file.set_error(format!("{:#}", err));
                sched.ctx.store.release(&file);
            }
        }
    }
    Ok(())
}

/// Plugins that cannot take another job right now: non-parallel hosters with
/// an active slot, plus account-limited plugins at their cap.
pub(super) fn occupied_plugins(sched: &Arc<Scheduler>) -> Vec<String> {
    let jobs = sched.slot_jobs();

    let mut counts: HashMap<&str, u32> = HashMap::new();
    for job in &jobs {
        *counts.entry(job.file.plugin_name.as_str()).or_insert(0) += 1;
    }

    let mut occupied: BTreeSet<String> = BTreeSet::new();
    for job in &jobs {
        let name = job.file.plugin_name.as_str();
        if !job.plugin.multi_dl() {
            occupied.insert(name.to_string());
            continue;
        }
        if let Some(login) = job.plugin.account_login() {
            let limit = sched.ctx.accounts.limit_dl(name, &login);
            if limit > 0 && counts.get(name).copied().unwrap_or(0) >= limit {
                occupied.insert(name.to_string());
            }
        }
    }
    occupied.into_iter().collect()
}
