//! Long-lived worker slot: runs one job at a time from an inbox.
//!
//! A slot accepts a job or a quit signal; quit is only honored between jobs,
//! never mid-transfer. The slot is the sole writer of its active cell while
//! running; the scheduler snapshots it for policy decisions.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::context::Context;
use crate::error::Aborted;
use crate::file::{FileRef, FileStatus};
use crate::plugin::HosterPlugin;
use crate::store::FileStore;

/// A file bound to an instantiated plugin, ready to run.
pub struct Job {
    pub file: FileRef,
    pub plugin: Arc<dyn HosterPlugin>,
}

impl Clone for Job {
    fn clone(&self) -> Self {
        Job {
            file: Arc::clone(&self.file),
            plugin: Arc::clone(&self.plugin),
        }
    }
}

pub(super) enum SlotCommand {
    Run(Job),
    Quit,
}

pub(super) struct WorkerSlot {
    tx: mpsc::Sender<SlotCommand>,
    active: Arc<Mutex<Option<Job>>>,
    _handle: JoinHandle<()>,
}

impl WorkerSlot {
    pub fn spawn(ctx: Arc<Context>) -> Self {
        let (tx, rx) = mpsc::channel();
        let active: Arc<Mutex<Option<Job>>> = Arc::new(Mutex::new(None));
        let slot_active = Arc::clone(&active);
        let handle = std::thread::spawn(move || slot_loop(rx, slot_active, ctx));
        WorkerSlot {
            tx,
            active,
            _handle: handle,
        }
    }

    pub fn active_job(&self) -> Option<Job> {
        self.active.lock().unwrap().clone()
    }

    pub fn is_free(&self) -> bool {
        self.active.lock().unwrap().is_none()
    }

    /// Hand a job to this slot. The active cell is set here, under the
    /// caller's tick, so the slot never looks free while a job is in flight.
    pub fn assign(&self, job: Job) {
        *self.active.lock().unwrap() = Some(job.clone());
        if self.tx.send(SlotCommand::Run(job)).is_err() {
            // Slot thread is gone; drop the claim so the job is not stuck.
            *self.active.lock().unwrap() = None;
        }
    }

    /// Ask the slot to exit after its current job.
    pub fn quit(&self) {
        let _ = self.tx.send(SlotCommand::Quit);
    }
}

fn slot_loop(rx: mpsc::Receiver<SlotCommand>, active: Arc<Mutex<Option<Job>>>, ctx: Arc<Context>) {
    while let Ok(command) = rx.recv() {
        match command {
            SlotCommand::Quit => break,
            SlotCommand::Run(job) => {
                run_job(&job, &ctx);
                *active.lock().unwrap() = None;
            }
        }
    }
}

/// Execute one job and hand the file back to the store.
pub(super) fn run_job(job: &Job, ctx: &Context) {
    let file = &job.file;
    file.clear_error();
    file.set_status(FileStatus::Downloading);
    tracing::info!("download starting: {}", file.name());

    match job.plugin.process(file, ctx) {
        Ok(()) => {
            file.set_status(FileStatus::Finished);
            tracing::info!("download finished: {}", file.name());
        }
        Err(err) if err.is::<Aborted>() => {
            file.set_status(FileStatus::Aborted);
            tracing::info!("download aborted: {}", file.name());
        }
        Err(err) => {
            file.set_status(FileStatus::Failed);
            file.set_error(format!("{:#}", err));
            tracing::warn!("download failed: {}: {:#}", file.name(), err);
        }
    }
    file.set_speed(0);
    file.clear_abort();
    ctx.store.release(file);
}

/// Run a decrypter job on its own short-lived thread. The job is tracked in
/// `registry` so active-file views include it.
pub(super) fn spawn_decrypter(ctx: Arc<Context>, registry: Arc<Mutex<Vec<Job>>>, job: Job) {
    registry.lock().unwrap().push(job.clone());
    std::thread::spawn(move || {
        let file = &job.file;
        file.set_status(FileStatus::Decrypting);
        tracing::debug!("decrypting {}", file.name());
        match job.plugin.process(file, &ctx) {
            Ok(()) => file.set_status(FileStatus::Finished),
            Err(err) => {
                file.set_status(FileStatus::Failed);
                file.set_error(format!("{:#}", err));
                tracing::warn!("decrypter failed: {}: {:#}", file.name(), err);
            }
        }
        ctx.store.release(file);
        registry.lock().unwrap().retain(|j| j.file.id != job.file.id);
    });
}
