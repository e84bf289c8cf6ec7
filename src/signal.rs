use crate::config::Config;
use crate::decision::BackupPlan;
use crate::error::ZbakError;
use crate::lock::{release_lock_file, InstanceLock};
use crate::remote::RemoteStore;
use crate::snapshot::SnapshotStore;
use crate::utils::process_alive;
use crate::Result;
use log::{debug, error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How long an interrupt waits for terminated stages before rolling back anyway
const STAGE_EXIT_TIMEOUT: Duration = Duration::from_secs(10);
const STAGE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A transfer whose temporary object has not been committed yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub volume: String,
    pub temp_name: String,
    /// Snapshot created for this attempt, destroyed again on rollback
    pub created_snapshot: Option<String>,
}

/// Undo an uncommitted transfer: delete the temporary object and the orphaned snapshot
pub fn rollback_transfer(
    remote: &dyn RemoteStore,
    snapshots: &dyn SnapshotStore,
    pending: &PendingTransfer,
) {
    warn!("{}: rolling back {}", pending.volume, pending.temp_name);
    if let Err(e) = remote.delete(std::slice::from_ref(&pending.temp_name)) {
        error!(
            "{}: could not remove {}: {e}",
            pending.volume, pending.temp_name
        );
    }
    if let Some(snapshot) = &pending.created_snapshot {
        if let Err(e) = snapshots.destroy_snapshot(&pending.volume, snapshot) {
            error!(
                "{}: could not destroy snapshot {snapshot}: {e}",
                pending.volume
            );
        }
    }
}

/// Process-wide state of one run, shared with the signal handler
#[derive(Clone)]
pub struct RunContext {
    interrupt_flag: Arc<AtomicBool>,
    active_stages: Arc<Mutex<HashSet<u32>>>,
    pending_transfers: Arc<Mutex<Vec<PendingTransfer>>>,
    remote: Arc<dyn RemoteStore>,
    snapshots: Arc<dyn SnapshotStore>,
    work_dir: PathBuf,
    lock_path: Option<PathBuf>,
}

impl RunContext {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        snapshots: Arc<dyn SnapshotStore>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interrupt_flag: Arc::new(AtomicBool::new(false)),
            active_stages: Arc::new(Mutex::new(HashSet::new())),
            pending_transfers: Arc::new(Mutex::new(Vec::new())),
            remote,
            snapshots,
            work_dir: work_dir.into(),
            lock_path: None,
        }
    }

    fn with_lock_path(mut self, path: PathBuf) -> Self {
        self.lock_path = Some(path);
        self
    }

    pub fn remote(&self) -> &dyn RemoteStore {
        self.remote.as_ref()
    }

    pub fn snapshots(&self) -> &dyn SnapshotStore {
        self.snapshots.as_ref()
    }

    /// Scratch directory of this run
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Check if an interrupt has been requested
    pub fn is_interrupted(&self) -> bool {
        self.interrupt_flag.load(Ordering::SeqCst)
    }

    /// Set interrupt state (mainly for testing)
    pub fn set_interrupted(&self, interrupted: bool) {
        self.interrupt_flag.store(interrupted, Ordering::SeqCst);
    }

    /// Track a running pipeline stage so an interrupt can stop it
    pub fn register_stage(&self, pid: u32) {
        if let Ok(mut stages) = self.active_stages.lock() {
            stages.insert(pid);
        }
    }

    pub fn unregister_stage(&self, pid: u32) {
        if let Ok(mut stages) = self.active_stages.lock() {
            stages.remove(&pid);
        }
    }

    pub fn active_stages(&self) -> Vec<u32> {
        self.active_stages
            .lock()
            .map(|stages| stages.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Send SIGTERM to every registered stage
    pub fn kill_active_stages(&self) {
        for pid in self.active_stages() {
            debug!("terminating stage process {pid}");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("could not signal {pid}: {e}");
            }
        }
    }

    /// Block until every registered stage was reaped or is gone.
    ///
    /// Returns false when stages are still running after `timeout`.
    pub fn wait_for_stages(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let running: Vec<u32> = self
                .active_stages()
                .into_iter()
                .filter(|pid| process_alive(*pid as i32))
                .collect();
            if running.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("stage process(es) {running:?} still running");
                return false;
            }
            thread::sleep(STAGE_POLL_INTERVAL);
        }
    }

    /// Register an uncommitted transfer; the guard rolls it back unless committed
    pub fn register_transfer(&self, pending: PendingTransfer) -> TransferGuard {
        let temp_name = pending.temp_name.clone();
        self.transfers().push(pending);
        TransferGuard {
            context: self.clone(),
            temp_name,
            finished: false,
        }
    }

    /// Register the transfer of `plan` before any of its side effects happen
    pub fn register_plan(&self, plan: &BackupPlan) -> TransferGuard {
        self.register_transfer(PendingTransfer {
            volume: plan.volume.clone(),
            temp_name: plan.temp_name(),
            created_snapshot: plan.created_snapshot.then(|| plan.to.clone()),
        })
    }

    pub fn pending_transfers(&self) -> Vec<PendingTransfer> {
        self.transfers().clone()
    }

    /// The registry lock also serializes rollback, commit and snapshot
    /// creation against the signal handler
    fn transfers(&self) -> MutexGuard<'_, Vec<PendingTransfer>> {
        self.pending_transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Cleanup after an interrupt or termination signal.
    ///
    /// Stops running stages and waits for them to exit, rolls back uncommitted
    /// transfers and removes the working directory and lock, since
    /// `process::exit` skips destructors.
    pub fn cleanup_interrupted(&self) {
        self.set_interrupted(true);
        self.kill_active_stages();
        // a snapshot cannot be destroyed while its send stream is open
        self.wait_for_stages(STAGE_EXIT_TIMEOUT);

        {
            let mut transfers = self.transfers();
            for transfer in transfers.drain(..) {
                rollback_transfer(self.remote(), self.snapshots(), &transfer);
            }
        }

        if self.work_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.work_dir) {
                warn!("could not remove {}: {e}", self.work_dir.display());
            }
        }
        if let Some(lock_path) = &self.lock_path {
            release_lock_file(lock_path);
        }
    }
}

/// RAII guard that rolls an uncommitted transfer back on drop
pub struct TransferGuard {
    context: RunContext,
    temp_name: String,
    finished: bool,
}

impl TransferGuard {
    /// Create the target snapshot and record it for rollback in one step
    pub fn create_snapshot(&self, volume: &str, name: &str) -> Result<()> {
        let mut transfers = self.context.transfers();
        let Some(pending) = transfers.iter_mut().find(|t| t.temp_name == self.temp_name) else {
            // already rolled back by an interrupt
            return Err(ZbakError::Interrupted);
        };
        self.context.snapshots().create_snapshot(volume, name)?;
        pending.created_snapshot = Some(name.to_string());
        Ok(())
    }

    /// Make the transfer final by running `publish` (the rename of the
    /// temporary object). On error the transfer is rolled back.
    pub fn commit(mut self, publish: impl FnOnce() -> Result<()>) -> Result<()> {
        {
            let mut transfers = self.context.transfers();
            let Some(index) = transfers.iter().position(|t| t.temp_name == self.temp_name)
            else {
                self.finished = true;
                return Err(ZbakError::Interrupted);
            };
            if let Err(e) = publish() {
                let pending = transfers.remove(index);
                self.finished = true;
                rollback_transfer(self.context.remote(), self.context.snapshots(), &pending);
                return Err(e);
            }
            transfers.remove(index);
        }
        self.finished = true;
        Ok(())
    }

    /// Delete the temporary object and any snapshot created for it
    pub fn rollback(mut self) {
        self.finish_with_rollback();
    }

    fn finish_with_rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut transfers = self.context.transfers();
        // an interrupt handler may have taken it already
        if let Some(index) = transfers.iter().position(|t| t.temp_name == self.temp_name) {
            let pending = transfers.remove(index);
            rollback_transfer(self.context.remote(), self.context.snapshots(), &pending);
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.finish_with_rollback();
    }
}

/// Lock, working directory and context of a run; released on drop
pub struct RunSession {
    context: RunContext,
    _work_dir: TempDir,
    _lock: InstanceLock,
}

impl RunSession {
    pub fn start(
        config: &Config,
        remote: Arc<dyn RemoteStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        let lock = InstanceLock::acquire(&config.lock_file)?;
        let work_dir = tempfile::Builder::new().prefix("zbak-").tempdir()?;
        debug!("working directory {}", work_dir.path().display());

        let context = RunContext::new(remote, snapshots, work_dir.path())
            .with_lock_path(lock.path().to_path_buf());

        Ok(Self {
            context,
            _work_dir: work_dir,
            _lock: lock,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }
}

/// Run the interrupt cleanup on SIGINT, SIGTERM and SIGHUP, then exit with 130
pub fn install_signal_handler(context: RunContext) -> Result<()> {
    ctrlc::set_handler(move || {
        error!("Interrupted, cleaning up...");
        context.cleanup_interrupted();
        std::process::exit(130);
    })?;
    Ok(())
}
