use crate::chain::BackupChain;
use crate::naming::Naming;
use crate::remote::RemoteStore;
use crate::Result;
use log::{error, info, warn};

/// Decides which prefix of a chain may be deleted
pub trait RetentionPolicy {
    /// Number of oldest artifacts to delete, `None` when the chain has no
    /// full artifact to anchor the retained part
    fn cutoff(&self, chain: &BackupChain) -> Option<usize>;
}

/// Keep the newest `chains` full artifacts and everything committed after them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepFullChains {
    pub chains: usize,
}

impl Default for KeepFullChains {
    fn default() -> Self {
        Self { chains: 1 }
    }
}

impl RetentionPolicy for KeepFullChains {
    fn cutoff(&self, chain: &BackupChain) -> Option<usize> {
        let fulls = chain.full_indices();
        if fulls.is_empty() {
            return None;
        }
        let keep = self.chains.max(1);
        if fulls.len() <= keep {
            return Some(fulls[0]);
        }
        Some(fulls[fulls.len() - keep])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    Pruned(usize),
    NothingToPrune,
    /// No full artifact exists, nothing was deleted
    NoFullBackup,
}

/// Delete everything before the retention boundary in one batch.
///
/// `chain` is updated to what remains on the remote store.
pub fn prune(
    remote: &dyn RemoteStore,
    naming: &Naming,
    chain: &mut BackupChain,
    policy: &dyn RetentionPolicy,
) -> Result<PruneOutcome> {
    let volume = chain.volume().to_string();

    let Some(cutoff) = policy.cutoff(chain) else {
        if !chain.is_empty() {
            warn!("{volume}: no full backup on the remote, skipping pruning");
        }
        return Ok(PruneOutcome::NoFullBackup);
    };
    if cutoff == 0 {
        return Ok(PruneOutcome::NothingToPrune);
    }

    let names: Vec<String> = chain.artifacts()[..cutoff]
        .iter()
        .map(|artifact| naming.artifact_name(artifact))
        .collect();

    if let Err(e) = remote.delete(&names) {
        error!("{volume}: pruning {} artifact(s) failed: {e}", names.len());
        return Err(e);
    }
    chain.remove_oldest(cutoff);

    info!("{volume}: pruned {cutoff} old artifact(s)");
    Ok(PruneOutcome::Pruned(cutoff))
}
