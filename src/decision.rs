use crate::chain::{BackupArtifact, BackupChain, BackupKind};
use crate::error::ZbakError;
use crate::naming::{temp_name, Naming};
use crate::signal::{RunContext, TransferGuard};
use crate::Result;
use chrono::NaiveDateTime;
use log::{info, warn};
use std::fmt;

/// What to transfer for one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    pub volume: String,
    pub kind: BackupKind,
    /// Base snapshot of an incremental backup
    pub from: Option<String>,
    pub to: String,
    pub artifact_name: String,
    /// The target snapshot was created for this attempt
    pub created_snapshot: bool,
}

impl BackupPlan {
    pub fn artifact(&self) -> BackupArtifact {
        BackupArtifact::new(self.volume.clone(), self.to.clone(), self.kind)
    }

    pub fn temp_name(&self) -> String {
        temp_name(&self.artifact_name)
    }
}

impl fmt::Display for BackupPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from {
            Some(from) => write!(
                f,
                "{} {}@{}..{} -> {}",
                self.kind, self.volume, from, self.to, self.artifact_name
            ),
            None => write!(
                f,
                "{} {}@{} -> {}",
                self.kind, self.volume, self.to, self.artifact_name
            ),
        }
    }
}

/// A settled plan plus the snapshot housekeeping needed before the transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub plan: BackupPlan,
    /// Superseded snapshots to destroy, newest first
    pub stale_snapshots: Vec<String>,
    /// The target snapshot still has to be created
    pub create_snapshot: bool,
}

/// Inputs of the decision that do not change between volumes
#[derive(Debug, Clone)]
pub struct DecisionPolicy<'a> {
    pub naming: &'a Naming,
    pub full_backup_interval: usize,
    pub self_managed: bool,
}

impl DecisionPolicy<'_> {
    /// Pick FULL or INCREMENTAL and the snapshot range, without side effects.
    ///
    /// `snapshots` is the current snapshot set of the volume, `now` names the
    /// snapshot taken in self-managed mode.
    pub fn decide(
        &self,
        volume: &str,
        chain: &BackupChain,
        snapshots: &[String],
        now: NaiveDateTime,
    ) -> Result<Decision> {
        let mut matching: Vec<&String> = snapshots
            .iter()
            .filter(|name| self.naming.is_snapshot_name(name))
            .collect();
        matching.sort();

        let interval_due = chain.len() % self.full_backup_interval.max(1) == 0;
        let full_due = interval_due || !chain.has_full();

        let target = if self.self_managed {
            let name = self.naming.snapshot_name_at(now);
            if snapshots.contains(&name) {
                return Err(ZbakError::DuplicateSnapshot {
                    volume: volume.to_string(),
                    snapshot: name,
                });
            }
            name
        } else {
            match matching.last() {
                Some(name) => (*name).clone(),
                None => {
                    return Err(ZbakError::NoSnapshot {
                        volume: volume.to_string(),
                        prefix: self.naming.snapshot_prefix().to_string(),
                    })
                }
            }
        };

        let last = chain.last();
        // before the kind choice, so a due full never resends the last snapshot
        if let Some(last) = last {
            if last.snapshot == target {
                return Err(ZbakError::NoNewData {
                    volume: volume.to_string(),
                    snapshot: target,
                });
            }
        }

        let (kind, from) = match last {
            Some(last) if !full_due => {
                if snapshots.contains(&last.snapshot) {
                    (BackupKind::Incremental, Some(last.snapshot.clone()))
                } else {
                    warn!(
                        "{volume}: base snapshot {} no longer exists, promoting to full backup",
                        last.snapshot
                    );
                    (BackupKind::Full, None)
                }
            }
            _ => (BackupKind::Full, None),
        };

        // all but the newest existing match
        let stale_snapshots = if self.self_managed && full_due {
            matching
                .iter()
                .rev()
                .skip(1)
                .map(|name| (*name).clone())
                .collect()
        } else {
            Vec::new()
        };

        let artifact = BackupArtifact::new(volume, target.clone(), kind);
        let plan = BackupPlan {
            volume: volume.to_string(),
            kind,
            from,
            artifact_name: self.naming.artifact_name(&artifact),
            to: target,
            created_snapshot: false,
        };

        Ok(Decision {
            plan,
            stale_snapshots,
            create_snapshot: self.self_managed,
        })
    }
}

/// Perform the snapshot housekeeping of a decision and return the final plan.
///
/// A snapshot created here is recorded in `guard` so an interrupt or a failed
/// transfer destroys it again.
pub fn apply_decision(
    context: &RunContext,
    guard: &TransferGuard,
    decision: Decision,
) -> Result<BackupPlan> {
    let Decision {
        mut plan,
        stale_snapshots,
        create_snapshot,
    } = decision;

    for name in &stale_snapshots {
        if let Err(e) = context.snapshots().destroy_snapshot(&plan.volume, name) {
            warn!("{}: could not destroy old snapshot {name}: {e}", plan.volume);
        }
    }

    if create_snapshot {
        guard.create_snapshot(&plan.volume, &plan.to)?;
        plan.created_snapshot = true;
    }

    info!("{}: planned {plan}", plan.volume);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::LocalRemote;
    use crate::snapshot::testing::FakeSnapshots;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn naming() -> Naming {
        Naming::new("bak-", "%Y%m%d-%H%M", '_')
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 3)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    /// A chain of `len` artifacts: one full followed by incrementals, the last on `last`
    fn chain_ending_with(len: usize, last: &str) -> BackupChain {
        let mut artifacts: Vec<BackupArtifact> = (0..len.saturating_sub(1))
            .map(|i| {
                let kind = if i == 0 {
                    BackupKind::Full
                } else {
                    BackupKind::Incremental
                };
                BackupArtifact::new("tank/home", format!("bak-20231201-{i:04}"), kind)
            })
            .collect();
        let kind = if len == 1 {
            BackupKind::Full
        } else {
            BackupKind::Incremental
        };
        artifacts.push(BackupArtifact::new("tank/home", last, kind));
        BackupChain::from_artifacts("tank/home", artifacts)
    }

    fn external(naming: &Naming, interval: usize) -> DecisionPolicy<'_> {
        DecisionPolicy {
            naming,
            full_backup_interval: interval,
            self_managed: false,
        }
    }

    #[test]
    fn test_first_backup_is_full() {
        let naming = naming();
        let decision = external(&naming, 14)
            .decide(
                "tank/home",
                &BackupChain::new("tank/home"),
                &names(&["bak-20240101-0000"]),
                now(),
            )
            .unwrap();

        assert_eq!(decision.plan.kind, BackupKind::Full);
        assert_eq!(decision.plan.from, None);
        assert_eq!(decision.plan.to, "bak-20240101-0000");
        assert_eq!(decision.plan.artifact_name, "tank_home-bak-20240101-0000.full");
        assert!(!decision.create_snapshot);
        assert!(decision.stale_snapshots.is_empty());
    }

    #[test]
    fn test_incremental_between_last_and_latest() {
        let naming = naming();
        let chain = chain_ending_with(13, "bak-20240101-0000");
        let decision = external(&naming, 14)
            .decide(
                "tank/home",
                &chain,
                &names(&["bak-20240101-0000", "bak-20240102-0000"]),
                now(),
            )
            .unwrap();

        assert_eq!(decision.plan.kind, BackupKind::Incremental);
        assert_eq!(decision.plan.from.as_deref(), Some("bak-20240101-0000"));
        assert_eq!(decision.plan.to, "bak-20240102-0000");
        assert!(decision
            .plan
            .artifact_name
            .ends_with("-bak-20240102-0000.incr"));
        assert_eq!(decision.plan.temp_name(), "tank_home-bak-20240102-0000.incr#");
    }

    #[test]
    fn test_missing_base_promotes_to_full() {
        let naming = naming();
        let chain = chain_ending_with(13, "bak-20240101-0000");
        let decision = external(&naming, 14)
            .decide("tank/home", &chain, &names(&["bak-20240102-0000"]), now())
            .unwrap();

        assert_eq!(decision.plan.kind, BackupKind::Full);
        assert_eq!(decision.plan.from, None);
        assert_eq!(decision.plan.artifact_name, "tank_home-bak-20240102-0000.full");
    }

    #[test]
    fn test_interval_forces_full() {
        let naming = naming();
        let chain = chain_ending_with(14, "bak-20240101-0000");
        let decision = external(&naming, 14)
            .decide(
                "tank/home",
                &chain,
                &names(&["bak-20240101-0000", "bak-20240102-0000"]),
                now(),
            )
            .unwrap();
        assert_eq!(decision.plan.kind, BackupKind::Full);
    }

    #[test]
    fn test_chain_without_full_forces_full() {
        let naming = naming();
        let chain = BackupChain::from_artifacts(
            "tank/home",
            vec![BackupArtifact::new(
                "tank/home",
                "bak-20240101-0000",
                BackupKind::Incremental,
            )],
        );
        let decision = external(&naming, 14)
            .decide(
                "tank/home",
                &chain,
                &names(&["bak-20240101-0000", "bak-20240102-0000"]),
                now(),
            )
            .unwrap();
        assert_eq!(decision.plan.kind, BackupKind::Full);
    }

    #[test]
    fn test_unchanged_state_yields_no_new_data() {
        let naming = naming();
        let snapshots = names(&["bak-20240101-0000", "bak-20240102-0000"]);

        for (len, interval) in [(5, 14), (14, 14), (3, 1)] {
            let chain = chain_ending_with(len, "bak-20240102-0000");
            match external(&naming, interval).decide("tank/home", &chain, &snapshots, now()) {
                Err(ZbakError::NoNewData { snapshot, .. }) => {
                    assert_eq!(snapshot, "bak-20240102-0000")
                }
                other => panic!("Expected NoNewData for len {len}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_no_matching_snapshot() {
        let naming = naming();
        match external(&naming, 14).decide(
            "tank/home",
            &BackupChain::new("tank/home"),
            &names(&["manual-1", "bak-garbage"]),
            now(),
        ) {
            Err(ZbakError::NoSnapshot { prefix, .. }) => assert_eq!(prefix, "bak-"),
            other => panic!("Expected NoSnapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_external_ignores_foreign_snapshots() {
        let naming = naming();
        let decision = external(&naming, 14)
            .decide(
                "tank/home",
                &BackupChain::new("tank/home"),
                &names(&["bak-20240101-0000", "zz-manual"]),
                now(),
            )
            .unwrap();
        assert_eq!(decision.plan.to, "bak-20240101-0000");
    }

    #[test]
    fn test_self_managed_full_cleans_old_snapshots() {
        let naming = naming();
        let policy = DecisionPolicy {
            naming: &naming,
            full_backup_interval: 14,
            self_managed: true,
        };
        let decision = policy
            .decide(
                "tank/home",
                &BackupChain::new("tank/home"),
                &names(&[
                    "bak-20231230-0000",
                    "bak-20231231-0000",
                    "bak-20240101-0000",
                    "manual",
                ]),
                now(),
            )
            .unwrap();

        assert_eq!(decision.plan.to, "bak-20240103-0000");
        assert_eq!(decision.plan.kind, BackupKind::Full);
        assert!(decision.create_snapshot);
        assert_eq!(
            decision.stale_snapshots,
            vec!["bak-20231231-0000", "bak-20231230-0000"]
        );
    }

    #[test]
    fn test_self_managed_incremental_keeps_snapshots() {
        let naming = naming();
        let policy = DecisionPolicy {
            naming: &naming,
            full_backup_interval: 14,
            self_managed: true,
        };
        let chain = chain_ending_with(2, "bak-20240102-0000");
        let decision = policy
            .decide(
                "tank/home",
                &chain,
                &names(&["bak-20240101-0000", "bak-20240102-0000"]),
                now(),
            )
            .unwrap();

        assert_eq!(decision.plan.kind, BackupKind::Incremental);
        assert_eq!(decision.plan.from.as_deref(), Some("bak-20240102-0000"));
        assert_eq!(decision.plan.to, "bak-20240103-0000");
        assert!(decision.stale_snapshots.is_empty());
    }

    #[test]
    fn test_self_managed_duplicate() {
        let naming = naming();
        let policy = DecisionPolicy {
            naming: &naming,
            full_backup_interval: 14,
            self_managed: true,
        };
        match policy.decide(
            "tank/home",
            &BackupChain::new("tank/home"),
            &names(&["bak-20240103-0000"]),
            now(),
        ) {
            Err(ZbakError::DuplicateSnapshot { snapshot, .. }) => {
                assert_eq!(snapshot, "bak-20240103-0000")
            }
            other => panic!("Expected DuplicateSnapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_apply_decision() {
        let naming = naming();
        let dir = tempdir().unwrap();
        let store = Arc::new(FakeSnapshots::with(&["bak-20231231-0000", "bak-20240101-0000"]));
        let context = RunContext::new(
            Arc::new(LocalRemote::new(dir.path())),
            store.clone(),
            dir.path(),
        );
        let policy = DecisionPolicy {
            naming: &naming,
            full_backup_interval: 14,
            self_managed: true,
        };
        let decision = policy
            .decide(
                "tank/home",
                &BackupChain::new("tank/home"),
                &store.names(),
                now(),
            )
            .unwrap();

        let guard = context.register_plan(&decision.plan);
        let plan = apply_decision(&context, &guard, decision).unwrap();
        assert!(plan.created_snapshot);
        assert_eq!(
            store.names(),
            vec!["bak-20240101-0000", "bak-20240103-0000"]
        );
        assert_eq!(*store.destroyed.lock().unwrap(), vec!["bak-20231231-0000"]);
        assert_eq!(
            context.pending_transfers()[0].created_snapshot.as_deref(),
            Some("bak-20240103-0000")
        );

        // an abandoned attempt takes its snapshot with it
        drop(guard);
        assert_eq!(store.names(), vec!["bak-20240101-0000"]);
    }

    #[test]
    fn test_successive_decisions_keep_chain_linked() {
        let naming = naming();
        let policy = external(&naming, 3);
        let mut chain = BackupChain::new("tank/home");
        let mut snapshots = Vec::new();

        for day in 1..=7 {
            snapshots.push(format!("bak-202401{day:02}-0000"));
            let plan = policy
                .decide("tank/home", &chain, &snapshots, now())
                .unwrap()
                .plan;
            if let Some(from) = &plan.from {
                assert_eq!(Some(from), chain.last().map(|a| &a.snapshot));
            }
            chain.push(plan.artifact());
        }

        assert!(chain.is_anchored());
        let kinds: Vec<BackupKind> = chain.artifacts().iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BackupKind::Full,
                BackupKind::Incremental,
                BackupKind::Incremental,
                BackupKind::Full,
                BackupKind::Incremental,
                BackupKind::Incremental,
                BackupKind::Full,
            ]
        );
    }
}
