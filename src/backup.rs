use crate::chain::BackupKind;
use crate::command::CommandLine;
use crate::config::Config;
use crate::decision::{apply_decision, BackupPlan, Decision, DecisionPolicy};
use crate::error::ZbakError;
use crate::lister::list_remote_state;
use crate::naming::Naming;
use crate::pipeline::{PipelineResult, TransferPipeline};
use crate::retention::{prune, KeepFullChains, PruneOutcome};
use crate::signal::RunContext;
use crate::utils::validate_volume;
use crate::Result;
use chrono::NaiveDateTime;
use log::{info, warn};
use std::path::Path;
use std::time::{Duration, Instant};

const PASSPHRASE_PLACEHOLDER: &str = "passphrase_file";

/// Settings shared by every volume of a run
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub naming: Naming,
    pub full_backup_interval: usize,
    pub self_managed: bool,
    pub compress: Option<CommandLine>,
    pub encrypt: Option<CommandLine>,
    pub retention: KeepFullChains,
}

impl BackupSettings {
    /// Resolve the configured stage commands, filling in the passphrase file
    pub fn from_config(config: &Config, passphrase_file: Option<&Path>) -> Result<Self> {
        let compress = CommandLine::parse_optional(&config.compress_command)?;
        let encrypt = match CommandLine::parse_optional(&config.encrypt_command)? {
            Some(encrypt) if encrypt.has_placeholder(PASSPHRASE_PLACEHOLDER) => {
                let Some(passphrase_file) = passphrase_file else {
                    return Err(ZbakError::validation(
                        "encrypt_command needs a passphrase file (--passphrase-file)",
                    ));
                };
                if !passphrase_file.is_file() {
                    return Err(ZbakError::validation(format!(
                        "Passphrase file not found: {}",
                        passphrase_file.display()
                    )));
                }
                Some(encrypt.substitute(
                    PASSPHRASE_PLACEHOLDER,
                    &passphrase_file.to_string_lossy(),
                ))
            }
            other => other,
        };

        if encrypt.is_none() {
            warn!("encryption is disabled, artifacts are stored unencrypted");
        }

        Ok(Self {
            naming: Naming::from_config(config),
            full_backup_interval: config.full_backup_interval,
            self_managed: config.self_managed_snapshots,
            compress,
            encrypt,
            retention: KeepFullChains {
                chains: config.retention_full_chains,
            },
        })
    }

    pub fn policy(&self) -> DecisionPolicy<'_> {
        DecisionPolicy {
            naming: &self.naming,
            full_backup_interval: self.full_backup_interval,
            self_managed: self.self_managed,
        }
    }
}

#[derive(Debug)]
pub struct BackupResult {
    pub plan: BackupPlan,
    pub pipeline: PipelineResult,
    /// `None` when pruning failed after the commit
    pub pruned: Option<PruneOutcome>,
    pub duration: Duration,
}

impl BackupResult {
    pub fn summary(&self) -> String {
        let kind = match self.plan.kind {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        };
        let mut summary = format!(
            "{}: {kind} backup {} ({:.1}s)",
            self.plan.volume,
            self.plan.artifact_name,
            self.duration.as_secs_f64()
        );
        if let Some(PruneOutcome::Pruned(count)) = self.pruned {
            summary.push_str(&format!(", pruned {count} old artifact(s)"));
        }
        summary
    }
}

/// Back up a single volume: list, decide, transfer, prune
pub fn backup_volume(
    context: &RunContext,
    settings: &BackupSettings,
    volume: &str,
    now: NaiveDateTime,
) -> Result<BackupResult> {
    let start_time = Instant::now();
    validate_volume(volume)?;
    if context.is_interrupted() {
        return Err(ZbakError::Interrupted);
    }

    let listing = list_remote_state(context.remote(), &settings.naming, volume)?;
    let mut chain = listing.chain;
    if !listing.stale_temporaries.is_empty() {
        warn!(
            "{volume}: removing {} unfinished upload(s) of an earlier run",
            listing.stale_temporaries.len()
        );
        context.remote().delete(&listing.stale_temporaries)?;
    }

    let snapshots = context.snapshots().list_snapshots(volume)?;
    let decision = settings.policy().decide(volume, &chain, &snapshots, now)?;
    let guard = context.register_plan(&decision.plan);
    let plan = apply_decision(context, &guard, decision)?;

    let pipeline = TransferPipeline::new(
        context,
        settings.compress.clone(),
        settings.encrypt.clone(),
    );
    let result = pipeline.run(&plan, guard, &mut chain)?;
    if !result.success {
        return Err(ZbakError::PipelineFailed {
            artifact: plan.artifact_name.clone(),
            stages: result.describe_failures(),
        });
    }

    let pruned = match prune(
        context.remote(),
        &settings.naming,
        &mut chain,
        &settings.retention,
    ) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!("{volume}: pruning failed, old artifacts kept: {e}");
            None
        }
    };

    Ok(BackupResult {
        plan,
        pipeline: result,
        pruned,
        duration: start_time.elapsed(),
    })
}

/// What `backup_volume` would do, without touching snapshots or the remote
pub fn plan_volume(
    context: &RunContext,
    settings: &BackupSettings,
    volume: &str,
    now: NaiveDateTime,
) -> Result<Decision> {
    validate_volume(volume)?;

    let listing = list_remote_state(context.remote(), &settings.naming, volume)?;
    let snapshots = context.snapshots().list_snapshots(volume)?;
    let decision = settings
        .policy()
        .decide(volume, &listing.chain, &snapshots, now)?;

    info!("{volume}: would run {}", decision.plan);
    for name in &decision.stale_snapshots {
        info!("{volume}: would destroy snapshot {name}");
    }
    if decision.create_snapshot {
        info!("{volume}: would create snapshot {}", decision.plan.to);
    }
    if !listing.stale_temporaries.is_empty() {
        info!(
            "{volume}: would remove {} unfinished upload(s)",
            listing.stale_temporaries.len()
        );
    }
    if !listing.malformed.is_empty() {
        info!(
            "{volume}: would leave {} unrecognised file(s) alone",
            listing.malformed.len()
        );
    }
    Ok(decision)
}
