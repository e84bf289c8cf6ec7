use crate::chain::BackupChain;
use crate::command::CommandLine;
use crate::decision::BackupPlan;
use crate::signal::{RunContext, TransferGuard};
use crate::utils::tail_lines;
use crate::Result;
use log::{debug, error, info, warn};
use std::fmt;
use std::fs::File;
use std::process::{Child, ChildStdout, ExitStatus, Stdio};
use std::time::Instant;

/// Lines of a failed stage's stderr repeated in the log
const STDERR_TAIL_LINES: usize = 5;

/// The four stages of a transfer, in stream order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Extract,
    Compress,
    Encrypt,
    Transport,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Extract,
        Stage::Compress,
        Stage::Encrypt,
        Stage::Transport,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Compress => "compress",
            Stage::Encrypt => "encrypt",
            Stage::Transport => "transport",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a single stage ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Exited(i32),
    /// Terminated by a signal, e.g. SIGPIPE after a downstream failure
    Signaled,
    NotStarted(String),
    /// Waiting for the process failed
    Lost(String),
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Exited(0))
    }

    fn from_exit(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => StageStatus::Exited(code),
            None => StageStatus::Signaled,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Exited(code) => write!(f, "exit {code}"),
            StageStatus::Signaled => write!(f, "killed by signal"),
            StageStatus::NotStarted(reason) => write!(f, "not started: {reason}"),
            StageStatus::Lost(reason) => write!(f, "status unknown: {reason}"),
        }
    }
}

/// Per-stage outcome of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResult {
    pub stages: Vec<(Stage, StageStatus)>,
    /// Every stage exited with status 0
    pub success: bool,
}

impl PipelineResult {
    pub fn from_stages(mut stages: Vec<(Stage, StageStatus)>) -> Self {
        stages.sort_by_key(|(stage, _)| *stage);
        let success = stages.len() == Stage::ALL.len()
            && stages.iter().all(|(_, status)| status.is_success());
        Self { stages, success }
    }

    pub fn status(&self, stage: Stage) -> Option<&StageStatus> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, status)| status)
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|(_, status)| !status.is_success())
            .map(|(stage, _)| *stage)
            .collect()
    }

    /// e.g. `extract (exit 3), compress (killed by signal)`
    pub fn describe_failures(&self) -> String {
        self.stages
            .iter()
            .filter(|(_, status)| !status.is_success())
            .map(|(stage, status)| format!("{stage} ({status})"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Pass-through stage used when compression or encryption is disabled
fn passthrough() -> CommandLine {
    CommandLine::new("cat")
}

/// Streams snapshot data through extract, compress, encrypt and transport
/// into a temporary remote object and commits it by rename.
pub struct TransferPipeline<'a> {
    context: &'a RunContext,
    compress: Option<CommandLine>,
    encrypt: Option<CommandLine>,
}

impl<'a> TransferPipeline<'a> {
    pub fn new(
        context: &'a RunContext,
        compress: Option<CommandLine>,
        encrypt: Option<CommandLine>,
    ) -> Self {
        Self {
            context,
            compress,
            encrypt,
        }
    }

    /// The command of every stage for `plan`, in stream order
    pub fn stage_commands(&self, plan: &BackupPlan) -> Vec<(Stage, CommandLine)> {
        vec![
            (
                Stage::Extract,
                self.context
                    .snapshots()
                    .send_command(&plan.volume, plan.from.as_deref(), &plan.to),
            ),
            (
                Stage::Compress,
                self.compress.clone().unwrap_or_else(passthrough),
            ),
            (
                Stage::Encrypt,
                self.encrypt.clone().unwrap_or_else(passthrough),
            ),
            (
                Stage::Transport,
                self.context.remote().write_command(&plan.temp_name()),
            ),
        ]
    }

    /// Run the transfer of `plan`, tracked by `guard`.
    ///
    /// On success the artifact is committed under its final name and appended
    /// to `chain`. On any stage failure the temporary object and a snapshot
    /// created for this attempt are removed and the per-stage statuses are
    /// returned. A failed commit is rolled back too and returned as error.
    pub fn run(
        &self,
        plan: &BackupPlan,
        guard: TransferGuard,
        chain: &mut BackupChain,
    ) -> Result<PipelineResult> {
        info!("{}: transferring {plan}", plan.volume);
        let started = Instant::now();
        let result = PipelineResult::from_stages(self.execute(self.stage_commands(plan)));

        if !result.success {
            self.report_failures(plan, &result);
            guard.rollback();
            return Ok(result);
        }

        let remote = self.context.remote();
        if let Err(e) = guard.commit(|| remote.rename(&plan.temp_name(), &plan.artifact_name)) {
            error!("{}: commit of {} failed: {e}", plan.volume, plan.artifact_name);
            return Err(e);
        }
        chain.push(plan.artifact());

        info!(
            "{}: committed {} in {:.1}s",
            plan.volume,
            plan.artifact_name,
            started.elapsed().as_secs_f64()
        );
        Ok(result)
    }

    /// Spawn all stages connected by pipes and collect their exit statuses
    fn execute(&self, commands: Vec<(Stage, CommandLine)>) -> Vec<(Stage, StageStatus)> {
        let mut running: Vec<(Stage, Child)> = Vec::new();
        let mut statuses: Vec<(Stage, StageStatus)> = Vec::new();
        let mut upstream: Option<ChildStdout> = None;
        let mut broken: Option<String> = None;

        for (stage, command_line) in commands {
            if let Some(reason) = &broken {
                statuses.push((stage, StageStatus::NotStarted(reason.clone())));
                continue;
            }

            let mut command = command_line.to_command();
            command
                .stdin(upstream.take().map_or_else(Stdio::null, Stdio::from))
                .stdout(if stage == Stage::Transport {
                    Stdio::null()
                } else {
                    Stdio::piped()
                })
                .stderr(self.stderr_for(stage));

            debug!("{stage}: {command_line}");
            match command.spawn() {
                Ok(mut child) => {
                    self.context.register_stage(child.id());
                    upstream = child.stdout.take();
                    running.push((stage, child));
                }
                Err(e) => {
                    statuses.push((
                        stage,
                        StageStatus::NotStarted(format!("{}: {e}", command_line.program())),
                    ));
                    broken = Some(format!("{stage} stage did not start"));
                }
            }
        }

        if broken.is_some() {
            for (_, child) in &mut running {
                let _ = child.kill();
            }
        }

        // the transport stage decides whether anything reached the remote
        running.sort_by_key(|(stage, _)| (*stage != Stage::Transport, *stage));
        for (stage, mut child) in running {
            let status = match child.wait() {
                Ok(status) => StageStatus::from_exit(status),
                Err(e) => StageStatus::Lost(e.to_string()),
            };
            self.context.unregister_stage(child.id());
            debug!("{stage}: {status}");
            statuses.push((stage, status));
        }

        statuses
    }

    /// stderr of a stage goes to a log file in the working directory
    fn stderr_for(&self, stage: Stage) -> Stdio {
        let path = self.context.work_dir().join(format!("{stage}.stderr"));
        match File::create(&path) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!("cannot log {stage} output to {}: {e}", path.display());
                Stdio::inherit()
            }
        }
    }

    fn report_failures(&self, plan: &BackupPlan, result: &PipelineResult) {
        error!(
            "{}: transfer of {} failed: {}",
            plan.volume,
            plan.artifact_name,
            result.describe_failures()
        );
        for stage in result.failed_stages() {
            let log = self.context.work_dir().join(format!("{stage}.stderr"));
            let tail = tail_lines(&log, STDERR_TAIL_LINES);
            if !tail.is_empty() {
                error!("{}: {stage} stderr:\n{tail}", plan.volume);
            }
        }
    }
}
