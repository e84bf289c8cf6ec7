use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZbakError {
    #[error("Snapshot {volume}@{snapshot} already exists")]
    DuplicateSnapshot { volume: String, snapshot: String },

    #[error("No snapshot matching '{prefix}' found for {volume}")]
    NoSnapshot { volume: String, prefix: String },

    #[error("No new data for {volume}: latest snapshot {snapshot} is already backed up")]
    NoNewData { volume: String, snapshot: String },

    #[error("Remote store error: {message}")]
    Transport { message: String },

    #[error("Command `{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Malformed artifact name: {name}")]
    MalformedArtifactName { name: String },

    #[error("Transfer of {artifact} failed in stage(s): {stages}")]
    PipelineFailed { artifact: String, stages: String },

    #[error("Another zbak instance is running (pid {pid}, lock {})", .lock.display())]
    AlreadyRunning { pid: i32, lock: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Could not install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("Operation interrupted by signal")]
    Interrupted,

    #[error("Validation error: {message}")]
    Validation { message: String },
}

impl ZbakError {
    /// Create a configuration error with a custom message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error with a custom message
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Conditions under which the volume is skipped without touching any state
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ZbakError::DuplicateSnapshot { .. }
                | ZbakError::NoSnapshot { .. }
                | ZbakError::NoNewData { .. }
        )
    }

    /// Check if this error only affects the current volume (the run can continue)
    pub fn is_recoverable(&self) -> bool {
        self.is_skip()
            || matches!(
                self,
                ZbakError::Transport { .. }
                    | ZbakError::Command { .. }
                    | ZbakError::MalformedArtifactName { .. }
                    | ZbakError::PipelineFailed { .. }
                    | ZbakError::Io(_)
            )
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ZbakError::Interrupted => 130,
            _ => 1,
        }
    }

    /// Provide helpful suggestions for resolving the error
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            ZbakError::AlreadyRunning { lock, .. } => vec![
                "Wait for the running backup to finish".to_string(),
                format!(
                    "Remove {} if no zbak process is actually running",
                    lock.display()
                ),
            ],
            ZbakError::NoSnapshot { prefix, .. } => vec![
                format!("Create a snapshot named {prefix}<timestamp>"),
                "Run with --self-managed to let zbak create snapshots".to_string(),
            ],
            ZbakError::DuplicateSnapshot { .. } => vec![
                "Use a finer snapshot_timestamp_format".to_string(),
                "Wait until the timestamp changes before running again".to_string(),
            ],
            ZbakError::Transport { .. } => vec![
                "Check that the destination host is reachable over ssh".to_string(),
                "Verify the remote directory exists and is writable".to_string(),
            ],
            ZbakError::Config { .. } => {
                vec!["Run 'zbak --dump-config' to inspect the effective settings".to_string()]
            }
            _ => vec![],
        }
    }
}
