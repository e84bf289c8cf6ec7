pub mod backup;
pub mod chain;
pub mod command;
pub mod config;
pub mod decision;
pub mod error;
pub mod lister;
pub mod lock;
pub mod naming;
pub mod pipeline;
pub mod remote;
pub mod retention;
pub mod signal;
pub mod snapshot;
pub mod utils;

pub use backup::{backup_volume, plan_volume, BackupResult, BackupSettings};
pub use chain::{BackupArtifact, BackupChain, BackupKind};
pub use command::CommandLine;
pub use config::{default_config, dump_config, load_config, Config};
pub use decision::{apply_decision, BackupPlan, Decision, DecisionPolicy};
pub use error::ZbakError;
pub use lister::{list_remote_state, RemoteListing};
pub use lock::InstanceLock;
pub use naming::Naming;
pub use pipeline::{PipelineResult, Stage, StageStatus, TransferPipeline};
pub use remote::{open_destination, LocalRemote, RemoteStore, SshRemote};
pub use retention::{prune, KeepFullChains, PruneOutcome, RetentionPolicy};
pub use signal::{install_signal_handler, PendingTransfer, RunContext, RunSession, TransferGuard};
pub use snapshot::{SnapshotStore, ZfsSnapshots};
pub use utils::validate_volume;

/// Main library result type
pub type Result<T> = std::result::Result<T, ZbakError>;
