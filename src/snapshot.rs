use crate::command::CommandLine;
use crate::Result;
use log::info;

/// The point-in-time snapshot subsystem backing the protected volumes
pub trait SnapshotStore: Send + Sync {
    /// Snapshot names (without the `volume@` part) of one volume, sorted
    fn list_snapshots(&self, volume: &str) -> Result<Vec<String>>;

    fn create_snapshot(&self, volume: &str, name: &str) -> Result<()>;

    fn destroy_snapshot(&self, volume: &str, name: &str) -> Result<()>;

    /// Command writing the full stream of `to`, or the delta `from..to`, to stdout
    fn send_command(&self, volume: &str, from: Option<&str>, to: &str) -> CommandLine;
}

/// Snapshots managed through the `zfs` executable
#[derive(Debug, Clone)]
pub struct ZfsSnapshots {
    zfs: CommandLine,
}

impl ZfsSnapshots {
    pub fn new(zfs: CommandLine) -> Self {
        Self { zfs }
    }
}

impl SnapshotStore for ZfsSnapshots {
    fn list_snapshots(&self, volume: &str) -> Result<Vec<String>> {
        let output = self
            .zfs
            .clone()
            .args(["list", "-H", "-t", "snapshot", "-o", "name", "-d", "1", volume])
            .run()?;

        let own_prefix = format!("{volume}@");
        let mut names: Vec<String> = output
            .lines()
            .filter_map(|line| line.trim().strip_prefix(&own_prefix))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn create_snapshot(&self, volume: &str, name: &str) -> Result<()> {
        info!("{volume}: creating snapshot {name}");
        self.zfs
            .clone()
            .args(["snapshot", &format!("{volume}@{name}")])
            .run()?;
        Ok(())
    }

    fn destroy_snapshot(&self, volume: &str, name: &str) -> Result<()> {
        info!("{volume}: destroying snapshot {name}");
        self.zfs
            .clone()
            .args(["destroy", &format!("{volume}@{name}")])
            .run()?;
        Ok(())
    }

    fn send_command(&self, volume: &str, from: Option<&str>, to: &str) -> CommandLine {
        let send = self.zfs.clone().arg("send");
        let send = match from {
            Some(from) => send.args(["-i", &format!("{volume}@{from}")]),
            None => send,
        };
        send.arg(format!("{volume}@{to}"))
    }
}
