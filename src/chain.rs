use std::fmt;

/// Whether an artifact carries a complete snapshot or the delta to its predecessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    /// File name suffix used on the remote store
    pub fn suffix(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incr",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "full" => Some(BackupKind::Full),
            "incr" => Some(BackupKind::Incremental),
            _ => None,
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Full => write!(f, "FULL"),
            BackupKind::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

/// One committed backup at the remote store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub volume: String,
    pub snapshot: String,
    pub kind: BackupKind,
}

impl BackupArtifact {
    pub fn new(volume: impl Into<String>, snapshot: impl Into<String>, kind: BackupKind) -> Self {
        Self {
            volume: volume.into(),
            snapshot: snapshot.into(),
            kind,
        }
    }

    pub fn is_full(&self) -> bool {
        self.kind == BackupKind::Full
    }
}

/// Ordered history of committed artifacts for one volume, oldest first.
///
/// An incremental artifact is the delta from the snapshot of the artifact
/// right before it, so the base of element `i` is element `i - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupChain {
    volume: String,
    artifacts: Vec<BackupArtifact>,
}

impl BackupChain {
    pub fn new(volume: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            artifacts: Vec::new(),
        }
    }

    /// Build a chain from artifacts already in chronological order
    pub fn from_artifacts(volume: impl Into<String>, artifacts: Vec<BackupArtifact>) -> Self {
        Self {
            volume: volume.into(),
            artifacts,
        }
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn artifacts(&self) -> &[BackupArtifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn last(&self) -> Option<&BackupArtifact> {
        self.artifacts.last()
    }

    pub fn has_full(&self) -> bool {
        self.artifacts.iter().any(BackupArtifact::is_full)
    }

    /// Index of the most recent full artifact: the retention boundary
    pub fn latest_full_index(&self) -> Option<usize> {
        self.artifacts.iter().rposition(BackupArtifact::is_full)
    }

    /// Indices of all full artifacts, oldest first
    pub fn full_indices(&self) -> Vec<usize> {
        self.artifacts
            .iter()
            .enumerate()
            .filter(|(_, artifact)| artifact.is_full())
            .map(|(index, _)| index)
            .collect()
    }

    /// A chain is usable for restores when it starts with a full artifact
    pub fn is_anchored(&self) -> bool {
        self.artifacts.first().map_or(true, BackupArtifact::is_full)
    }

    /// Append a committed artifact
    pub fn push(&mut self, artifact: BackupArtifact) {
        self.artifacts.push(artifact);
    }

    /// Drop the `count` oldest artifacts after they were deleted remotely
    pub fn remove_oldest(&mut self, count: usize) {
        let count = count.min(self.artifacts.len());
        self.artifacts.drain(..count);
    }
}
