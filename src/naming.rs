use crate::chain::{BackupArtifact, BackupKind};
use crate::config::Config;
use crate::error::ZbakError;
use crate::Result;
use chrono::{NaiveDate, NaiveDateTime};

/// Marks an artifact that is still being written
pub const TEMP_MARKER: char = '#';

/// Snapshot and artifact naming rules derived from the configuration
#[derive(Debug, Clone)]
pub struct Naming {
    snapshot_prefix: String,
    timestamp_format: String,
    flatten_char: char,
}

impl Naming {
    pub fn new(
        snapshot_prefix: impl Into<String>,
        timestamp_format: impl Into<String>,
        flatten_char: char,
    ) -> Self {
        Self {
            snapshot_prefix: snapshot_prefix.into(),
            timestamp_format: timestamp_format.into(),
            flatten_char,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.snapshot_prefix.clone(),
            config.snapshot_timestamp_format.clone(),
            config.flatten_char,
        )
    }

    pub fn snapshot_prefix(&self) -> &str {
        &self.snapshot_prefix
    }

    /// Generate the snapshot name for the given moment
    pub fn snapshot_name_at(&self, at: NaiveDateTime) -> String {
        format!(
            "{}{}",
            self.snapshot_prefix,
            at.format(&self.timestamp_format)
        )
    }

    /// Whether a snapshot name follows `<prefix><timestamp>`
    pub fn is_snapshot_name(&self, name: &str) -> bool {
        let Some(timestamp) = name.strip_prefix(&self.snapshot_prefix) else {
            return false;
        };
        NaiveDateTime::parse_from_str(timestamp, &self.timestamp_format).is_ok()
            || NaiveDate::parse_from_str(timestamp, &self.timestamp_format).is_ok()
    }

    /// Volume name with hierarchy separators replaced
    pub fn flat_volume_name(&self, volume: &str) -> String {
        volume.replace('/', &self.flatten_char.to_string())
    }

    /// Prefix shared by every remote file of one volume
    pub fn artifact_prefix(&self, volume: &str) -> String {
        format!("{}-", self.flat_volume_name(volume))
    }

    /// `<flatVolumeName>-<snapshot>.<full|incr>`
    pub fn artifact_name(&self, artifact: &BackupArtifact) -> String {
        format!(
            "{}{}.{}",
            self.artifact_prefix(&artifact.volume),
            artifact.snapshot,
            artifact.kind.suffix()
        )
    }

    /// Parse a remote file name back into an artifact of `volume`
    pub fn parse_artifact(&self, volume: &str, name: &str) -> Result<BackupArtifact> {
        let malformed = || ZbakError::MalformedArtifactName {
            name: name.to_string(),
        };

        let rest = name
            .strip_prefix(&self.artifact_prefix(volume))
            .ok_or_else(malformed)?;
        let (snapshot, suffix) = rest.rsplit_once('.').ok_or_else(malformed)?;
        let kind = BackupKind::from_suffix(suffix).ok_or_else(malformed)?;
        if !self.is_snapshot_name(snapshot) {
            return Err(malformed());
        }

        Ok(BackupArtifact::new(volume, snapshot, kind))
    }
}

/// Name under which an artifact is written before the commit rename
pub fn temp_name(artifact_name: &str) -> String {
    format!("{artifact_name}{TEMP_MARKER}")
}

pub fn is_temp_name(name: &str) -> bool {
    name.ends_with(TEMP_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> Naming {
        Naming::new("bak-", "%Y%m%d-%H%M", '_')
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_snapshot_name_at() {
        assert_eq!(
            naming().snapshot_name_at(at(2024, 1, 2, 3, 4)),
            "bak-20240102-0304"
        );
    }

    #[test]
    fn test_generated_names_sort_chronologically() {
        let naming = naming();
        let earlier = naming.snapshot_name_at(at(2023, 12, 31, 23, 59));
        let later = naming.snapshot_name_at(at(2024, 1, 1, 0, 0));
        assert!(earlier < later);
    }

    #[test]
    fn test_is_snapshot_name() {
        let naming = naming();
        assert!(naming.is_snapshot_name("bak-20240101-0000"));
        assert!(!naming.is_snapshot_name("bak-2024"));
        assert!(!naming.is_snapshot_name("manual-20240101-0000"));
        assert!(!naming.is_snapshot_name("bak-20240101-0000-extra"));
        assert!(!naming.is_snapshot_name(""));

        let daily = Naming::new("daily-", "%Y-%m-%d", '_');
        assert!(daily.is_snapshot_name("daily-2024-03-01"));
        assert!(!daily.is_snapshot_name("daily-2024-13-01"));
    }

    #[test]
    fn test_flat_volume_name() {
        let naming = naming();
        assert_eq!(naming.flat_volume_name("tank/home/alice"), "tank_home_alice");
        assert_eq!(naming.flat_volume_name("tank"), "tank");
        assert_eq!(
            Naming::new("bak-", "%Y", '+').flat_volume_name("a/b"),
            "a+b"
        );
    }

    #[test]
    fn test_artifact_name() {
        let artifact =
            BackupArtifact::new("tank/home", "bak-20240102-0000", BackupKind::Incremental);
        assert_eq!(
            naming().artifact_name(&artifact),
            "tank_home-bak-20240102-0000.incr"
        );
        assert_eq!(
            temp_name("tank_home-bak-20240102-0000.incr"),
            "tank_home-bak-20240102-0000.incr#"
        );
    }

    #[test]
    fn test_parse_artifact() {
        let naming = naming();
        let artifact = naming
            .parse_artifact("tank/home", "tank_home-bak-20240101-0000.full")
            .unwrap();
        assert_eq!(artifact.volume, "tank/home");
        assert_eq!(artifact.snapshot, "bak-20240101-0000");
        assert_eq!(artifact.kind, BackupKind::Full);

        let artifact = naming
            .parse_artifact("tank/home", "tank_home-bak-20240102-0000.incr")
            .unwrap();
        assert_eq!(artifact.kind, BackupKind::Incremental);
    }

    #[test]
    fn test_parse_artifact_rejects_malformed() {
        let naming = naming();
        for name in [
            "tank_home-bak-20240101-0000.gz",
            "tank_home-bak-20240101-0000",
            "tank_home-bak-20240101-0000.full#",
            "tank_home-notes.txt",
            "other-bak-20240101-0000.full",
            // belongs to volume tank/home-old, which shares the flat prefix
            "tank_home-old-bak-20240101-0000.full",
        ] {
            match naming.parse_artifact("tank/home", name) {
                Err(ZbakError::MalformedArtifactName { name: rejected }) => {
                    assert_eq!(rejected, name)
                }
                other => panic!("Expected {name} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_is_temp_name() {
        assert!(is_temp_name("tank-bak-20240101-0000.full#"));
        assert!(!is_temp_name("tank-bak-20240101-0000.full"));
    }
}
