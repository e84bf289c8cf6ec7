use crate::chain::BackupChain;
use crate::naming::{is_temp_name, Naming};
use crate::remote::RemoteStore;
use crate::Result;
use log::{debug, warn};

/// What the remote store holds for one volume
#[derive(Debug, Clone)]
pub struct RemoteListing {
    pub chain: BackupChain,
    /// Uncommitted `...#` objects left behind by an interrupted run
    pub stale_temporaries: Vec<String>,
    /// Names sharing the volume prefix that are not artifacts
    pub malformed: Vec<String>,
}

/// Read the remote state of one volume.
///
/// Names come back sorted, which is chronological order by construction of
/// the snapshot names, so the artifacts form the chain in commit order.
pub fn list_remote_state(
    remote: &dyn RemoteStore,
    naming: &Naming,
    volume: &str,
) -> Result<RemoteListing> {
    let names = remote.list(&naming.artifact_prefix(volume))?;

    let mut artifacts = Vec::new();
    let mut stale_temporaries = Vec::new();
    let mut malformed = Vec::new();

    for name in names {
        if is_temp_name(&name) {
            stale_temporaries.push(name);
            continue;
        }
        match naming.parse_artifact(volume, &name) {
            Ok(artifact) => artifacts.push(artifact),
            Err(e) => {
                warn!("{volume}: ignoring remote file: {e}");
                malformed.push(name);
            }
        }
    }

    debug!(
        "{volume}: {} artifact(s), {} stale temporary, {} ignored on {}",
        artifacts.len(),
        stale_temporaries.len(),
        malformed.len(),
        remote.describe()
    );

    let chain = BackupChain::from_artifacts(volume, artifacts);
    if !chain.is_anchored() {
        warn!("{volume}: oldest remote backup is incremental and cannot be restored");
    }

    Ok(RemoteListing {
        chain,
        stale_temporaries,
        malformed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BackupKind;
    use crate::error::ZbakError;
    use crate::remote::LocalRemote;
    use std::fs;
    use tempfile::tempdir;

    fn naming() -> Naming {
        Naming::new("bak-", "%Y%m%d-%H%M", '_')
    }

    #[test]
    fn test_classifies_remote_names() {
        let dir = tempdir().unwrap();
        for name in [
            "tank_home-bak-20240102-0000.incr",
            "tank_home-bak-20240101-0000.full",
            "tank_home-bak-20240103-0000.incr#",
            "tank_home-README",
            "tank_other-bak-20240101-0000.full",
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        let remote = LocalRemote::new(dir.path());
        let listing = list_remote_state(&remote, &naming(), "tank/home").unwrap();

        let artifacts = listing.chain.artifacts();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].snapshot, "bak-20240101-0000");
        assert_eq!(artifacts[0].kind, BackupKind::Full);
        assert_eq!(artifacts[1].snapshot, "bak-20240102-0000");
        assert_eq!(artifacts[1].kind, BackupKind::Incremental);
        assert_eq!(listing.chain.volume(), "tank/home");

        assert_eq!(
            listing.stale_temporaries,
            vec!["tank_home-bak-20240103-0000.incr#"]
        );
        assert_eq!(listing.malformed, vec!["tank_home-README"]);
    }

    #[test]
    fn test_chain_without_leading_full_is_kept() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tank-bak-20240102-0000.incr"), "x").unwrap();
        fs::write(dir.path().join("tank-bak-20240103-0000.full"), "x").unwrap();

        let remote = LocalRemote::new(dir.path());
        let listing = list_remote_state(&remote, &naming(), "tank").unwrap();

        assert_eq!(listing.chain.len(), 2);
        assert!(!listing.chain.is_anchored());
        assert!(listing.chain.has_full());
    }

    #[test]
    fn test_empty_remote() {
        let dir = tempdir().unwrap();
        let remote = LocalRemote::new(dir.path());
        let listing = list_remote_state(&remote, &naming(), "tank").unwrap();
        assert!(listing.chain.is_empty());
        assert!(listing.stale_temporaries.is_empty());
    }

    #[test]
    fn test_unreachable_remote() {
        let dir = tempdir().unwrap();
        let remote = LocalRemote::new(dir.path().join("gone"));
        match list_remote_state(&remote, &naming(), "tank") {
            Err(ZbakError::Transport { .. }) => (),
            other => panic!("Expected Transport error, got {other:?}"),
        }
    }
}
