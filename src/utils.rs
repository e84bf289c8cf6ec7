use crate::error::ZbakError;
use crate::Result;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::path::Path;

/// Validate a volume identifier given on the command line
pub fn validate_volume(volume: &str) -> Result<()> {
    let invalid =
        |reason: &str| ZbakError::validation(format!("Invalid volume '{volume}': {reason}"));

    if volume.is_empty() {
        return Err(invalid("empty name"));
    }
    if volume.starts_with('/') || volume.ends_with('/') {
        return Err(invalid("leading or trailing '/'"));
    }
    if volume.contains("//") {
        return Err(invalid("empty path component"));
    }
    if volume.contains('@') {
        return Err(invalid("snapshot names are chosen automatically"));
    }
    if volume.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("whitespace or control characters"));
    }
    Ok(())
}

/// Whether a process with this pid exists
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // exists, but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Last `max_lines` non-empty lines of a (log) file, empty if unreadable
pub fn tail_lines(path: &Path, max_lines: usize) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
