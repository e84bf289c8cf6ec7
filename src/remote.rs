use crate::command::CommandLine;
use crate::config::Config;
use crate::error::ZbakError;
use crate::Result;
use log::debug;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

/// The remote artifact store. All operations are single-writer per run.
pub trait RemoteStore: Send + Sync {
    /// Names starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Command that stores everything it reads on stdin under `name`
    fn write_command(&self, name: &str) -> CommandLine;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Delete all `names` in one batch; missing names are not an error
    fn delete(&self, names: &[String]) -> Result<()>;

    /// Human readable location for log messages
    fn describe(&self) -> String;
}

/// Open the store a destination string points at.
///
/// `[user@]host:/dir` is reached over ssh, anything else is a local directory.
pub fn open_destination(destination: &str, config: &Config) -> Result<Arc<dyn RemoteStore>> {
    if destination.trim().is_empty() {
        return Err(ZbakError::validation("Destination must not be empty"));
    }

    match split_remote_destination(destination) {
        Some((host, dir)) => {
            let ssh: CommandLine = config.ssh_command.parse()?;
            Ok(Arc::new(SshRemote::new(ssh, host, dir)))
        }
        None => Ok(Arc::new(LocalRemote::new(destination))),
    }
}

fn split_remote_destination(destination: &str) -> Option<(&str, &str)> {
    let (host, dir) = destination.split_once(':')?;
    if host.is_empty() || host.contains('/') {
        return None;
    }
    let dir = if dir.is_empty() { "." } else { dir };
    Some((host, dir))
}

/// Remote directory reached through `ssh host <shell command>`
#[derive(Debug, Clone)]
pub struct SshRemote {
    ssh: CommandLine,
    host: String,
    dir: String,
}

impl SshRemote {
    pub fn new(ssh: CommandLine, host: impl Into<String>, dir: impl Into<String>) -> Self {
        Self {
            ssh,
            host: host.into(),
            dir: dir.into().trim_end_matches('/').to_string(),
        }
    }

    fn remote_path(&self, name: &str) -> String {
        if self.dir.is_empty() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.dir)
        }
    }

    fn quoted_path(&self, name: &str) -> String {
        shell_words::quote(&self.remote_path(name)).into_owned()
    }

    /// ssh invocation running `script` through the remote shell
    fn remote_command(&self, script: String) -> CommandLine {
        self.ssh.clone().arg(&self.host).arg(script)
    }

    fn exec(&self, script: String) -> Result<String> {
        self.remote_command(script)
            .run()
            .map_err(|e| ZbakError::transport(format!("{}: {e}", self.host)))
    }
}

impl RemoteStore for SshRemote {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if self.dir.is_empty() { "/" } else { &self.dir };
        let output = self.exec(format!("ls -1A -- {}", shell_words::quote(dir)))?;
        let mut names: Vec<String> = output
            .lines()
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn write_command(&self, name: &str) -> CommandLine {
        self.remote_command(format!("cat > {}", self.quoted_path(name)))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.exec(format!(
            "mv -- {} {}",
            self.quoted_path(from),
            self.quoted_path(to)
        ))?;
        Ok(())
    }

    fn delete(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let paths: Vec<String> = names.iter().map(|name| self.quoted_path(name)).collect();
        self.exec(format!("rm -f -- {}", paths.join(" ")))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.dir)
    }
}

/// Artifacts kept in a directory of the local file system (e.g. a mounted disk)
#[derive(Debug, Clone)]
pub struct LocalRemote {
    dir: PathBuf,
}

impl LocalRemote {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl RemoteStore for LocalRemote {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ZbakError::transport(format!("{}: {e}", self.dir.display())))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| ZbakError::transport(format!("{}: {e}", self.dir.display())))?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn write_command(&self, name: &str) -> CommandLine {
        CommandLine::new("sh").args([
            "-c".to_string(),
            "cat > \"$1\"".to_string(),
            "zbak-write".to_string(),
            self.dir.join(name).to_string_lossy().into_owned(),
        ])
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.dir.join(from), self.dir.join(to))
            .map_err(|e| ZbakError::transport(format!("rename {from} -> {to}: {e}")))
    }

    fn delete(&self, names: &[String]) -> Result<()> {
        let mut failures = Vec::new();
        for name in names {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => debug!("deleted {name}"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("{name}: {e}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ZbakError::transport(format!(
                "failed to delete {} of {} file(s): {}",
                failures.len(),
                names.len(),
                failures.join("; ")
            )))
        }
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}
