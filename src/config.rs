use crate::error::ZbakError;
use crate::Result;
use chrono::format::{Item, StrftimeItems};
use configparser::ini::Ini;
use std::path::{Path, PathBuf};

const SECTION: &str = "zbak";

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of artifacts in a chain before the next full backup
    pub full_backup_interval: usize,
    pub snapshot_prefix: String,
    /// chrono strftime format; must sort lexicographically in chronological order
    pub snapshot_timestamp_format: String,
    /// Create and destroy snapshots ourselves instead of consuming existing ones
    pub self_managed_snapshots: bool,
    /// Replaces `/` in volume names to build flat remote file names
    pub flatten_char: char,
    /// Empty disables the stage
    pub compress_command: String,
    /// Empty disables the stage. `{passphrase_file}` is substituted at startup.
    pub encrypt_command: String,
    pub ssh_command: String,
    pub zfs_command: String,
    pub lock_file: PathBuf,
    /// Number of full backup chains kept by the pruner
    pub retention_full_chains: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            full_backup_interval: 14,
            snapshot_prefix: "bak-".to_string(),
            snapshot_timestamp_format: "%Y%m%d-%H%M".to_string(),
            self_managed_snapshots: false,
            flatten_char: '_',
            compress_command: "gzip -c".to_string(),
            encrypt_command:
                "gpg --batch --yes --symmetric --passphrase-file {passphrase_file} -o -"
                    .to_string(),
            ssh_command: "ssh -o BatchMode=yes".to_string(),
            zfs_command: "zfs".to_string(),
            lock_file: PathBuf::from("/tmp/zbak.lock"),
            retention_full_chains: 1,
        }
    }
}

impl Config {
    /// Check the settings the decision engine and naming rely on
    pub fn validate(&self) -> Result<()> {
        if self.full_backup_interval == 0 {
            return Err(ZbakError::config("full_backup_interval must be at least 1"));
        }
        if self.retention_full_chains == 0 {
            return Err(ZbakError::config("retention_full_chains must be at least 1"));
        }
        if self.snapshot_prefix.is_empty() || self.snapshot_prefix.contains(['@', '/']) {
            return Err(ZbakError::config(format!(
                "Invalid snapshot_prefix: '{}'",
                self.snapshot_prefix
            )));
        }
        if self.snapshot_timestamp_format.is_empty()
            || StrftimeItems::new(&self.snapshot_timestamp_format)
                .any(|item| matches!(item, Item::Error))
        {
            return Err(ZbakError::config(format!(
                "Invalid snapshot_timestamp_format: '{}'",
                self.snapshot_timestamp_format
            )));
        }
        if self.flatten_char == '/' || self.flatten_char.is_whitespace() {
            return Err(ZbakError::config(format!(
                "Invalid flatten_char: '{}'",
                self.flatten_char
            )));
        }
        if self.zfs_command.trim().is_empty() || self.ssh_command.trim().is_empty() {
            return Err(ZbakError::config("zfs_command and ssh_command must not be empty"));
        }
        Ok(())
    }
}

/// Get default configuration
pub fn default_config() -> Config {
    Config::default()
}

/// Load configuration from the per-user config file, falling back to defaults
pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;
    load_config_from(&config_path)
}

/// Load configuration from a specific file; a missing file yields defaults
pub fn load_config_from(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        return Ok(default_config());
    }

    let mut conf = Ini::new();
    conf.load(config_path)
        .map_err(|e| ZbakError::config(format!("Failed to parse config file: {e}")))?;

    let mut config = default_config();

    // Load string values
    if let Some(value) = conf.get(SECTION, "snapshot_prefix") {
        config.snapshot_prefix = value;
    }
    if let Some(value) = conf.get(SECTION, "snapshot_timestamp_format") {
        config.snapshot_timestamp_format = value;
    }
    if let Some(value) = conf.get(SECTION, "compress_command") {
        config.compress_command = value;
    }
    if let Some(value) = conf.get(SECTION, "encrypt_command") {
        config.encrypt_command = value;
    }
    if let Some(value) = conf.get(SECTION, "ssh_command") {
        config.ssh_command = value;
    }
    if let Some(value) = conf.get(SECTION, "zfs_command") {
        config.zfs_command = value;
    }
    if let Some(value) = conf.get(SECTION, "lock_file") {
        config.lock_file = PathBuf::from(value);
    }
    if let Some(value) = conf.get(SECTION, "flatten_char") {
        let mut chars = value.chars();
        config.flatten_char = match (chars.next(), chars.next()) {
            (Some(c), None) => c,
            _ => {
                return Err(ZbakError::config(format!(
                    "flatten_char must be a single character: {value}"
                )))
            }
        };
    }

    // Load boolean values
    if let Some(value) = conf.get(SECTION, "self_managed_snapshots") {
        config.self_managed_snapshots =
            parse_bool(&value).unwrap_or(config.self_managed_snapshots);
    }

    // Load numeric values
    if let Some(value) = conf.get(SECTION, "full_backup_interval") {
        config.full_backup_interval = value
            .parse()
            .map_err(|_| ZbakError::config(format!("Invalid full_backup_interval: {value}")))?;
    }
    if let Some(value) = conf.get(SECTION, "retention_full_chains") {
        config.retention_full_chains = value
            .parse()
            .map_err(|_| ZbakError::config(format!("Invalid retention_full_chains: {value}")))?;
    }

    config.validate()?;
    Ok(config)
}

/// Get the configuration file path
pub fn get_config_path() -> Result<PathBuf> {
    if let Some(config_dir) = std::env::var_os("XDG_CONFIG_HOME") {
        Ok(PathBuf::from(config_dir).join("zbak").join("config.ini"))
    } else if let Some(home) = std::env::var_os("HOME") {
        Ok(PathBuf::from(home)
            .join(".config")
            .join("zbak")
            .join("config.ini"))
    } else {
        Err(ZbakError::config("Could not determine config directory"))
    }
}

/// Parse a boolean value from INI string
fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Create a sample configuration file
pub fn create_sample_config() -> String {
    r#"[zbak]
# Artifacts per chain before the next full backup
full_backup_interval = 14

# Snapshot names are <prefix><timestamp>; the timestamp must sort chronologically
snapshot_prefix = bak-
snapshot_timestamp_format = %Y%m%d-%H%M

# Create/destroy snapshots ourselves (true) or only use existing ones (false)
self_managed_snapshots = false

# Replaces '/' in volume names for remote file names
flatten_char = _

# Transform stages; leave empty to disable
compress_command = gzip -c
encrypt_command = gpg --batch --yes --symmetric --passphrase-file {passphrase_file} -o -

ssh_command = ssh -o BatchMode=yes
zfs_command = zfs
lock_file = /tmp/zbak.lock

# Full backup chains kept on the remote
retention_full_chains = 1
"#
    .to_string()
}

/// Display the current configuration in a user-friendly format
pub fn dump_config(config: &Config) -> Result<()> {
    let config_path = get_config_path()?;

    println!("zbak Configuration");
    println!("==================");
    println!();

    if config_path.exists() {
        println!("Config file: {} (found)", config_path.display());
    } else {
        println!(
            "Config file: {} (not found, using defaults)",
            config_path.display()
        );
    }
    println!();

    println!("Current Settings:");
    println!("----------------");
    println!("full_backup_interval      = {}", config.full_backup_interval);
    println!("snapshot_prefix           = {}", config.snapshot_prefix);
    println!("snapshot_timestamp_format = {}", config.snapshot_timestamp_format);
    println!("self_managed_snapshots    = {}", config.self_managed_snapshots);
    println!("flatten_char              = {}", config.flatten_char);
    println!("compress_command          = {}", config.compress_command);
    println!("encrypt_command           = {}", config.encrypt_command);
    println!("ssh_command               = {}", config.ssh_command);
    println!("zfs_command               = {}", config.zfs_command);
    println!("lock_file                 = {}", config.lock_file.display());
    println!("retention_full_chains     = {}", config.retention_full_chains);
    println!();

    let example = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
        .and_then(|d| d.and_hms_opt(3, 4, 5))
        .map(|at| at.format(&config.snapshot_timestamp_format).to_string())
        .unwrap_or_default();
    println!("Example names with current settings:");
    println!("------------------------------------");
    println!(
        "snapshot: pool/data@{}{example}",
        config.snapshot_prefix
    );
    println!(
        "artifact: pool{}data-{}{example}.full",
        config.flatten_char, config.snapshot_prefix
    );

    if !config_path.exists() {
        println!();
        println!("To create a configuration file, save this as {}:", config_path.display());
        println!();
        print!("{}", create_sample_config());
    }

    Ok(())
}
