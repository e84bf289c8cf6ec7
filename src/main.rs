use chrono::Local;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use zbak::{
    backup_volume, dump_config, install_signal_handler, load_config, open_destination,
    plan_volume, validate_volume, BackupSettings, CommandLine, RunContext, RunSession,
    SnapshotStore, ZbakError, ZfsSnapshots,
};

fn main() {
    let result = run();
    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(error) => {
            eprintln!("Error: {error}");

            let suggestions = error.suggestions();
            if !suggestions.is_empty() {
                eprintln!("\nSuggestions:");
                for suggestion in suggestions {
                    eprintln!("  - {suggestion}");
                }
            }

            process::exit(error.exit_code());
        }
    }
}

fn build_cli() -> Command {
    Command::new("zbak")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Andreas Glaser <andreas.glaser@pm.me>")
        .about("Full and incremental ZFS snapshot backups to a remote store")
        .long_about(
            "zbak streams ZFS snapshots through compression and encryption to a\n\
             remote directory, alternating full and incremental backups and\n\
             pruning chains older than the latest full backup.\n\
             Example: zbak -d backup@nas:/srv/zbak -p ~/.zbak-key tank/home",
        )
        .arg(
            Arg::new("volumes")
                .help("Volumes (ZFS datasets) to back up, processed in order")
                .required(false)
                .num_args(1..)
                .value_name("VOLUME"),
        )
        .arg(
            Arg::new("destination")
                .short('d')
                .long("destination")
                .help("Remote store: [user@]host:/dir over ssh, or a local directory")
                .value_name("DEST"),
        )
        .arg(
            Arg::new("passphrase-file")
                .short('p')
                .long("passphrase-file")
                .help("File holding the encryption passphrase")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("self-managed")
                .short('s')
                .long("self-managed")
                .help("Create and destroy snapshots instead of using existing ones")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .short('n')
                .long("dry-run")
                .help("Show what would be backed up without doing it")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Show detailed progress information")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress all output except errors")
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose"),
        )
        .arg(
            Arg::new("dump-config")
                .long("dump-config")
                .help("Display current configuration settings and exit")
                .action(ArgAction::SetTrue),
        )
}

fn log_level(verbose: bool, quiet: bool) -> LevelFilter {
    if quiet {
        LevelFilter::Error
    } else if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

fn init_logging(level: LevelFilter) {
    let _ = TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
}

fn run() -> Result<i32, ZbakError> {
    let matches = build_cli().get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    init_logging(log_level(verbose, quiet));

    let mut config = load_config()?;
    if matches.get_flag("self-managed") {
        config.self_managed_snapshots = true;
    }

    if matches.get_flag("dump-config") {
        dump_config(&config)?;
        return Ok(0);
    }

    let (destination, volumes) = required_targets(&matches)?;
    for volume in &volumes {
        validate_volume(volume)?;
    }
    let passphrase_file = matches.get_one::<PathBuf>("passphrase-file");
    let settings = BackupSettings::from_config(&config, passphrase_file.map(PathBuf::as_path))?;

    let remote = open_destination(destination, &config)?;
    let zfs: CommandLine = config.zfs_command.parse()?;
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(ZfsSnapshots::new(zfs));

    if matches.get_flag("dry-run") {
        let work_dir = tempfile::tempdir()?;
        let context = RunContext::new(remote, snapshots, work_dir.path());
        return Ok(process_volumes(&context, &settings, &volumes, true));
    }

    let session = RunSession::start(&config, remote, snapshots)?;
    install_signal_handler(session.context().clone())?;

    Ok(process_volumes(session.context(), &settings, &volumes, false))
}

fn required_targets(matches: &ArgMatches) -> Result<(&str, Vec<&str>), ZbakError> {
    let Some(destination) = matches.get_one::<String>("destination") else {
        return Err(ZbakError::validation(
            "No destination specified. Use --help for usage information.",
        ));
    };
    let volumes: Vec<&str> = match matches.get_many::<String>("volumes") {
        Some(values) => values.map(String::as_str).collect(),
        None => {
            return Err(ZbakError::validation(
                "No volumes specified. Use --help for usage information.",
            ))
        }
    };
    Ok((destination.as_str(), volumes))
}

/// Process every volume in order and return the exit code of the run
fn process_volumes(
    context: &RunContext,
    settings: &BackupSettings,
    volumes: &[&str],
    dry_run: bool,
) -> i32 {
    let mut success_count = 0;
    let mut skipped_count = 0;
    let mut error_count = 0;

    for volume in volumes {
        let now = Local::now().naive_local();
        let outcome = if dry_run {
            plan_volume(context, settings, volume, now).map(|_| None)
        } else {
            backup_volume(context, settings, volume, now).map(Some)
        };

        match outcome {
            Ok(Some(result)) => {
                info!("{}", result.summary());
                success_count += 1;
            }
            Ok(None) => success_count += 1,
            Err(e) if e.is_skip() => {
                warn!("{volume}: skipped: {e}");
                skipped_count += 1;
            }
            Err(e) => {
                error!("{volume}: {e}");
                for suggestion in e.suggestions() {
                    info!("  - {suggestion}");
                }
                error_count += 1;

                if !e.is_recoverable() {
                    return e.exit_code();
                }
            }
        }
    }

    if volumes.len() > 1 || error_count > 0 {
        info!(
            "Backup summary: {success_count} succeeded, {skipped_count} skipped, \
             {error_count} failed"
        );
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_cli_parses_backup_invocation() {
        let matches = build_cli()
            .try_get_matches_from([
                "zbak",
                "-d",
                "backup@nas:/srv/zbak",
                "-p",
                "/root/.zbak-key",
                "-s",
                "tank/home",
                "tank/vm",
            ])
            .unwrap();

        let (destination, volumes) = required_targets(&matches).unwrap();
        assert_eq!(destination, "backup@nas:/srv/zbak");
        assert_eq!(volumes, vec!["tank/home", "tank/vm"]);
        assert!(matches.get_flag("self-managed"));
        assert_eq!(
            matches.get_one::<PathBuf>("passphrase-file"),
            Some(&PathBuf::from("/root/.zbak-key"))
        );
    }

    #[test]
    fn test_missing_targets_are_usage_errors() {
        let matches = build_cli()
            .try_get_matches_from(["zbak", "tank/home"])
            .unwrap();
        let err = required_targets(&matches).unwrap_err();
        assert!(matches!(err, ZbakError::Validation { .. }));
        assert_eq!(err.exit_code(), 1);

        let matches = build_cli()
            .try_get_matches_from(["zbak", "-d", "/mnt/backup"])
            .unwrap();
        assert!(required_targets(&matches).is_err());
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(build_cli()
            .try_get_matches_from(["zbak", "-q", "-v", "tank"])
            .is_err());
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(false, false), LevelFilter::Info);
        assert_eq!(log_level(true, false), LevelFilter::Debug);
        assert_eq!(log_level(false, true), LevelFilter::Error);
    }

    #[cfg(unix)]
    #[test]
    fn test_dry_run_over_local_destination() {
        let remote_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let config = zbak::Config {
            compress_command: String::new(),
            encrypt_command: String::new(),
            ..zbak::default_config()
        };
        let settings = BackupSettings::from_config(&config, None).unwrap();

        let remote = open_destination(&remote_dir.path().to_string_lossy(), &config).unwrap();
        // `zfs list` stand-in printing a single snapshot
        let fake_zfs = CommandLine::new("sh").args([
            "-c",
            "printf 'tank@bak-20240101-0000\\n'",
            "zfs",
        ]);
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(ZfsSnapshots::new(fake_zfs));
        let context = RunContext::new(remote, snapshots, work_dir.path());

        assert_eq!(process_volumes(&context, &settings, &["tank"], true), 0);
        assert!(std::fs::read_dir(remote_dir.path()).unwrap().next().is_none());
    }
}
