use clap::Parser;
use inc_backup::backup::backup_config::BackupConfig;
use inc_backup::backup::orchestrator::{BackupEvent, BackupOutcome};
use inc_backup::backup::result_error::error::Error;
use inc_backup::backup::result_error::result::Result;
use inc_backup::backup::result_error::WithMsg;
use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc::channel;
use tracing::{error, info, warn};
use validator::Validate;

/// Back up files changed since the last run into a timestamped archive
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of an optional YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Folder to back up, overrides `src_dir` from the config
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Folder receiving the archives and the watermark, overrides `dst_dir`
    #[arg(short, long)]
    dest: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<BackupConfig> {
    let config = match &args.config {
        Some(path) => BackupConfig::from_yaml_file(path)?,
        None => BackupConfig::default(),
    }
    .with_dirs(args.source.clone(), args.dest.clone());

    config
        .validate()
        .map_err(Error::from)
        .with_msg(format!("Config validation failed: {:?}", &args.config))?;
    Ok(config)
}

fn backup(args: &Args) -> Result<BackupOutcome> {
    let config = load_config(args)?;
    let (src_dir, dst_dir) = config.require_dirs()?;

    let (event_tx, event_rx) = channel();
    let handle = config.orchestrator().spawn(src_dir, dst_dir, event_tx)?;

    let mut last_percent = None;
    for event in event_rx {
        match event {
            BackupEvent::Progress(percent) => {
                if last_percent != Some(percent) {
                    info!("Progress: {percent}%");
                    last_percent = Some(percent);
                }
            }
            BackupEvent::Completed(path) => info!("Your backup was successful: {:?}", path),
            BackupEvent::NothingToDo => warn!("No new or modified files to backup."),
            BackupEvent::Failed(msg) => error!("{msg}"),
        }
    }

    match handle.join() {
        Ok((_, outcome)) => Ok(outcome),
        Err(_) => Err(Error::from(std::io::Error::other("backup thread panicked"))),
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match backup(&args) {
        Ok(outcome) => exit(outcome.exit_code()),
        Err(e) => {
            error!("{e}");
            exit(1)
        }
    }
}
