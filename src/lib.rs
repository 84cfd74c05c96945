//! # inc-backup
//!
//! Incremental backups of a directory into timestamped, compressed archives.
//!
//! ## Features
//!
//! - **Incremental**: only files modified after the last successful backup are archived
//! - **Watermark**: the last backup time lives in `last_backup_time.txt` next to the archives
//! - **Compression**: tar archives compressed with XZ (LZMA), optionally multithreaded
//! - **Progress**: percentage of planned bytes archived, reported after each file
//! - **Background runs**: a run can be moved to its own thread and report over a channel
//!
//! ## Quick Start
//!
//! ```no_run
//! use inc_backup::backup::orchestrator::{BackupOrchestrator, BackupOutcome};
//!
//! let mut orchestrator = BackupOrchestrator::builder().build();
//! match orchestrator.run("/home/me/documents", "/mnt/backups", |p| println!("{p}%")) {
//!     BackupOutcome::Completed(archive) => println!("Wrote {archive:?}"),
//!     BackupOutcome::NothingToDo => println!("No new or modified files to backup."),
//!     BackupOutcome::Failed(e) => eprintln!("{e}"),
//! }
//! ```

pub mod backup;
