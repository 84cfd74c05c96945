//! Runs one incremental backup: load watermark, scan, archive, advance
//! watermark.
//!
//! The watermark only moves after the archive was completely written, so an
//! interrupted or failed run makes the next one pick up at least the same
//! files again.

use crate::backup::archive::ArchiveBuilder;
use crate::backup::compress::CompressorConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::scan::{default_include, ChangeScanner, CustomDeserializedGlob};
use crate::backup::watermark::{self, Watermark};
use bon::Builder;
use derive_more::Display;
use getset::{CopyGetters, Getters};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    LoadingWatermark,
    Scanning,
    NothingToBackup,
    Building,
    Finalizing,
    Complete,
    Error,
}

/// How a run ended.
#[derive(Debug)]
pub enum BackupOutcome {
    /// Archive written and watermark advanced.
    Completed(PathBuf),
    /// No file changed since the last backup; nothing was written.
    NothingToDo,
    Failed(Error),
}

impl BackupOutcome {
    /// True unless the run failed. `NothingToDo` counts as success here since
    /// nothing went wrong; [`BackupOutcome::exit_code`] still tells it apart.
    pub fn is_success(&self) -> bool {
        !matches!(self, BackupOutcome::Failed(_))
    }

    /// Process exit status: 0 for a written archive, 1 for a failure and 2
    /// when there was nothing to back up.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupOutcome::Completed(_) => 0,
            BackupOutcome::Failed(_) => 1,
            BackupOutcome::NothingToDo => 2,
        }
    }
}

/// Notification sent to whoever started a run in the background.
///
/// A run emits any number of `Progress` events followed by exactly one of
/// the other variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEvent {
    Progress(u8),
    Completed(PathBuf),
    NothingToDo,
    Failed(String),
}

impl From<&BackupOutcome> for BackupEvent {
    fn from(value: &BackupOutcome) -> Self {
        match value {
            BackupOutcome::Completed(p) => BackupEvent::Completed(p.clone()),
            BackupOutcome::NothingToDo => BackupEvent::NothingToDo,
            BackupOutcome::Failed(e) => BackupEvent::Failed(e.to_string()),
        }
    }
}

/// The directories and cutoff of a single run.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct BackupJob {
    #[getset(get = "pub")]
    source_root: PathBuf,
    #[getset(get = "pub")]
    dest_root: PathBuf,
    #[getset(get_copy = "pub")]
    watermark: Watermark,
    /// Destination subtree to leave out when it lives inside the source.
    #[getset(get = "pub")]
    nested_dest: Option<PathBuf>,
}

fn require_dir(path: &Path, role: &str) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::configuration(
            "Please select both source and backup folders.",
        ));
    }
    let canonical = path
        .canonicalize()
        .map_err(Error::from)
        .with_msg(format!("{role} folder {:?} is not accessible", path))?;
    if !canonical.is_dir() {
        return Err(Error::from(std::io::Error::other(format!(
            "{role} folder {:?} is not a directory",
            path
        ))));
    }
    Ok(canonical)
}

impl BackupJob {
    /// Checks both directories and loads the destination's watermark.
    pub fn prepare<P1: AsRef<Path>, P2: AsRef<Path>>(source_root: P1, dest_root: P2) -> Result<Self> {
        let source_root = source_root.as_ref();
        let dest_root = dest_root.as_ref();
        let source_canonical = require_dir(source_root, "Source")?;
        let dest_canonical = require_dir(dest_root, "Backup")?;

        if source_canonical == dest_canonical {
            return Err(Error::configuration(format!(
                "Source and backup folder must differ, both are {:?}",
                source_canonical
            )));
        }
        let nested_dest = dest_canonical
            .strip_prefix(&source_canonical)
            .ok()
            .map(|rel| source_root.join(rel));
        if let Some(nested) = &nested_dest {
            tracing::info!("Backup folder {:?} is inside the source, skipping it", nested);
        }

        Ok(Self {
            source_root: source_root.to_path_buf(),
            dest_root: dest_root.to_path_buf(),
            watermark: watermark::load(dest_root),
            nested_dest,
        })
    }
}

/// Sequences the backup stages and tracks where the current run is.
///
/// Taking `&mut self` in [`BackupOrchestrator::run`] keeps one instance from
/// running two jobs at once.
#[derive(Debug, Clone, Builder, Getters, CopyGetters)]
pub struct BackupOrchestrator {
    #[builder(default)]
    #[getset(get = "pub")]
    compressor: CompressorConfig,
    #[builder(default = default_include(), into)]
    #[getset(get = "pub")]
    include: Vec<CustomDeserializedGlob>,
    #[builder(default, into)]
    #[getset(get = "pub")]
    exclude: Vec<CustomDeserializedGlob>,
    #[builder(skip = BackupState::Idle)]
    #[getset(get_copy = "pub")]
    state: BackupState,
}

impl BackupOrchestrator {
    fn transition(&mut self, next: BackupState) {
        tracing::debug!("Backup state {} -> {}", self.state, next);
        self.state = next;
    }

    /// Backs up every file under `source_root` modified since the last
    /// successful run into a new archive in `dest_root`.
    ///
    /// `on_progress` receives the archived percentage after each file.
    pub fn run<P1: AsRef<Path>, P2: AsRef<Path>, F: FnMut(u8)>(
        &mut self,
        source_root: P1,
        dest_root: P2,
        on_progress: F,
    ) -> BackupOutcome {
        self.state = BackupState::Idle;
        match self.try_run(source_root.as_ref(), dest_root.as_ref(), on_progress) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.transition(BackupState::Error);
                tracing::error!("Backup failed: {e}");
                BackupOutcome::Failed(e)
            }
        }
    }

    fn try_run<F: FnMut(u8)>(
        &mut self,
        source_root: &Path,
        dest_root: &Path,
        on_progress: F,
    ) -> Result<BackupOutcome> {
        self.transition(BackupState::LoadingWatermark);
        let job = BackupJob::prepare(source_root, dest_root)?;
        tracing::info!(
            "Backing up {:?} into {:?}, last backup {}",
            job.source_root,
            job.dest_root,
            job.watermark
        );

        self.transition(BackupState::Scanning);
        let selection = ChangeScanner::builder()
            .src_dir(job.source_root.clone())
            .include(self.include.clone())
            .exclude(self.exclude.clone())
            .maybe_prune_dir(job.nested_dest.clone())
            .build()
            .scan(job.watermark)?;

        if selection.is_empty() {
            self.transition(BackupState::NothingToBackup);
            tracing::info!("No new or modified files to backup.");
            return Ok(BackupOutcome::NothingToDo);
        }

        self.transition(BackupState::Building);
        let archive = ArchiveBuilder::builder()
            .dst_dir(job.dest_root.clone())
            .compressor(self.compressor.clone())
            .build()
            .build(&selection, on_progress)?;

        self.transition(BackupState::Finalizing);
        watermark::save(&job.dest_root, Watermark::now())?;

        self.transition(BackupState::Complete);
        Ok(BackupOutcome::Completed(archive))
    }

    /// Runs the backup on its own thread and reports through `events`.
    ///
    /// The handle gives the orchestrator back once the run reached a terminal
    /// state. A dropped receiver does not stop the run.
    pub fn spawn(
        mut self,
        source_root: PathBuf,
        dest_root: PathBuf,
        events: Sender<BackupEvent>,
    ) -> Result<JoinHandle<(Self, BackupOutcome)>> {
        let handle = std::thread::Builder::new()
            .name("backup".into())
            .spawn(move || {
                let progress_tx = events.clone();
                let outcome = self.run(&source_root, &dest_root, |percent| {
                    if let Err(e) = progress_tx.send(BackupEvent::Progress(percent)) {
                        tracing::trace!("{}", Error::from(e));
                    }
                });
                if let Err(e) = events.send(BackupEvent::from(&outcome)) {
                    tracing::debug!("Nobody listening for the result: {}", Error::from(e));
                }
                (self, outcome)
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::ErrorKind;
    use crate::backup::watermark::watermark_path;
    use chrono::{Local, SubsecRound};
    use std::fs::File;
    use std::io::Read;
    use std::sync::mpsc;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write_with_mtime(path: &Path, content: &str, mtime: SystemTime) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    fn hour_ago() -> SystemTime {
        SystemTime::now() - Duration::from_secs(3600)
    }

    fn orchestrator() -> BackupOrchestrator {
        BackupOrchestrator::builder()
            .compressor(CompressorConfig::None)
            .build()
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_only_files_newer_than_watermark_are_archived() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let watermark = Watermark::from(Local::now() - chrono::Duration::hours(1));
        let at: SystemTime = watermark.date_time().into();
        watermark::save(dst.path(), watermark).unwrap();
        write_with_mtime(&src.path().join("A.txt"), "a", at - Duration::from_secs(5));
        write_with_mtime(&src.path().join("dir/B.txt"), "b", at + Duration::from_secs(5));

        let before = Watermark::now();
        let mut orchestrator = orchestrator();
        let outcome = orchestrator.run(src.path(), dst.path(), |_| ());
        let after = Watermark::now();

        let BackupOutcome::Completed(archive) = outcome else {
            panic!("Expected completed backup, got {outcome:?}");
        };
        assert_eq!(archive_entries(&archive), vec!["dir/B.txt"]);
        assert_eq!(orchestrator.state(), BackupState::Complete);

        let saved = watermark::load(dst.path());
        assert!(saved >= before);
        assert!(saved <= after);
    }

    #[test]
    fn test_first_run_selects_everything() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_with_mtime(&src.path().join("one.txt"), "1", hour_ago());
        write_with_mtime(&src.path().join("sub/two.txt"), "2", hour_ago());

        let outcome = orchestrator().run(src.path(), dst.path(), |_| ());
        let BackupOutcome::Completed(archive) = outcome else {
            panic!("Expected completed backup, got {outcome:?}");
        };
        assert_eq!(archive_entries(&archive), vec!["one.txt", "sub/two.txt"]);
        assert!(watermark_path(dst.path()).exists());
    }

    #[test]
    fn test_second_run_without_changes_is_nothing_to_do() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_with_mtime(&src.path().join("one.txt"), "1", hour_ago());

        let mut orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.run(src.path(), dst.path(), |_| ()),
            BackupOutcome::Completed(_)
        ));
        let marker_before = std::fs::read(watermark_path(dst.path())).unwrap();
        let files_before = std::fs::read_dir(dst.path()).unwrap().count();

        let mut progress = Vec::new();
        let outcome = orchestrator.run(src.path(), dst.path(), |p| progress.push(p));

        assert!(matches!(outcome, BackupOutcome::NothingToDo));
        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code(), 2);
        assert!(progress.is_empty());
        assert_eq!(orchestrator.state(), BackupState::NothingToBackup);
        assert_eq!(std::fs::read(watermark_path(dst.path())).unwrap(), marker_before);
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), files_before);
    }

    #[test]
    fn test_empty_source_is_nothing_to_do_and_keeps_no_marker() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        let outcome = orchestrator().run(src.path(), dst.path(), |_| ());
        assert!(matches!(outcome, BackupOutcome::NothingToDo));
        assert!(!watermark_path(dst.path()).exists());
    }

    #[test]
    fn test_missing_source_fails_without_touching_watermark() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        let mut orchestrator = orchestrator();
        let outcome = orchestrator.run(src.path().join("missing"), dst.path(), |_| ());
        let BackupOutcome::Failed(e) = outcome else {
            panic!("Expected failure, got {outcome:?}");
        };
        assert_eq!(e.kind(), ErrorKind::Io);
        assert_eq!(orchestrator.state(), BackupState::Error);
        assert!(!watermark_path(dst.path()).exists());
    }

    #[test]
    fn test_missing_destination_fails() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), "a").unwrap();
        let missing = dst.path().join("missing");

        let outcome = orchestrator().run(src.path(), &missing, |_| ());
        let BackupOutcome::Failed(e) = outcome else {
            panic!("Expected failure, got {outcome:?}");
        };
        assert_eq!(e.kind(), ErrorKind::Io);
        assert!(!missing.exists());
    }

    #[test]
    fn test_empty_path_is_configuration_error() {
        let dst = TempDir::new().unwrap();
        let outcome = orchestrator().run("", dst.path(), |_| ());
        let BackupOutcome::Failed(e) = outcome else {
            panic!("Expected failure, got {outcome:?}");
        };
        assert_eq!(e.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_same_source_and_destination_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let outcome = orchestrator().run(dir.path(), dir.path().join("."), |_| ());
        let BackupOutcome::Failed(e) = outcome else {
            panic!("Expected failure, got {outcome:?}");
        };
        assert_eq!(e.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_destination_inside_source_is_not_archived() {
        let src = TempDir::new().unwrap();
        let dst = src.path().join("backups");
        std::fs::create_dir_all(&dst).unwrap();
        write_with_mtime(&src.path().join("data.txt"), "d", hour_ago());

        let mut orchestrator = orchestrator();
        let BackupOutcome::Completed(archive) = orchestrator.run(src.path(), &dst, |_| ()) else {
            panic!("Expected completed backup");
        };
        assert_eq!(archive_entries(&archive), vec!["data.txt"]);

        let outcome = orchestrator.run(src.path(), &dst, |_| ());
        assert!(matches!(outcome, BackupOutcome::NothingToDo));
    }

    #[test]
    fn test_failed_build_keeps_files_selectable() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_with_mtime(&src.path().join("a.txt"), "a", hour_ago());
        write_with_mtime(&src.path().join("b.txt"), "b", hour_ago());

        // b.txt vanishes once a.txt is in the archive.
        let vanishing = src.path().join("b.txt");
        let mut orchestrator = orchestrator();
        let outcome = orchestrator.run(src.path(), dst.path(), |_| {
            let _ = std::fs::remove_file(&vanishing);
        });

        let BackupOutcome::Failed(e) = outcome else {
            panic!("Expected failure, got {outcome:?}");
        };
        assert_eq!(e.kind(), ErrorKind::Archive);
        assert_eq!(BackupOutcome::Failed(e).exit_code(), 1);
        assert_eq!(orchestrator.state(), BackupState::Error);
        assert!(!watermark_path(dst.path()).exists());
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);

        write_with_mtime(&src.path().join("b.txt"), "b", hour_ago());
        let outcome = orchestrator.run(src.path(), dst.path(), |_| ());
        assert_eq!(outcome.exit_code(), 0);
        let BackupOutcome::Completed(archive) = outcome else {
            panic!("Expected completed backup on retry, got {outcome:?}");
        };
        assert_eq!(archive_entries(&archive), vec!["a.txt", "b.txt"]);
        assert_eq!(orchestrator.state(), BackupState::Complete);
    }

    #[test]
    fn test_failed_finalize_keeps_files_selectable() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_with_mtime(&src.path().join("a.txt"), "a", hour_ago());
        // A directory where the marker should go makes the watermark unwritable.
        std::fs::create_dir(watermark_path(dst.path())).unwrap();

        let mut orchestrator = orchestrator();
        let outcome = orchestrator.run(src.path(), dst.path(), |_| ());
        assert!(matches!(outcome, BackupOutcome::Failed(_)));
        assert_eq!(orchestrator.state(), BackupState::Error);
        assert!(watermark_path(dst.path()).is_dir());

        std::fs::remove_dir(watermark_path(dst.path())).unwrap();
        let BackupOutcome::Completed(archive) = orchestrator.run(src.path(), dst.path(), |_| ())
        else {
            panic!("Expected completed backup on retry");
        };
        assert_eq!(archive_entries(&archive), vec!["a.txt"]);
    }

    #[test]
    fn test_progress_reaches_100() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        for (name, content) in [("a", "aaaa"), ("b", "b"), ("c", "cccccc")] {
            write_with_mtime(&src.path().join(name), content, hour_ago());
        }

        let mut progress = Vec::new();
        let outcome = orchestrator().run(src.path(), dst.path(), |p| progress.push(p));
        assert!(matches!(outcome, BackupOutcome::Completed(_)));
        assert_eq!(progress, vec![36, 45, 100]);
    }

    #[test]
    fn test_spawn_reports_progress_then_one_terminal_event() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_with_mtime(&src.path().join("a.txt"), "abc", hour_ago());
        write_with_mtime(&src.path().join("b.txt"), "abc", hour_ago());

        let (tx, rx) = mpsc::channel();
        let handle = orchestrator()
            .spawn(src.path().to_path_buf(), dst.path().to_path_buf(), tx)
            .unwrap();
        let (orchestrator, outcome) = handle.join().unwrap();
        let events: Vec<BackupEvent> = rx.iter().collect();

        let BackupOutcome::Completed(archive) = outcome else {
            panic!("Expected completed backup");
        };
        assert_eq!(orchestrator.state(), BackupState::Complete);
        assert_eq!(
            events,
            vec![
                BackupEvent::Progress(50),
                BackupEvent::Progress(100),
                BackupEvent::Completed(archive),
            ]
        );
    }

    #[test]
    fn test_spawn_failure_event_carries_message() {
        let dst = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = orchestrator()
            .spawn(dst.path().join("missing"), dst.path().to_path_buf(), tx)
            .unwrap();
        handle.join().unwrap();

        let events: Vec<BackupEvent> = rx.iter().collect();
        assert_eq!(events.len(), 1);
        let BackupEvent::Failed(msg) = &events[0] else {
            panic!("Expected failure event, got {events:?}");
        };
        assert!(msg.contains("Source folder"));
    }

    #[test]
    fn test_spawn_survives_dropped_receiver() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_with_mtime(&src.path().join("a.txt"), "a", hour_ago());

        let (tx, rx) = mpsc::channel();
        drop(rx);
        let (_, outcome) = orchestrator()
            .spawn(src.path().to_path_buf(), dst.path().to_path_buf(), tx)
            .unwrap()
            .join()
            .unwrap();
        assert!(matches!(outcome, BackupOutcome::Completed(_)));
    }

    #[test]
    fn test_compressed_run_is_readable() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_with_mtime(&src.path().join("notes.md"), "# notes", hour_ago());

        let outcome = BackupOrchestrator::builder().build().run(src.path(), dst.path(), |_| ());
        let BackupOutcome::Completed(archive) = outcome else {
            panic!("Expected completed backup");
        };
        assert!(archive.to_string_lossy().ends_with(".tar.xz"));

        let mut archive = tar::Archive::new(liblzma::read::XzDecoder::new(File::open(archive).unwrap()));
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "# notes");
    }

    #[test]
    fn test_job_watermark_truncated_to_seconds() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let now = Local::now();
        watermark::save(dst.path(), now.into()).unwrap();

        let job = BackupJob::prepare(src.path(), dst.path()).unwrap();
        assert_eq!(job.watermark().date_time(), now.trunc_subsecs(0));
        assert!(job.nested_dest().is_none());
    }
}
