//! Persistence of the last successful backup time.
//!
//! The marker is a one-line text file in the destination directory holding a
//! local timestamp formatted as `YYYY-MM-DD HH:MM:SS`. Anything that cannot be
//! read back as such a timestamp is treated as "never backed up".

use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use chrono::{DateTime, Local, NaiveDateTime, SubsecRound, TimeZone, Utc};
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;

pub static WATERMARK_FILE_NAME: &str = "last_backup_time.txt";
pub static WATERMARK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Cutoff below which files count as already backed up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(DateTime<Local>);

impl Watermark {
    /// The watermark of a destination that was never backed up into.
    pub fn epoch() -> Self {
        Watermark(DateTime::<Utc>::UNIX_EPOCH.with_timezone(&Local))
    }

    /// Current wall-clock time at the one second resolution the marker keeps.
    pub fn now() -> Self {
        Local::now().into()
    }

    pub fn date_time(&self) -> DateTime<Local> {
        self.0
    }

    /// Strictly newer only: a file modified exactly at the watermark is
    /// considered backed up.
    pub fn is_older_than(&self, modified: SystemTime) -> bool {
        DateTime::<Local>::from(modified) > self.0
    }

    fn parse(s: &str) -> Option<Self> {
        let naive = NaiveDateTime::parse_from_str(s.trim(), WATERMARK_TIME_FORMAT).ok()?;
        Local.from_local_datetime(&naive).earliest().map(Watermark)
    }
}

impl From<DateTime<Local>> for Watermark {
    fn from(value: DateTime<Local>) -> Self {
        Watermark(value.trunc_subsecs(0))
    }
}

impl Display for Watermark {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(WATERMARK_TIME_FORMAT))
    }
}

pub fn watermark_path<P: AsRef<Path>>(dst_dir: P) -> PathBuf {
    dst_dir.as_ref().join(WATERMARK_FILE_NAME)
}

/// Reads the watermark stored in `dst_dir`.
///
/// Never fails: a missing, unreadable or malformed marker yields
/// [`Watermark::epoch`], which selects every file.
pub fn load<P: AsRef<Path>>(dst_dir: P) -> Watermark {
    let path = watermark_path(dst_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No watermark at {:?}, backing up everything", path);
            return Watermark::epoch();
        }
        Err(e) => {
            tracing::warn!("Cannot read watermark {:?}, backing up everything: {e}", path);
            return Watermark::epoch();
        }
    };

    match Watermark::parse(&content) {
        Some(watermark) => {
            tracing::debug!("Loaded watermark {watermark} from {:?}", path);
            watermark
        }
        None => {
            tracing::warn!(
                "Malformed watermark {:?} in {:?}, backing up everything",
                content.trim(),
                path
            );
            Watermark::epoch()
        }
    }
}

/// Replaces the marker in `dst_dir` with `watermark`.
///
/// The new content goes to a temporary file in the same directory which is
/// then renamed over the marker, so readers see either the old or the new
/// line.
pub fn save<P: AsRef<Path>>(dst_dir: P, watermark: Watermark) -> Result<()> {
    let dst_dir = dst_dir.as_ref();
    let path = watermark_path(dst_dir);
    let res: Result<()> = (|| {
        let mut tmp = NamedTempFile::new_in(dst_dir)?;
        writeln!(tmp, "{watermark}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })();
    res.with_msg(format!("Saving watermark {watermark} to {:?} failed", path))?;

    tracing::info!("Saved watermark {watermark} to {:?}", path);
    Ok(())
}
