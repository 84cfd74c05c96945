//! Archive construction.
//!
//! Selected files are streamed into a tar archive that is compressed on the
//! fly and written as `<YYYY-MM-DD_HH-MM-SS>.tar.xz` in the destination
//! directory. The file only appears under its final name once every entry
//! and the compressor trailer were written.

use crate::backup::compress::{CompressorBuilder, CompressorConfig};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use crate::backup::scan::FileSelection;
use bon::Builder;
use chrono::{DateTime, Local};
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

pub static ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

/// Integer percentage of planned bytes written so far.
///
/// Sizes come from the scan, files are not measured again while writing.
/// When every selected file is empty the percentage follows the file count
/// instead.
#[derive(Debug)]
struct ProgressCounter {
    total_bytes: u64,
    total_files: usize,
    done_bytes: u64,
    done_files: usize,
}

impl ProgressCounter {
    fn new(selection: &FileSelection) -> Self {
        Self {
            total_bytes: *selection.total_bytes(),
            total_files: selection.len(),
            done_bytes: 0,
            done_files: 0,
        }
    }

    fn advance(&mut self, size: u64) -> u8 {
        self.done_bytes = self.done_bytes.saturating_add(size);
        self.done_files += 1;
        let (done, total) = if self.total_bytes == 0 {
            (self.done_files as u128, self.total_files as u128)
        } else {
            (self.done_bytes as u128, self.total_bytes as u128)
        };
        if total == 0 {
            return 100;
        }
        (done * 100 / total).min(100) as u8
    }
}

/// Writes a [`FileSelection`] into a new timestamped archive in `dst_dir`.
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct ArchiveBuilder {
    #[builder(into)]
    dst_dir: PathBuf,
    #[builder(default)]
    compressor: CompressorConfig,
}

impl FileExtProvider for ArchiveBuilder {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(TAR_FILE_EXT.get_or_init(|| "tar".into()))
                .chain(self.compressor.file_ext().iter())
                .join(".")
                .into(),
        )
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl ArchiveBuilder {
    pub fn archive_file_name(&self, dt: DateTime<Local>, suffix: usize) -> String {
        let ext = self.file_ext().unwrap_or_else(|| "".into());
        match suffix {
            0 => format!("{}.{}", dt.format(ARCHIVE_TIME_FORMAT), ext),
            n => format!("{}_{}.{}", dt.format(ARCHIVE_TIME_FORMAT), n, ext),
        }
    }

    /// First archive path for `dt` not already taken by a finished or an
    /// in-progress archive.
    fn available_path(&self, dt: DateTime<Local>) -> PathBuf {
        let mut suffix = 0;
        loop {
            let path = self.dst_dir.join(self.archive_file_name(dt, suffix));
            if !path.exists() && !tmp_path(&path).exists() {
                return path;
            }
            tracing::debug!("Archive name {:?} already taken", path);
            suffix += 1;
        }
    }

    /// Archives every file of `selection` in order, calling `on_progress`
    /// after each one, and returns the path of the finished archive.
    ///
    /// On failure nothing is left under the final name and the temporary
    /// file is removed.
    #[named]
    pub fn build<F: FnMut(u8)>(&self, selection: &FileSelection, mut on_progress: F) -> Result<PathBuf> {
        let file_path = self.available_path(Local::now());
        let file_path_tmp = tmp_path(&file_path);
        tracing::info!(
            "Writing {} files ({} bytes) into {:?}",
            selection.len(),
            selection.total_bytes(),
            file_path
        );

        let file = File::create_new(&file_path_tmp)
            .map_err(Error::from)
            .with_msg(format!("Creating archive {:?} failed", file_path_tmp))
            .with_debug_object_and_fn_name(self.clone(), function_path!())?;

        self.write_entries(file, selection, &mut on_progress)
            .and_then(|_| std::fs::rename(&file_path_tmp, &file_path).map_err(Error::from))
            .map_err(|mut e| {
                if let Err(e2) = std::fs::remove_file(&file_path_tmp) {
                    e = e.chain(Error::from(e2).with_msg("Delete tmp file failed"));
                }
                e.with_debug_object_and_fn_name(self.clone(), function_path!())
            })?;

        tracing::info!("Created backup file: {:?}", file_path);
        Ok(file_path)
    }

    fn write_entries<F: FnMut(u8)>(
        &self,
        file: File,
        selection: &FileSelection,
        on_progress: &mut F,
    ) -> Result<()> {
        let mut writer = self
            .compressor
            .build_compressor(BufWriter::new(file))
            .map(BufWriter::new)
            .map(tar::Builder::new)?;
        writer.follow_symlinks(true);

        let mut progress = ProgressCounter::new(selection);
        for entry in selection.files() {
            writer
                .append_path_with_name(entry.src(), entry.relative())
                .map_err(|e| Error::archive(entry.relative(), e))?;
            let percent = progress.advance(*entry.size());
            tracing::trace!("Archived {:?}, {percent}%", entry.relative());
            on_progress(percent);
        }

        writer
            .into_inner()?
            .finish()?
            .finish()?
            .finish()?
            .sync_all()?;
        Ok(())
    }
}
