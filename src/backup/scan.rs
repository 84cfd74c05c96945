//! Change detection: walks the source tree and picks every regular file
//! modified after the watermark.
//!
//! Symlinks to regular files are treated as the file they point to; symlinked
//! directories are never descended into, and broken links are skipped.

use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use crate::backup::watermark::Watermark;

use bon::Builder;
use derive_more::{Display, From};
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use walkdir::{DirEntry, WalkDir};

use std::fmt::Formatter;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::result;

/// One file picked for the archive.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct SelectedFile {
    /// Path on disk, as found under the source directory.
    src: PathBuf,
    /// Path inside the archive; never absolute, never carries the source
    /// directory itself.
    relative: PathBuf,
    /// Size at scan time, used for progress accounting.
    size: u64,
}

impl SelectedFile {
    pub fn new<A: Into<PathBuf>, B: Into<PathBuf>>(src: A, relative: B, size: u64) -> Self {
        Self {
            src: src.into(),
            relative: relative.into(),
            size,
        }
    }
}

/// Files newer than the watermark, in walk order, with their summed size.
#[derive(Clone, Debug, Default, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct FileSelection {
    files: Vec<SelectedFile>,
    total_bytes: u64,
}

impl FileSelection {
    pub fn push(&mut self, file: SelectedFile) {
        self.total_bytes = self.total_bytes.saturating_add(file.size);
        self.files.push(file);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

impl FromIterator<SelectedFile> for FileSelection {
    fn from_iter<T: IntoIterator<Item = SelectedFile>>(iter: T) -> Self {
        let mut selection = FileSelection::default();
        iter.into_iter().for_each(|f| selection.push(f));
        selection
    }
}

/// A glob pattern wrapper that handles custom deserialization
///
/// Patterns are matched against paths relative to the source directory with
/// literal separators, so `*` never crosses a `/`.
#[derive(Clone, Debug, From, Display, Serialize, Builder, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct CustomDeserializedGlob {
    #[builder(into)]
    glob: Glob,
}

impl Default for CustomDeserializedGlob {
    fn default() -> Self {
        CustomDeserializedGlob::parse("**/*").expect("default glob pattern is valid")
    }
}

impl CustomDeserializedGlob {
    pub fn parse(pattern: &str) -> result::Result<Self, globset::Error> {
        GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map(CustomDeserializedGlob::from)
    }
}

struct CustomGlobVisitor;

impl Visitor<'_> for CustomGlobVisitor {
    type Value = CustomDeserializedGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        CustomDeserializedGlob::parse(v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for CustomDeserializedGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(CustomGlobVisitor)
    }
}

pub fn default_include() -> Vec<CustomDeserializedGlob> {
    vec![CustomDeserializedGlob::default()]
}

fn build_globset(globs: &[CustomDeserializedGlob]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    globs.iter().for_each(|g| {
        builder.add(g.glob.clone());
    });
    Ok(builder.build()?)
}

/// Walks `src_dir` and selects files strictly newer than a watermark.
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct ChangeScanner {
    #[builder(into)]
    src_dir: PathBuf,
    /// Files must match one of these. An empty list means everything.
    #[builder(default = default_include(), into)]
    include: Vec<CustomDeserializedGlob>,
    #[builder(default, into)]
    exclude: Vec<CustomDeserializedGlob>,
    /// Subtree left out of the walk, used when the destination lives inside
    /// the source. Expressed under `src_dir`.
    #[builder(into)]
    prune_dir: Option<PathBuf>,
}

impl ChangeScanner {
    #[named]
    pub fn scan(&self, watermark: Watermark) -> Result<FileSelection> {
        if !self.src_dir.is_dir() {
            tracing::debug!(
                "Source directory does not exist or is not a directory: {:?}",
                self.src_dir
            );
            return Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{:?} is not a directory", self.src_dir),
            ))
            .with_debug_object_and_fn_name(self.clone(), function_path!()));
        }

        tracing::info!(
            "Scanning {:?} for files modified after {watermark}",
            self.src_dir
        );

        let include = if self.include.is_empty() {
            build_globset(&default_include())?
        } else {
            build_globset(&self.include)?
        };
        let exclude = build_globset(&self.exclude)?;
        let prune_dir = self.prune_dir.clone();

        let walker = WalkDir::new(&self.src_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |de| match &prune_dir {
                Some(p) if de.path() == p.as_path() => {
                    tracing::debug!("Pruning {:?} from scan", p);
                    false
                }
                _ => true,
            });

        let mut selection = FileSelection::default();
        for res in walker {
            let de = match res {
                Ok(de) => de,
                Err(e) if e.depth() == 0 => {
                    return Err(Error::from(e)
                        .with_debug_object_and_fn_name(self.clone(), function_path!()));
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {e}");
                    continue;
                }
            };
            if let Some(file) = self.inspect(de, &include, &exclude, watermark)? {
                selection.push(file);
            }
        }

        tracing::info!(
            "Selected {} files ({} bytes) under {:?}",
            selection.len(),
            selection.total_bytes,
            self.src_dir
        );
        Ok(selection)
    }

    fn inspect(
        &self,
        de: DirEntry,
        include: &GlobSet,
        exclude: &GlobSet,
        watermark: Watermark,
    ) -> Result<Option<SelectedFile>> {
        let Some(metadata) = file_metadata(&de) else {
            return Ok(None);
        };

        let path = de.into_path();
        let relative = path
            .strip_prefix(&self.src_dir)
            .map(Path::to_path_buf)
            .map_err(|e| {
                Error::from(std::io::Error::other(e))
                    .with_msg(format!("Stripping {:?} from {:?} failed", self.src_dir, path))
            })?;

        if !include.is_match(&relative) || exclude.is_match(&relative) {
            tracing::trace!("Skipping {:?}, glob not match", relative);
            return Ok(None);
        }

        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!("Skipping {:?}, modification time unavailable: {e}", path);
                return Ok(None);
            }
        };
        if !watermark.is_older_than(modified) {
            tracing::trace!("Skipping {:?}, not modified since {watermark}", relative);
            return Ok(None);
        }

        tracing::debug!("Including file: {:?} -> {:?}", path, relative);
        Ok(Some(SelectedFile::new(path, relative, metadata.len())))
    }
}

/// Metadata of the regular file behind `de`, following a symlink one level.
/// `None` for directories, special files, broken links and entries that
/// vanished since they were listed.
fn file_metadata(de: &DirEntry) -> Option<Metadata> {
    let res = if de.path_is_symlink() {
        std::fs::metadata(de.path())
    } else if de.file_type().is_file() {
        de.metadata().map_err(std::io::Error::from)
    } else {
        tracing::trace!("Skipping {:?} not a file", de.path());
        return None;
    };

    match res {
        Ok(md) if md.is_file() => Some(md),
        Ok(_) => {
            tracing::trace!("Skipping symlink {:?}, target is not a file", de.path());
            None
        }
        Err(e) => {
            tracing::warn!("Skipping {:?}, cannot read metadata: {e}", de.path());
            None
        }
    }
}
