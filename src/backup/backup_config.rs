use crate::backup::compress::CompressorConfig;
use crate::backup::orchestrator::BackupOrchestrator;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::scan::{default_include, CustomDeserializedGlob};
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::result;
use validator::{Validate, ValidationErrors};

/// Settings for a backup run, usually read from a YAML file.
///
/// The directories are optional here so that they can come from the command
/// line instead; [`BackupConfig::require_dirs`] checks that both ended up set.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct BackupConfig {
    #[builder(into)]
    src_dir: Option<PathBuf>,
    #[builder(into)]
    dst_dir: Option<PathBuf>,
    #[serde(default)]
    #[builder(default)]
    compressor: CompressorConfig,
    #[serde(default = "default_include")]
    #[builder(default = default_include(), into)]
    include: Vec<CustomDeserializedGlob>,
    #[serde(default)]
    #[builder(default, into)]
    exclude: Vec<CustomDeserializedGlob>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig::builder().build()
    }
}

impl Validate for BackupConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        self.compressor.validate()
    }
}

impl BackupConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, BackupConfig>(f).map_err(Error::from))
            .with_msg(format!("Parse YAML config failed: {:?}", path))
    }

    /// Replaces the directories with the ones given explicitly, keeping the
    /// configured ones where nothing was given.
    pub fn with_dirs(mut self, src_dir: Option<PathBuf>, dst_dir: Option<PathBuf>) -> Self {
        if src_dir.is_some() {
            self.src_dir = src_dir;
        }
        if dst_dir.is_some() {
            self.dst_dir = dst_dir;
        }
        self
    }

    pub fn require_dirs(&self) -> Result<(PathBuf, PathBuf)> {
        match (&self.src_dir, &self.dst_dir) {
            (Some(src), Some(dst)) => Ok((src.clone(), dst.clone())),
            _ => Err(Error::configuration(
                "Please select both source and backup folders.",
            )),
        }
    }

    pub fn orchestrator(&self) -> BackupOrchestrator {
        BackupOrchestrator::builder()
            .compressor(self.compressor.clone())
            .include(self.include.clone())
            .exclude(self.exclude.clone())
            .build()
    }
}
