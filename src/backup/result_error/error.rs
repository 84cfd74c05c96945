use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::mpsc::SendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error("{0}")]
    Configuration(String),
    #[error("Writing {entry:?} into archive failed: {error}")]
    Archive {
        entry: PathBuf,
        error: std::io::Error,
    },
    #[error("{0}")]
    ChannelSendError(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

/// Coarse classification of a failed run, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Source or destination missing from the request, or otherwise unusable
    /// as a pair (for example the same directory twice).
    Configuration,
    /// Unreadable or unwritable paths, disk full, permission denied.
    Io,
    /// A source file could not be written into the archive.
    Archive,
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<D: Debug> From<SendError<D>> for Error {
    fn from(value: SendError<D>) -> Self {
        Self::ChannelSendError(format!("Failed to send {:?}", value.0))
    }
}

impl Error {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn archive<P: Into<PathBuf>>(entry: P, error: std::io::Error) -> Self {
        Self::Archive {
            entry: entry.into(),
            error,
        }
    }

    /// Classifies the error, looking through context wrappers.
    ///
    /// A chain of several errors is classified by its first member.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::ValidationError(_) | Error::SerdeYml(_) => {
                ErrorKind::Configuration
            }
            Error::Globset(_) => ErrorKind::Configuration,
            Error::Archive { .. } | Error::LiblzmaStream(_) => ErrorKind::Archive,
            Error::Io(_) | Error::WalkDir(_) | Error::ChannelSendError(_) => ErrorKind::Io,
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.kind()
            }
            Error::LotsOfError(v) => v.first().map(Error::kind).unwrap_or(ErrorKind::Io),
        }
    }

    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }
}
