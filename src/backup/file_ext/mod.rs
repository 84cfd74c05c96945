use std::sync::Arc;

/// Something that contributes a suffix to the archive file name, such as
/// `tar` for the container or `xz` for the compressor.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
