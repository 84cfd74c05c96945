use liblzma::write::XzEncoder;
use std::io::{BufWriter, Error, IntoInnerError, Write};

/// A writer layer that has to write a trailer before the inner writer can be
/// handed back.
pub trait Finish<O> {
    fn finish(self) -> Result<O, Error>;
}

impl<W: Write> Finish<W> for XzEncoder<W> {
    fn finish(self) -> Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for BufWriter<W> {
    fn finish(self) -> Result<W, Error> {
        self.into_inner().map_err(IntoInnerError::into_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    #[test]
    fn test_buf_writer_finish_flushes() {
        let mut writer = BufWriter::new(Cursor::new(Vec::new()));
        writer.write_all(b"pending").unwrap();

        let inner = Finish::finish(writer).unwrap();
        assert_eq!(inner.get_ref(), b"pending");
    }

    #[test]
    fn test_xz_encoder_finish_writes_valid_stream() {
        let mut encoder = XzEncoder::new(Cursor::new(Vec::new()), 1);
        encoder.write_all(b"watermark").unwrap();

        let compressed = Finish::finish(encoder).unwrap().into_inner();
        let mut decoded = String::new();
        liblzma::read::XzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "watermark");
    }
}
