use crate::error::AggregatorError;
use flate2::write::ZlibDecoder;
use std::io::{self, Write};
use std::path::PathBuf;

/// Destination of one downloaded attachment.
///
/// Bytes are written to a temporary location; [`finish`](DownloadSink::finish)
/// moves them to their final place and [`discard`](DownloadSink::discard)
/// deletes them.
pub trait DownloadSink: Write + Send + Sync {
    fn finish(self: Box<Self>) -> io::Result<PathBuf>;
    fn discard(&mut self);
}

/// Creates download sinks. Implemented by the client's filesystem storage and
/// by in-memory doubles in tests.
pub trait AttachmentStorage: Send + Sync {
    fn create_sink(&self, file_name: &str) -> io::Result<Box<dyn DownloadSink>>;
}

/// Decoding applied to the raw chunk bytes before they reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransform {
    /// The server sent the file zlib-compressed.
    Inflate,
}

/// A sink, optionally behind a decoding writer.
pub(crate) enum OutputWriter {
    Plain(Box<dyn DownloadSink>),
    Inflate(ZlibDecoder<SinkWriter>),
}

/// Remembers whether the sink itself failed, so a decoder error can be told
/// apart from a local write error.
pub(crate) struct SinkWriter {
    sink: Box<dyn DownloadSink>,
    failed: bool,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.sink.write(buf);
        self.failed |= result.is_err();
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.sink.flush();
        self.failed |= result.is_err();
        result
    }
}

fn inflate_error(decoder: &ZlibDecoder<SinkWriter>, error: io::Error) -> AggregatorError {
    if decoder.get_ref().failed {
        AggregatorError::Io(error)
    } else {
        AggregatorError::bad_response(format!("corrupt compressed stream: {error}"))
    }
}

impl OutputWriter {
    pub(crate) fn open(
        storage: &dyn AttachmentStorage,
        file_name: &str,
        transform: Option<StreamTransform>,
    ) -> io::Result<Self> {
        let sink = storage.create_sink(file_name)?;
        Ok(match transform {
            None => OutputWriter::Plain(sink),
            Some(StreamTransform::Inflate) => OutputWriter::Inflate(ZlibDecoder::new(SinkWriter {
                sink,
                failed: false,
            })),
        })
    }

    pub(crate) fn write_all(&mut self, data: &[u8]) -> Result<(), AggregatorError> {
        match self {
            OutputWriter::Plain(sink) => Ok(sink.write_all(data)?),
            OutputWriter::Inflate(decoder) => decoder
                .write_all(data)
                .map_err(|e| inflate_error(decoder, e)),
        }
    }

    pub(crate) fn finish(self) -> Result<PathBuf, AggregatorError> {
        match self {
            OutputWriter::Plain(mut sink) => {
                sink.flush()?;
                Ok(sink.finish()?)
            }
            OutputWriter::Inflate(mut decoder) => {
                if let Err(e) = decoder.try_finish() {
                    let error = inflate_error(&decoder, e);
                    decoder.get_mut().sink.discard();
                    return Err(error);
                }
                let mut writer = decoder.finish()?;
                writer.sink.flush()?;
                Ok(writer.sink.finish()?)
            }
        }
    }

    pub(crate) fn discard(mut self) {
        match &mut self {
            OutputWriter::Plain(sink) => sink.discard(),
            OutputWriter::Inflate(decoder) => decoder.get_mut().sink.discard(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MemoryStorage;
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;

    #[test]
    fn test_inflate_transform_decodes_into_sink() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello attachment").unwrap();
        let compressed = encoder.finish().unwrap();

        let storage = MemoryStorage::default();
        let mut writer =
            OutputWriter::open(&storage, "a.txt", Some(StreamTransform::Inflate)).unwrap();
        let (first, second) = compressed.split_at(compressed.len() / 2);
        writer.write_all(first).unwrap();
        writer.write_all(second).unwrap();
        let path = writer.finish().unwrap();

        assert_eq!(path, PathBuf::from("a.txt"));
        let file = storage.file(0);
        assert_eq!(file.data, b"hello attachment");
        assert!(file.finished);
    }

    #[test]
    fn test_discard_reaches_inner_sink() {
        let storage = MemoryStorage::default();
        let writer = OutputWriter::open(&storage, "b.bin", Some(StreamTransform::Inflate)).unwrap();
        writer.discard();
        assert!(storage.file(0).discarded);
    }

    #[test]
    fn test_corrupt_compressed_data_is_a_bad_response() {
        let storage = MemoryStorage::default();
        let mut writer =
            OutputWriter::open(&storage, "c.bin", Some(StreamTransform::Inflate)).unwrap();

        let result = writer.write_all(b"this was never zlib data");
        assert!(matches!(result, Err(AggregatorError::BadResponse(_))));
    }

    #[test]
    fn test_sink_failure_behind_inflate_is_io() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[3u8; 2048]).unwrap();
        let compressed = encoder.finish().unwrap();

        let storage = MemoryStorage {
            fail_writes: true,
            ..Default::default()
        };
        let mut writer =
            OutputWriter::open(&storage, "d.bin", Some(StreamTransform::Inflate)).unwrap();
        let error = match writer.write_all(&compressed) {
            Err(e) => e,
            Ok(()) => writer.finish().unwrap_err(),
        };
        assert!(matches!(error, AggregatorError::Io(_)));
    }
}
