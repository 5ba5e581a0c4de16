use crate::attachment::{AttachmentStorage, OutputWriter, StreamTransform};
use crate::error::AggregatorError;
use crate::types::AttachmentRequest;
use std::path::PathBuf;

/// Tracks one attachment download as its chunks arrive.
///
/// The adapter reports a start with the declared length, then chunks tagged
/// with a response index that must count up from zero, then completion. Any
/// deviation is a protocol violation and fails the download.
pub struct FileFetchAggregator {
    request: AttachmentRequest,
    total_length: u64,
    written: u64,
    next_index: i32,
    writer: Option<OutputWriter>,
}

impl FileFetchAggregator {
    pub fn new(request: AttachmentRequest) -> Self {
        Self {
            request,
            total_length: 0,
            written: 0,
            next_index: 0,
            writer: None,
        }
    }

    pub fn request(&self) -> &AttachmentRequest {
        &self.request
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_started(&self) -> bool {
        self.writer.is_some()
    }

    /// Opens the output sink. A second start for the same download is rejected.
    pub fn initialize(
        &mut self,
        storage: &dyn AttachmentStorage,
        length: u64,
        transform: Option<StreamTransform>,
    ) -> Result<(), AggregatorError> {
        if self.writer.is_some() {
            return Err(AggregatorError::bad_response("download started twice"));
        }
        self.writer = Some(OutputWriter::open(
            storage,
            &self.request.file_name,
            transform,
        )?);
        self.total_length = length;
        Ok(())
    }

    /// Writes one chunk and returns the number of raw bytes written so far.
    pub fn write_chunk(&mut self, response_index: i32, data: &[u8]) -> Result<u64, AggregatorError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(AggregatorError::bad_response("chunk before start"));
        };
        if response_index != self.next_index {
            return Err(AggregatorError::bad_response(format!(
                "expected chunk {}, got {}",
                self.next_index, response_index
            )));
        }

        let written = self.written + data.len() as u64;
        if written > self.total_length {
            return Err(AggregatorError::bad_response(format!(
                "{} bytes exceed declared length {}",
                written, self.total_length
            )));
        }

        writer.write_all(data)?;
        self.written = written;
        self.next_index += 1;
        Ok(written)
    }

    /// Finalises the sink once every declared byte has arrived.
    pub fn complete(&mut self) -> Result<PathBuf, AggregatorError> {
        let Some(writer) = self.writer.take() else {
            return Err(AggregatorError::bad_response("complete before start"));
        };
        if self.written != self.total_length {
            let err = AggregatorError::bad_response(format!(
                "received {} of {} bytes",
                self.written, self.total_length
            ));
            writer.discard();
            return Err(err);
        }
        writer.finish()
    }

    /// Releases the partially written file, if any.
    pub fn cancel(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.discard();
        }
    }
}

impl Drop for FileFetchAggregator {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::test_support::MemoryStorage;

    fn request() -> AttachmentRequest {
        AttachmentRequest {
            message_local_id: 1,
            attachment_local_id: 2,
            attachment_guid: "att-1".into(),
            file_name: "photo.jpg".into(),
        }
    }

    #[test]
    fn test_exact_length_completes() {
        let storage = MemoryStorage::default();
        let mut fetch = FileFetchAggregator::new(request());
        fetch.initialize(&storage, 1000, None).unwrap();

        assert_eq!(fetch.write_chunk(0, &[1u8; 600]).unwrap(), 600);
        assert_eq!(fetch.write_chunk(1, &[2u8; 400]).unwrap(), 1000);
        let path = fetch.complete().unwrap();

        assert_eq!(path, PathBuf::from("photo.jpg"));
        let file = storage.file(0);
        assert_eq!(file.data.len(), 1000);
        assert!(file.finished);
        assert!(!file.discarded);
    }

    #[test]
    fn test_over_length_is_rejected() {
        let storage = MemoryStorage::default();
        let mut fetch = FileFetchAggregator::new(request());
        fetch.initialize(&storage, 100, None).unwrap();

        fetch.write_chunk(0, &[0u8; 60]).unwrap();
        let err = fetch.write_chunk(1, &[0u8; 60]).unwrap_err();
        assert!(matches!(err, AggregatorError::BadResponse(_)));
        assert_eq!(fetch.written(), 60);
    }

    #[test]
    fn test_out_of_order_chunk_is_rejected() {
        let storage = MemoryStorage::default();
        let mut fetch = FileFetchAggregator::new(request());
        fetch.initialize(&storage, 100, None).unwrap();

        fetch.write_chunk(0, &[0u8; 10]).unwrap();
        assert!(fetch.write_chunk(0, &[0u8; 10]).is_err());
        assert!(fetch.write_chunk(2, &[0u8; 10]).is_err());
        assert!(fetch.write_chunk(1, &[0u8; 10]).is_ok());
    }

    #[test]
    fn test_short_download_fails_and_discards() {
        let storage = MemoryStorage::default();
        let mut fetch = FileFetchAggregator::new(request());
        fetch.initialize(&storage, 100, None).unwrap();
        fetch.write_chunk(0, &[0u8; 50]).unwrap();

        assert!(matches!(
            fetch.complete(),
            Err(AggregatorError::BadResponse(_))
        ));
        assert!(storage.file(0).discarded);
    }

    #[test]
    fn test_chunk_before_start_is_rejected() {
        let mut fetch = FileFetchAggregator::new(request());
        assert!(matches!(
            fetch.write_chunk(0, b"data"),
            Err(AggregatorError::BadResponse(_))
        ));
    }

    #[test]
    fn test_write_failure_is_io() {
        let storage = MemoryStorage {
            fail_writes: true,
            ..Default::default()
        };
        let mut fetch = FileFetchAggregator::new(request());
        fetch.initialize(&storage, 10, None).unwrap();
        assert!(matches!(
            fetch.write_chunk(0, b"data"),
            Err(AggregatorError::Io(_))
        ));
    }

    #[test]
    fn test_drop_discards_partial_file() {
        let storage = MemoryStorage::default();
        {
            let mut fetch = FileFetchAggregator::new(request());
            fetch.initialize(&storage, 10, None).unwrap();
            fetch.write_chunk(0, b"abc").unwrap();
        }
        assert!(storage.file(0).discarded);
    }
}
