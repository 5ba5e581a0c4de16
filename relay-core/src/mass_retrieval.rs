use crate::attachment::{AttachmentStorage, OutputWriter, StreamTransform};
use crate::error::AggregatorError;
use std::collections::HashMap;
use std::path::PathBuf;

struct AttachmentWriter {
    writer: OutputWriter,
    declared_length: Option<u64>,
    written: u64,
    next_index: i32,
}

/// Tracks a full-history download across its phases.
///
/// Item chunks carry their own response index sequence. Attachments are keyed
/// by GUID and each has an independent index sequence, so they can interleave
/// with items and with each other.
#[derive(Default)]
pub struct MassRetrievalAggregator {
    started: bool,
    total_messages: u64,
    received_messages: u64,
    next_item_index: i32,
    attachments: HashMap<String, AttachmentWriter>,
}

impl MassRetrievalAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn received_messages(&self) -> u64 {
        self.received_messages
    }

    pub fn open_attachments(&self) -> usize {
        self.attachments.len()
    }

    pub fn handle_initial_info(&mut self, message_count: u64) -> Result<(), AggregatorError> {
        if self.started {
            return Err(AggregatorError::bad_response("mass retrieval started twice"));
        }
        self.started = true;
        self.total_messages = message_count;
        Ok(())
    }

    /// Accounts for a batch of items. Returns the received count.
    pub fn handle_items(&mut self, response_index: i32, count: usize) -> Result<u64, AggregatorError> {
        if !self.started {
            return Err(AggregatorError::bad_response("items before start"));
        }
        if response_index != self.next_item_index {
            return Err(AggregatorError::bad_response(format!(
                "expected item chunk {}, got {}",
                self.next_item_index, response_index
            )));
        }
        self.next_item_index += 1;
        self.received_messages += count as u64;
        Ok(self.received_messages)
    }

    pub fn initialize_attachment(
        &mut self,
        storage: &dyn AttachmentStorage,
        guid: &str,
        file_name: &str,
        declared_length: Option<u64>,
        transform: Option<StreamTransform>,
    ) -> Result<(), AggregatorError> {
        if !self.started {
            return Err(AggregatorError::bad_response("attachment before start"));
        }
        if self.attachments.contains_key(guid) {
            return Err(AggregatorError::bad_response(format!(
                "attachment {guid} started twice"
            )));
        }
        let writer = OutputWriter::open(storage, file_name, transform)?;
        self.attachments.insert(
            guid.to_string(),
            AttachmentWriter {
                writer,
                declared_length,
                written: 0,
                next_index: 0,
            },
        );
        Ok(())
    }

    pub fn write_attachment_chunk(
        &mut self,
        guid: &str,
        response_index: i32,
        data: &[u8],
    ) -> Result<u64, AggregatorError> {
        let Some(attachment) = self.attachments.get_mut(guid) else {
            return Err(AggregatorError::bad_response(format!(
                "chunk for unknown attachment {guid}"
            )));
        };
        if response_index != attachment.next_index {
            return Err(AggregatorError::bad_response(format!(
                "expected chunk {} of {guid}, got {}",
                attachment.next_index, response_index
            )));
        }

        let written = attachment.written + data.len() as u64;
        if let Some(declared) = attachment.declared_length {
            if written > declared {
                return Err(AggregatorError::bad_response(format!(
                    "{guid}: {written} bytes exceed declared length {declared}"
                )));
            }
        }

        attachment.writer.write_all(data)?;
        attachment.written = written;
        attachment.next_index += 1;
        Ok(written)
    }

    pub fn finish_attachment(&mut self, guid: &str) -> Result<PathBuf, AggregatorError> {
        let Some(attachment) = self.attachments.remove(guid) else {
            return Err(AggregatorError::bad_response(format!(
                "completion for unknown attachment {guid}"
            )));
        };
        if let Some(declared) = attachment.declared_length {
            if attachment.written != declared {
                let written = attachment.written;
                attachment.writer.discard();
                return Err(AggregatorError::bad_response(format!(
                    "{guid}: received {written} of {declared} bytes"
                )));
            }
        }
        attachment.writer.finish()
    }

    /// Finalises the retrieval. Attachments still open at this point were never
    /// completed by the server.
    pub fn complete(&mut self) -> Result<(), AggregatorError> {
        if !self.attachments.is_empty() {
            let open = self.attachments.len();
            self.cancel();
            return Err(AggregatorError::bad_response(format!(
                "{open} attachments still open at completion"
            )));
        }
        Ok(())
    }

    /// Discards every partially written attachment.
    pub fn cancel(&mut self) {
        for (_, attachment) in self.attachments.drain() {
            attachment.writer.discard();
        }
    }
}

impl Drop for MassRetrievalAggregator {
    fn drop(&mut self) {
        self.cancel();
    }
}
