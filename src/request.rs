use crate::stream::StreamSender;
use relay_core::error::{
    AttachmentRequestError, ChatCreateError, MassRetrievalError, MessageSendError, RequestFailure,
};
use relay_core::file_fetch::FileFetchAggregator;
use relay_core::mass_retrieval::MassRetrievalAggregator;
use relay_core::request::{RequestId, RequestShape, TrackableKey};
use relay_core::types::{AttachmentDownloadEvent, AttachmentUploadEvent, MassRetrievalEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome channel of an in-flight request, by request kind.
pub(crate) enum PendingRequest {
    SendMessage {
        reply: oneshot::Sender<Result<(), MessageSendError>>,
    },
    Upload {
        events: StreamSender<AttachmentUploadEvent, MessageSendError>,
    },
    CreateChat {
        reply: oneshot::Sender<Result<String, ChatCreateError>>,
    },
    Download {
        attachment_guid: String,
        subscribers: Vec<StreamSender<AttachmentDownloadEvent, AttachmentRequestError>>,
        aggregator: FileFetchAggregator,
    },
    MassRetrieval {
        events: StreamSender<MassRetrievalEvent, MassRetrievalError>,
        aggregator: MassRetrievalAggregator,
    },
}

impl PendingRequest {
    pub(crate) fn shape(&self) -> RequestShape {
        match self {
            PendingRequest::SendMessage { .. } => RequestShape::Completable,
            PendingRequest::CreateChat { .. } => RequestShape::Single,
            PendingRequest::Upload { .. }
            | PendingRequest::Download { .. }
            | PendingRequest::MassRetrieval { .. } => RequestShape::Stream,
        }
    }

    pub(crate) fn trackable(&self) -> Option<TrackableKey> {
        match self {
            PendingRequest::Download {
                attachment_guid, ..
            } => Some(TrackableKey::attachment_download(attachment_guid.as_str())),
            _ => None,
        }
    }
}

/// A failure generated locally rather than reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalFailure {
    Timeout,
    ConnectionLost,
}

impl LocalFailure {
    pub(crate) fn to_error<E: RequestFailure>(self) -> E {
        match self {
            LocalFailure::Timeout => E::timeout(),
            LocalFailure::ConnectionLost => E::connection_lost(),
        }
    }
}

pub(crate) struct PendingEntry {
    pub request: PendingRequest,
    pub deadline: Instant,
    /// Distinguishes this entry from earlier ones that used the same ID.
    pub serial: u64,
}

/// In-flight requests keyed by request ID, each with its failure deadline.
#[derive(Default)]
pub(crate) struct PendingRequestTable {
    entries: HashMap<RequestId, PendingEntry>,
    next_serial: u64,
}

impl PendingRequestTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Registers a request and returns its serial.
    pub(crate) fn insert(
        &mut self,
        id: RequestId,
        request: PendingRequest,
        now: Instant,
        timeout: Duration,
    ) -> u64 {
        self.next_serial += 1;
        let serial = self.next_serial;
        self.entries.insert(
            id,
            PendingEntry {
                request,
                deadline: now + timeout,
                serial,
            },
        );
        serial
    }

    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut PendingEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<PendingEntry> {
        self.entries.remove(&id)
    }

    /// Removes the entry only if its request satisfies `matches`; a callback
    /// of the wrong kind leaves the entry in place.
    pub(crate) fn remove_if(
        &mut self,
        id: RequestId,
        matches: impl FnOnce(&PendingRequest) -> bool,
    ) -> Option<PendingEntry> {
        if matches(&self.entries.get(&id)?.request) {
            self.entries.remove(&id)
        } else {
            None
        }
    }

    /// Pushes a stream request's deadline back after progress. Completable and
    /// single-value requests keep the deadline they were issued with.
    pub(crate) fn touch(&mut self, id: RequestId, now: Instant, timeout: Duration) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.request.shape() == RequestShape::Stream {
                entry.deadline = now + timeout;
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Removes and returns every entry whose deadline has passed.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(RequestId, PendingEntry)> {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<(RequestId, PendingEntry)> {
        self.entries.drain().collect()
    }

    pub(crate) fn find(&self, key: &TrackableKey) -> Option<RequestId> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.request.trackable().as_ref() == Some(key))
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::RequestStream;
    use relay_core::types::AttachmentRequest;

    fn send_message() -> (
        PendingRequest,
        oneshot::Receiver<Result<(), MessageSendError>>,
    ) {
        let (reply, rx) = oneshot::channel();
        (PendingRequest::SendMessage { reply }, rx)
    }

    fn download(guid: &str) -> PendingRequest {
        PendingRequest::Download {
            attachment_guid: guid.to_string(),
            subscribers: Vec::new(),
            aggregator: FileFetchAggregator::new(AttachmentRequest {
                message_local_id: 1,
                attachment_local_id: 1,
                attachment_guid: guid.to_string(),
                file_name: "file.bin".to_string(),
            }),
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(24);

    #[test]
    fn test_expiry_removes_only_due_entries() {
        let mut table = PendingRequestTable::new();
        let start = Instant::now();
        let (first, _rx1) = send_message();
        let (second, _rx2) = send_message();
        table.insert(RequestId(1), first, start, TIMEOUT);
        table.insert(RequestId(2), second, start + Duration::from_secs(5), TIMEOUT);

        assert_eq!(table.next_deadline(), Some(start + TIMEOUT));
        assert!(table.take_expired(start + TIMEOUT - Duration::from_millis(1)).is_empty());

        let expired = table.take_expired(start + TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, RequestId(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_touch_rearms_streams_only() {
        let mut table = PendingRequestTable::new();
        let start = Instant::now();
        let (completable, _rx) = send_message();
        let (events, _stream) = RequestStream::<AttachmentUploadEvent, MessageSendError>::channel();
        table.insert(RequestId(1), completable, start, TIMEOUT);
        table.insert(RequestId(2), PendingRequest::Upload { events }, start, TIMEOUT);

        let later = start + Duration::from_secs(10);
        table.touch(RequestId(1), later, TIMEOUT);
        table.touch(RequestId(2), later, TIMEOUT);

        assert_eq!(table.get_mut(RequestId(1)).unwrap().deadline, start + TIMEOUT);
        assert_eq!(table.get_mut(RequestId(2)).unwrap().deadline, later + TIMEOUT);
    }

    #[test]
    fn test_find_by_trackable_key() {
        let mut table = PendingRequestTable::new();
        let now = Instant::now();
        table.insert(RequestId(3), download("att-a"), now, TIMEOUT);
        table.insert(RequestId(4), download("att-b"), now, TIMEOUT);

        assert_eq!(
            table.find(&TrackableKey::attachment_download("att-b")),
            Some(RequestId(4))
        );
        assert_eq!(table.find(&TrackableKey::attachment_download("att-c")), None);
    }

    #[test]
    fn test_remove_if_keeps_mismatched_kind() {
        let mut table = PendingRequestTable::new();
        table.insert(RequestId(1), download("att"), Instant::now(), TIMEOUT);

        let removed = table.remove_if(RequestId(1), |request| {
            matches!(request, PendingRequest::SendMessage { .. })
        });
        assert!(removed.is_none());
        assert!(table.contains(RequestId(1)));
    }

    #[test]
    fn test_serials_are_unique_across_reused_ids() {
        let mut table = PendingRequestTable::new();
        let now = Instant::now();
        let (first, _rx1) = send_message();
        let (second, _rx2) = send_message();
        let a = table.insert(RequestId(1), first, now, TIMEOUT);
        table.remove(RequestId(1));
        let b = table.insert(RequestId(1), second, now, TIMEOUT);
        assert_ne!(a, b);
    }

    #[test]
    fn test_local_failure_maps_to_typed_errors() {
        assert_eq!(
            LocalFailure::Timeout.to_error::<ChatCreateError>(),
            ChatCreateError::Timeout
        );
        assert_eq!(
            LocalFailure::ConnectionLost.to_error::<MassRetrievalError>(),
            MassRetrievalError::ConnectionLost
        );
    }
}
