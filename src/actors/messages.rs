use crate::stream::StreamSender;
use crate::transport::AdapterEvent;
use relay_core::error::{
    AttachmentRequestError, ChatCreateError, ConnectionErrorCode, MassRetrievalError,
    MessageSendError,
};
use relay_core::reconnect::ReconnectionState;
use relay_core::request::{RequestId, TrackableKey};
use relay_core::types::{
    AttachmentDownloadEvent, AttachmentRequest, AttachmentUploadEvent, ConnectionOverride,
    ConnectionState, ConversationTarget, MassRetrievalEvent, MassRetrievalParams, ServerIdentity,
};
use std::path::PathBuf;
use tokio::sync::oneshot;

// --- Commands from RelayClient handles ---
#[derive(Debug)]
pub(crate) enum ManagerCommand {
    Connect,
    ConnectSilently,
    Disconnect(ConnectionErrorCode),
    SetDisableReconnections(bool),
    SetConnectionOverride(Option<ConnectionOverride>),
    TestConnection,
    SendPushToken {
        token: String,
        reply: oneshot::Sender<bool>,
    },
    SendMessage {
        target: ConversationTarget,
        text: String,
        reply: oneshot::Sender<Result<(), MessageSendError>>,
    },
    SendFile {
        target: ConversationTarget,
        path: PathBuf,
        events: StreamSender<AttachmentUploadEvent, MessageSendError>,
    },
    FetchAttachment {
        request: AttachmentRequest,
        events: StreamSender<AttachmentDownloadEvent, AttachmentRequestError>,
    },
    CreateChat {
        members: Vec<String>,
        service: String,
        reply: oneshot::Sender<Result<String, ChatCreateError>>,
    },
    FetchMassConversationData {
        params: MassRetrievalParams,
        events: StreamSender<MassRetrievalEvent, MassRetrievalError>,
    },
    RequestMessagesTimeRange {
        lower: i64,
        upper: i64,
    },
    RequestMessagesIdRange {
        lower_id: i64,
    },
    FetchPendingConversations,
    ClearPendingSync,
    FindRequest {
        key: TrackableKey,
        reply: oneshot::Sender<Option<RequestId>>,
    },
    Snapshot {
        reply: oneshot::Sender<ManagerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// --- Messages produced inside the client (adapters, upload worker) ---
#[derive(Debug)]
pub(crate) enum InternalMessage {
    Adapter {
        generation: u64,
        event: AdapterEvent,
    },
    UploadProgress {
        request_id: RequestId,
        serial: u64,
        update: Result<AttachmentUploadEvent, MessageSendError>,
    },
}

/// Point-in-time view of the connection manager's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSnapshot {
    pub state: ConnectionState,
    pub communications_version: Option<u32>,
    pub server_identity: Option<ServerIdentity>,
    pub mass_retrieval_in_progress: bool,
    pub pending_sync: bool,
    pub pending_requests: usize,
    pub reconnection: ReconnectionState,
    pub reconnections_disabled: bool,
}
