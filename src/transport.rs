use crate::actors::messages::InternalMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use relay_core::attachment::StreamTransform;
use relay_core::error::{ChatCreateError, ConnectionErrorCode, MessageSendError};
use relay_core::request::RequestId;
use relay_core::types::{
    AttachmentUploadEvent, ConnectionFeature, ConversationInfo, ConversationItem,
    ConversationTarget, MassRetrievalParams, ModifierInfo, ProxyType, ServerIdentity,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream of upload progress returned by [`ProtocolAdapter::send_file`].
pub type UploadStream = BoxStream<'static, Result<AttachmentUploadEvent, MessageSendError>>;

/// One protocol version's implementation of the relay session.
///
/// Send methods return `false` when the message could not be handed to the
/// connection. Everything the server says back arrives as [`AdapterEvent`]s
/// through the sender the adapter was created with.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Protocol version, used for display and logging.
    fn version(&self) -> u32;

    /// Starts connecting. The outcome is reported as `Open` or `Close`.
    async fn open(&self, override_value: Option<String>);

    /// Closes the connection. Must be followed by a `Close` event carrying `code`.
    async fn close(&self, code: ConnectionErrorCode);

    fn is_feature_supported(&self, feature: ConnectionFeature) -> bool;

    async fn send_ping(&self) -> bool;

    async fn send_push_token(&self, token: &str) -> bool;

    async fn send_message(&self, id: RequestId, target: &ConversationTarget, text: &str) -> bool;

    /// Uploads a file. The returned stream is driven by the upload worker.
    fn send_file(&self, id: RequestId, target: &ConversationTarget, path: &Path) -> UploadStream;

    async fn request_attachment_download(&self, id: RequestId, attachment_guid: &str) -> bool;

    async fn request_retrieval_time(&self, lower: i64, upper: i64) -> bool;

    async fn request_retrieval_id(&self, lower_id: i64) -> bool;

    async fn request_retrieval_all(&self, id: RequestId, params: &MassRetrievalParams) -> bool;

    async fn request_conversation_info(&self, conversation_guids: &[String]) -> bool;

    async fn request_chat_creation(&self, id: RequestId, members: &[String], service: &str)
    -> bool;
}

/// Creates adapters of one protocol version.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, events: AdapterEventSender, proxy_type: ProxyType) -> Arc<dyn ProtocolAdapter>;
}

/// Everything an adapter reports back to the connection manager.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Open(ServerIdentity),
    Close(ConnectionErrorCode),
    /// Any traffic was received.
    Packet,
    MessageUpdate(Vec<ConversationItem>),
    MassRetrievalStart {
        request_id: RequestId,
        conversations: Vec<ConversationInfo>,
        message_count: u64,
    },
    MassRetrievalUpdate {
        request_id: RequestId,
        response_index: i32,
        items: Vec<ConversationItem>,
    },
    MassRetrievalComplete {
        request_id: RequestId,
    },
    MassRetrievalFail {
        request_id: RequestId,
    },
    MassRetrievalFileStart {
        request_id: RequestId,
        attachment_guid: String,
        file_name: String,
        /// Declared size in raw bytes, when the protocol version reports one.
        length: Option<u64>,
        transform: Option<StreamTransform>,
    },
    MassRetrievalFileProgress {
        request_id: RequestId,
        response_index: i32,
        attachment_guid: String,
        data: Bytes,
    },
    MassRetrievalFileComplete {
        request_id: RequestId,
        attachment_guid: String,
    },
    ConversationUpdate(Vec<ConversationInfo>),
    ModifierUpdate(Vec<ModifierInfo>),
    FileRequestStart {
        request_id: RequestId,
        length: u64,
        transform: Option<StreamTransform>,
    },
    FileRequestData {
        request_id: RequestId,
        response_index: i32,
        data: Bytes,
    },
    FileRequestComplete {
        request_id: RequestId,
    },
    FileRequestFail {
        request_id: RequestId,
        code: i32,
    },
    /// The server's newest message ID, for ID-based catch-up.
    IdUpdate(i64),
    SendMessageSuccess {
        request_id: RequestId,
    },
    SendMessageFail {
        request_id: RequestId,
        error: MessageSendError,
    },
    CreateChatSuccess {
        request_id: RequestId,
        chat_guid: String,
    },
    CreateChatFail {
        request_id: RequestId,
        error: ChatCreateError,
    },
}

/// Handle an adapter uses to report events.
///
/// Events are tagged with the generation of the adapter that produced them,
/// so callbacks from an adapter that has since been replaced are ignored.
#[derive(Debug, Clone)]
pub struct AdapterEventSender {
    tx: mpsc::UnboundedSender<InternalMessage>,
    generation: u64,
}

impl AdapterEventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<InternalMessage>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Returns `false` once the connection manager has shut down.
    pub fn send(&self, event: AdapterEvent) -> bool {
        self.tx
            .send(InternalMessage::Adapter {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
