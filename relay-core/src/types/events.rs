use crate::error::{AttachmentRequestError, ConnectionErrorCode, MassRetrievalError};
use crate::types::conversation::{
    ConversationItem, LocalConversation, MessageState, StickerInfo, TapbackInfo,
};
use std::path::PathBuf;

/// Connection state transitions as published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Disconnected { code: ConnectionErrorCode },
}

/// Changes to messages and conversations that UI and storage observers care about.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagingEvent {
    MessageUpdate {
        items: Vec<ConversationItem>,
    },
    ConversationUpdate {
        available: Vec<LocalConversation>,
        unavailable: Vec<LocalConversation>,
    },
    MessageState {
        message_guid: String,
        state: MessageState,
        date_read: Option<i64>,
    },
    StickerAdd(StickerInfo),
    TapbackUpdate {
        tapback: TapbackInfo,
        is_addition: bool,
    },
    AttachmentFile {
        message_local_id: i64,
        attachment_local_id: i64,
        path: PathBuf,
    },
    /// The server differs from the one the local history was last synced with.
    SyncRecommended {
        installation_id: String,
        device_name: Option<String>,
    },
}

/// Progress of a full-history download.
#[derive(Debug, Clone, PartialEq)]
pub enum MassRetrievalEvent {
    Start {
        conversations: Vec<LocalConversation>,
        message_count: u64,
    },
    Progress {
        items: Vec<ConversationItem>,
        received: u64,
        total: u64,
    },
    File {
        attachment_guid: String,
    },
    Complete,
    /// Only published on the event bus; request streams end with the error instead.
    Error(MassRetrievalError),
}

/// Progress of a single attachment download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentDownloadEvent {
    Start { length: u64 },
    Progress { written: u64, total: u64 },
    Complete { path: PathBuf },
}

/// A download event tagged with the attachment it belongs to, for bus subscribers
/// that did not issue the request themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDownloadUpdate {
    pub attachment_guid: String,
    pub update: Result<AttachmentDownloadEvent, AttachmentRequestError>,
}

/// Progress of a file upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentUploadEvent {
    Progress { sent: u64, total: u64 },
    Complete { checksum: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationEvent {
    ReconnectionsDisabled(bool),
}
