use serde::{Deserialize, Serialize};

/// Where an outgoing message or file goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationTarget {
    /// A conversation the server already knows by GUID.
    Existing { guid: String },
    /// A conversation that will be created on first send.
    New {
        members: Vec<String>,
        service: String,
    },
}

/// Conversation metadata as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub guid: String,
    pub available: bool,
    pub service: String,
    pub name: Option<String>,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationState {
    Ready,
    /// Created locally from an incoming message; details still to be fetched
    /// from the server.
    IncompleteServer,
    /// Created locally by the user; not yet known to the server.
    IncompleteClient,
}

/// A conversation as materialised in local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConversation {
    pub local_id: i64,
    pub guid: String,
    pub state: ConversationState,
    pub service: String,
    pub title: Option<String>,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub guid: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationItemKind {
    Message {
        sender: Option<String>,
        text: Option<String>,
        attachments: Vec<AttachmentInfo>,
    },
    GroupAction {
        agent: Option<String>,
        other: Option<String>,
        subtype: i32,
    },
    ChatRename {
        agent: Option<String>,
        title: Option<String>,
    },
}

/// One entry of a conversation's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub server_id: Option<i64>,
    pub guid: String,
    pub chat_guid: String,
    pub date: i64,
    pub kind: ConversationItemKind,
}

impl ConversationItem {
    pub fn is_message(&self) -> bool {
        matches!(self.kind, ConversationItemKind::Message { .. })
    }

    /// Messages without a sender were sent by this account.
    pub fn is_outgoing(&self) -> bool {
        matches!(self.kind, ConversationItemKind::Message { sender: None, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    Idle,
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerInfo {
    pub message_guid: String,
    pub message_index: i32,
    pub sender: Option<String>,
    pub date: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapbackInfo {
    pub message_guid: String,
    pub message_index: i32,
    pub sender: Option<String>,
    pub code: i32,
}

/// Read state and reactions attached to an existing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifierInfo {
    Activity {
        message_guid: String,
        state: MessageState,
        date_read: Option<i64>,
    },
    Sticker(StickerInfo),
    Tapback {
        tapback: TapbackInfo,
        is_addition: bool,
    },
}

/// What a full-history download should include.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MassRetrievalParams {
    /// Only messages newer than this (milliseconds since the epoch).
    pub messages_since: Option<i64>,
    pub download_attachments: bool,
    /// Only attachments newer than this (milliseconds since the epoch).
    pub attachments_since: Option<i64>,
    pub attachment_size_limit: Option<u64>,
    pub attachment_filter_whitelist: Vec<String>,
    pub attachment_filter_blacklist: Vec<String>,
    pub attachment_filter_others: bool,
}

/// Identifies an attachment to download and the local records it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRequest {
    pub message_local_id: i64,
    pub attachment_local_id: i64,
    pub attachment_guid: String,
    pub file_name: String,
}

/// An attachment the message store saw arrive with a message update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentCandidate {
    pub conversation_guid: String,
    pub outgoing: bool,
    pub request: AttachmentRequest,
}
