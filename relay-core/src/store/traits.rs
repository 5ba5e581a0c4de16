use crate::types::{
    AttachmentCandidate, ConversationInfo, ConversationItem, LocalConversation, MessagingEvent,
    ModifierInfo, ProxyType,
};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Connection bookkeeping persisted across process restarts.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Milliseconds since the epoch of the last observed server traffic.
    async fn last_connection_time(&self) -> Result<Option<i64>>;
    async fn set_last_connection_time(&self, time: i64) -> Result<()>;

    /// Installation ID of the server seen on the previous handshake.
    async fn last_connection_installation_id(&self) -> Result<Option<String>>;
    async fn set_last_connection_installation_id(&self, id: &str) -> Result<()>;

    /// Installation ID of the server the local history was last synced with.
    async fn last_sync_installation_id(&self) -> Result<Option<String>>;
    async fn set_last_sync_installation_id(&self, id: &str) -> Result<()>;

    async fn last_server_message_id(&self) -> Result<Option<i64>>;
    async fn set_last_server_message_id(&self, id: i64) -> Result<()>;
    async fn clear_last_server_message_id(&self) -> Result<()>;

    async fn proxy_type(&self) -> Result<ProxyType>;
}

/// What the message store did with an incoming batch.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdateOutcome {
    /// Events to publish on the messaging channel.
    pub events: Vec<MessagingEvent>,
    /// Conversations created locally from the batch whose details must still be
    /// fetched from the server.
    pub incomplete_conversations: Vec<LocalConversation>,
    /// Attachments the batch introduced, in arrival order.
    pub attachments: Vec<AttachmentCandidate>,
}

/// The narrow slice of message persistence the connection layer writes to.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message_update(&self, items: &[ConversationItem]) -> Result<MessageUpdateOutcome>;

    /// Applies server details to conversations that were incomplete.
    async fn save_conversation_update(
        &self,
        available: &[ConversationInfo],
        unavailable: &[String],
    ) -> Result<Vec<MessagingEvent>>;

    async fn save_modifiers(&self, modifiers: &[ModifierInfo]) -> Result<Vec<MessagingEvent>>;

    /// Replaces local conversations with the set reported by a mass retrieval.
    async fn save_mass_retrieval_conversations(
        &self,
        conversations: &[ConversationInfo],
    ) -> Result<Vec<LocalConversation>>;

    /// Stores a batch of a mass retrieval and returns the items as persisted.
    async fn save_mass_retrieval_items(
        &self,
        items: &[ConversationItem],
    ) -> Result<Vec<ConversationItem>>;

    async fn save_attachment_file(&self, attachment_guid: &str, path: &Path) -> Result<()>;
}

/// Everything the connection manager needs from persistence.
pub trait Backend: ConnectionStore + MessageStore {}

impl<T> Backend for T where T: ConnectionStore + MessageStore {}

/// Reports which conversations are currently on screen, so their incoming
/// attachments are fetched without waiting for the user.
pub trait ForegroundQuery: Send + Sync {
    fn visible_conversations(&self) -> Vec<String>;

    fn is_visible(&self, conversation_guid: &str) -> bool {
        self.visible_conversations()
            .iter()
            .any(|guid| guid == conversation_guid)
    }
}

impl<F> ForegroundQuery for F
where
    F: Fn() -> Vec<String> + Send + Sync,
{
    fn visible_conversations(&self) -> Vec<String> {
        self()
    }
}
