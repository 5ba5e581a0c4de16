use crate::store::traits::*;
use anyhow::Result;
use async_trait::async_trait;
use relay_core::types::{
    AttachmentCandidate, AttachmentRequest, ConversationInfo, ConversationItem,
    ConversationItemKind, ConversationState, LocalConversation, MessagingEvent, ModifierInfo,
    ProxyType,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default, Clone)]
struct ConnectionRecord {
    last_connection_time: Option<i64>,
    last_connection_installation_id: Option<String>,
    last_sync_installation_id: Option<String>,
    last_server_message_id: Option<i64>,
    proxy_type: ProxyType,
}

/// A simple in-memory backend, for tests and for hosts without persistent storage.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    connection: Arc<RwLock<ConnectionRecord>>,
    conversations: Arc<RwLock<HashMap<String, LocalConversation>>>,
    items: Arc<RwLock<HashMap<String, (i64, ConversationItem)>>>,
    attachment_ids: Arc<RwLock<HashMap<String, i64>>>,
    attachment_files: Arc<RwLock<HashMap<String, PathBuf>>>,
    next_local_id: Arc<AtomicI64>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxy_type(proxy_type: ProxyType) -> Self {
        Self {
            connection: Arc::new(RwLock::new(ConnectionRecord {
                proxy_type,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_local_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Adds a conversation as if it had been created locally.
    pub async fn insert_conversation(&self, conversation: LocalConversation) {
        self.conversations
            .write()
            .await
            .insert(conversation.guid.clone(), conversation);
    }

    pub async fn conversation(&self, guid: &str) -> Option<LocalConversation> {
        self.conversations.read().await.get(guid).cloned()
    }

    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn attachment_file(&self, attachment_guid: &str) -> Option<PathBuf> {
        self.attachment_files
            .read()
            .await
            .get(attachment_guid)
            .cloned()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryBackend {
    async fn last_connection_time(&self) -> Result<Option<i64>> {
        Ok(self.connection.read().await.last_connection_time)
    }

    async fn set_last_connection_time(&self, time: i64) -> Result<()> {
        self.connection.write().await.last_connection_time = Some(time);
        Ok(())
    }

    async fn last_connection_installation_id(&self) -> Result<Option<String>> {
        Ok(self
            .connection
            .read()
            .await
            .last_connection_installation_id
            .clone())
    }

    async fn set_last_connection_installation_id(&self, id: &str) -> Result<()> {
        self.connection.write().await.last_connection_installation_id = Some(id.to_string());
        Ok(())
    }

    async fn last_sync_installation_id(&self) -> Result<Option<String>> {
        Ok(self.connection.read().await.last_sync_installation_id.clone())
    }

    async fn set_last_sync_installation_id(&self, id: &str) -> Result<()> {
        self.connection.write().await.last_sync_installation_id = Some(id.to_string());
        Ok(())
    }

    async fn last_server_message_id(&self) -> Result<Option<i64>> {
        Ok(self.connection.read().await.last_server_message_id)
    }

    async fn set_last_server_message_id(&self, id: i64) -> Result<()> {
        self.connection.write().await.last_server_message_id = Some(id);
        Ok(())
    }

    async fn clear_last_server_message_id(&self) -> Result<()> {
        self.connection.write().await.last_server_message_id = None;
        Ok(())
    }

    async fn proxy_type(&self) -> Result<ProxyType> {
        Ok(self.connection.read().await.proxy_type)
    }
}

#[async_trait]
impl MessageStore for InMemoryBackend {
    async fn save_message_update(&self, items: &[ConversationItem]) -> Result<MessageUpdateOutcome> {
        let mut outcome = MessageUpdateOutcome::default();
        let mut conversations = self.conversations.write().await;
        let mut stored = self.items.write().await;
        let mut attachment_ids = self.attachment_ids.write().await;
        let mut added = Vec::new();

        for item in items {
            if stored.contains_key(&item.guid) {
                continue;
            }

            match conversations.get(&item.chat_guid) {
                None => {
                    let conversation = LocalConversation {
                        local_id: self.allocate_id(),
                        guid: item.chat_guid.clone(),
                        state: ConversationState::IncompleteServer,
                        service: String::new(),
                        title: None,
                        members: Vec::new(),
                    };
                    outcome.incomplete_conversations.push(conversation.clone());
                    conversations.insert(item.chat_guid.clone(), conversation);
                }
                Some(existing)
                    if existing.state != ConversationState::Ready
                        && !outcome
                            .incomplete_conversations
                            .iter()
                            .any(|reported| reported.guid == existing.guid) =>
                {
                    outcome.incomplete_conversations.push(existing.clone());
                }
                Some(_) => {}
            }

            let message_local_id = self.allocate_id();
            if let ConversationItemKind::Message { attachments, .. } = &item.kind {
                for attachment in attachments {
                    let attachment_local_id = self.allocate_id();
                    attachment_ids.insert(attachment.guid.clone(), attachment_local_id);
                    outcome.attachments.push(AttachmentCandidate {
                        conversation_guid: item.chat_guid.clone(),
                        outgoing: item.is_outgoing(),
                        request: AttachmentRequest {
                            message_local_id,
                            attachment_local_id,
                            attachment_guid: attachment.guid.clone(),
                            file_name: attachment.name.clone(),
                        },
                    });
                }
            }

            stored.insert(item.guid.clone(), (message_local_id, item.clone()));
            added.push(item.clone());
        }

        if !added.is_empty() {
            outcome
                .events
                .push(MessagingEvent::MessageUpdate { items: added });
        }
        Ok(outcome)
    }

    async fn save_conversation_update(
        &self,
        available: &[ConversationInfo],
        unavailable: &[String],
    ) -> Result<Vec<MessagingEvent>> {
        let mut conversations = self.conversations.write().await;
        let mut updated = Vec::new();
        let mut removed = Vec::new();

        for info in available {
            if let Some(conversation) = conversations.get_mut(&info.guid) {
                conversation.state = ConversationState::Ready;
                conversation.service = info.service.clone();
                conversation.title = info.name.clone();
                conversation.members = info.members.clone();
                updated.push(conversation.clone());
            }
        }
        for guid in unavailable {
            if let Some(conversation) = conversations.remove(guid) {
                removed.push(conversation);
            }
        }

        if updated.is_empty() && removed.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![MessagingEvent::ConversationUpdate {
            available: updated,
            unavailable: removed,
        }])
    }

    async fn save_modifiers(&self, modifiers: &[ModifierInfo]) -> Result<Vec<MessagingEvent>> {
        Ok(modifiers
            .iter()
            .cloned()
            .map(|modifier| match modifier {
                ModifierInfo::Activity {
                    message_guid,
                    state,
                    date_read,
                } => MessagingEvent::MessageState {
                    message_guid,
                    state,
                    date_read,
                },
                ModifierInfo::Sticker(sticker) => MessagingEvent::StickerAdd(sticker),
                ModifierInfo::Tapback {
                    tapback,
                    is_addition,
                } => MessagingEvent::TapbackUpdate {
                    tapback,
                    is_addition,
                },
            })
            .collect())
    }

    async fn save_mass_retrieval_conversations(
        &self,
        infos: &[ConversationInfo],
    ) -> Result<Vec<LocalConversation>> {
        let mut conversations = self.conversations.write().await;
        conversations.clear();
        self.items.write().await.clear();

        let mut saved = Vec::with_capacity(infos.len());
        for info in infos {
            let conversation = LocalConversation {
                local_id: self.allocate_id(),
                guid: info.guid.clone(),
                state: ConversationState::Ready,
                service: info.service.clone(),
                title: info.name.clone(),
                members: info.members.clone(),
            };
            conversations.insert(info.guid.clone(), conversation.clone());
            saved.push(conversation);
        }
        Ok(saved)
    }

    async fn save_mass_retrieval_items(
        &self,
        items: &[ConversationItem],
    ) -> Result<Vec<ConversationItem>> {
        let conversations = self.conversations.read().await;
        let mut stored = self.items.write().await;
        let mut saved = Vec::new();
        for item in items {
            // Items of conversations the retrieval did not announce are dropped.
            if !conversations.contains_key(&item.chat_guid) {
                continue;
            }
            stored.insert(item.guid.clone(), (self.allocate_id(), item.clone()));
            saved.push(item.clone());
        }
        Ok(saved)
    }

    async fn save_attachment_file(&self, attachment_guid: &str, path: &Path) -> Result<()> {
        self.attachment_files
            .write()
            .await
            .insert(attachment_guid.to_string(), path.to_path_buf());
        Ok(())
    }
}
