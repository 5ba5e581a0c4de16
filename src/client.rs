use crate::actors::connection_manager::{ConnectionManager, ManagerContext};
use crate::actors::messages::{ManagerCommand, ManagerSnapshot};
use crate::config::{ClientConfig, ConfigError};
use crate::download::FsAttachmentStorage;
use crate::stream::RequestStream;
use crate::transport::AdapterFactory;
use crate::types::events::EventBus;
use log::{debug, info};
use relay_core::attachment::AttachmentStorage;
use relay_core::error::{
    AttachmentRequestError, ChatCreateError, ConnectionErrorCode, MassRetrievalError,
    MessageSendError,
};
use relay_core::request::{RequestId, TrackableKey};
use relay_core::store::{Backend, ForegroundQuery};
use relay_core::types::{
    AttachmentDownloadEvent, AttachmentRequest, AttachmentUploadEvent, ConnectionOverride,
    ConnectionState, ConversationTarget, MassRetrievalEvent, MassRetrievalParams, ServerIdentity,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

pub type UploadEvents = RequestStream<AttachmentUploadEvent, MessageSendError>;
pub type DownloadEvents = RequestStream<AttachmentDownloadEvent, AttachmentRequestError>;
pub type MassRetrievalEvents = RequestStream<MassRetrievalEvent, MassRetrievalError>;

/// Handle to a running connection manager.
///
/// Cheap to clone; every clone talks to the same session. The manager stops
/// when [`shutdown`](Self::shutdown) is called or the last handle is dropped.
#[derive(Clone, Debug)]
pub struct RelayClient {
    commands: mpsc::UnboundedSender<ManagerCommand>,
    state: watch::Receiver<ConnectionState>,
    event_bus: Arc<EventBus>,
}

impl RelayClient {
    /// Starts a connection manager that stores attachments under
    /// `config.attachment_dir`. Must be called from within a tokio runtime.
    ///
    /// `factories` is the protocol priority list, newest version first.
    pub fn spawn(
        config: ClientConfig,
        factories: Vec<Arc<dyn AdapterFactory>>,
        backend: Arc<dyn Backend>,
        foreground: Arc<dyn ForegroundQuery>,
    ) -> Result<Self, ConfigError> {
        let storage = Arc::new(FsAttachmentStorage::new(config.attachment_dir.clone())?);
        Self::spawn_with_storage(config, factories, backend, storage, foreground)
    }

    pub fn spawn_with_storage(
        config: ClientConfig,
        factories: Vec<Arc<dyn AdapterFactory>>,
        backend: Arc<dyn Backend>,
        storage: Arc<dyn AttachmentStorage>,
        foreground: Arc<dyn ForegroundQuery>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if factories.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one protocol adapter is required",
            ));
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let event_bus = Arc::new(EventBus::new());

        info!(
            target: "Relay/Client",
            "Starting connection manager with {} protocol versions",
            factories.len()
        );
        let manager = ConnectionManager::new(
            ManagerContext {
                config,
                factories,
                backend,
                storage,
                foreground,
                event_bus: event_bus.clone(),
                state_tx,
            },
            command_rx,
        );
        tokio::spawn(manager.run());

        Ok(Self {
            commands,
            state,
            event_bus,
        })
    }

    fn send_command(&self, command: ManagerCommand) -> bool {
        if self.commands.send(command).is_err() {
            debug!(target: "Relay/Client", "Connection manager has stopped");
            return false;
        }
        true
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Connects using the newest protocol version. Does nothing while a
    /// connection exists or is being made; promotes a background attempt.
    pub fn connect(&self) {
        self.send_command(ManagerCommand::Connect);
    }

    /// Starts a background attempt that leaves the observable state alone
    /// unless it succeeds.
    pub fn connect_silently(&self) {
        self.send_command(ManagerCommand::ConnectSilently);
    }

    /// Closes the connection with `code`. Only acts while connected.
    pub fn disconnect(&self, code: ConnectionErrorCode) {
        self.send_command(ManagerCommand::Disconnect(code));
    }

    pub fn set_disable_reconnections(&self, disabled: bool) {
        self.send_command(ManagerCommand::SetDisableReconnections(disabled));
    }

    /// Replaces the stored proxy type and address for future attempts.
    pub fn set_connection_override(&self, connection_override: Option<ConnectionOverride>) {
        self.send_command(ManagerCommand::SetConnectionOverride(connection_override));
    }

    /// Sends a ping now and arms the ping expiry.
    pub fn test_connection(&self) {
        self.send_command(ManagerCommand::TestConnection);
    }

    pub async fn send_push_token(&self, token: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        if !self.send_command(ManagerCommand::SendPushToken {
            token: token.into(),
            reply,
        }) {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn send_message(
        &self,
        target: ConversationTarget,
        text: impl Into<String>,
    ) -> Result<(), MessageSendError> {
        if !self.is_connected() {
            return Err(MessageSendError::Network);
        }
        let (reply, rx) = oneshot::channel();
        if !self.send_command(ManagerCommand::SendMessage {
            target,
            text: text.into(),
            reply,
        }) {
            return Err(MessageSendError::ConnectionLost);
        }
        rx.await.unwrap_or(Err(MessageSendError::ConnectionLost))
    }

    /// Uploads a file. The stream ends once the server confirms the message.
    pub fn send_file(&self, target: ConversationTarget, path: impl Into<PathBuf>) -> UploadEvents {
        if !self.is_connected() {
            return RequestStream::failed(MessageSendError::Network);
        }
        let (events, stream) = RequestStream::channel();
        if !self.send_command(ManagerCommand::SendFile {
            target,
            path: path.into(),
            events,
        }) {
            return RequestStream::failed(MessageSendError::ConnectionLost);
        }
        stream
    }

    /// Downloads an attachment. A second call for an attachment that is
    /// already downloading joins the running request.
    pub fn fetch_attachment(&self, request: AttachmentRequest) -> DownloadEvents {
        if !self.is_connected() {
            return RequestStream::failed(AttachmentRequestError::Network);
        }
        let (events, stream) = RequestStream::channel();
        if !self.send_command(ManagerCommand::FetchAttachment { request, events }) {
            return RequestStream::failed(AttachmentRequestError::ConnectionLost);
        }
        stream
    }

    pub async fn create_chat(
        &self,
        members: Vec<String>,
        service: impl Into<String>,
    ) -> Result<String, ChatCreateError> {
        if !self.is_connected() {
            return Err(ChatCreateError::Network);
        }
        let (reply, rx) = oneshot::channel();
        if !self.send_command(ManagerCommand::CreateChat {
            members,
            service: service.into(),
            reply,
        }) {
            return Err(ChatCreateError::ConnectionLost);
        }
        rx.await.unwrap_or(Err(ChatCreateError::ConnectionLost))
    }

    /// Downloads the full message history. Only one may run at a time.
    pub fn fetch_mass_conversation_data(&self, params: MassRetrievalParams) -> MassRetrievalEvents {
        let (events, stream) = RequestStream::channel();
        if !self.send_command(ManagerCommand::FetchMassConversationData { params, events }) {
            return RequestStream::failed(MassRetrievalError::ConnectionLost);
        }
        stream
    }

    /// Asks for messages sent between two times, in milliseconds since the epoch.
    pub fn request_messages_time_range(&self, lower: i64, upper: i64) {
        self.send_command(ManagerCommand::RequestMessagesTimeRange { lower, upper });
    }

    /// Asks for messages newer than the given server message ID.
    pub fn request_messages_id_range(&self, lower_id: i64) {
        self.send_command(ManagerCommand::RequestMessagesIdRange { lower_id });
    }

    pub fn fetch_pending_conversations(&self) {
        self.send_command(ManagerCommand::FetchPendingConversations);
    }

    pub fn clear_pending_sync(&self) {
        self.send_command(ManagerCommand::ClearPendingSync);
    }

    /// Looks up an in-flight request by what it does rather than by its ID.
    pub async fn find_request(&self, key: TrackableKey) -> Option<RequestId> {
        let (reply, rx) = oneshot::channel();
        if !self.send_command(ManagerCommand::FindRequest { key, reply }) {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Returns `None` once the manager has stopped.
    pub async fn snapshot(&self) -> Option<ManagerSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send_command(ManagerCommand::Snapshot { reply }) {
            return None;
        }
        rx.await.ok()
    }

    /// Protocol version of the active connection.
    pub async fn communications_version(&self) -> Option<u32> {
        self.snapshot()
            .await
            .and_then(|snapshot| snapshot.communications_version)
    }

    /// Identity reported by the most recent handshake.
    pub async fn server_identity(&self) -> Option<ServerIdentity> {
        self.snapshot()
            .await
            .and_then(|snapshot| snapshot.server_identity)
    }

    pub async fn is_mass_retrieval_in_progress(&self) -> bool {
        self.snapshot()
            .await
            .is_some_and(|snapshot| snapshot.mass_retrieval_in_progress)
    }

    pub async fn is_pending_sync(&self) -> bool {
        self.snapshot()
            .await
            .is_some_and(|snapshot| snapshot.pending_sync)
    }

    pub async fn pending_request_count(&self) -> usize {
        self.snapshot()
            .await
            .map_or(0, |snapshot| snapshot.pending_requests)
    }

    /// Fails every pending request and stops the manager.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send_command(ManagerCommand::Shutdown { reply }) {
            let _ = rx.await;
        }
    }
}
