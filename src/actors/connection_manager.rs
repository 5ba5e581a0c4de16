use super::messages::{InternalMessage, ManagerCommand, ManagerSnapshot};
use crate::config::ClientConfig;
use crate::keepalive::{LivenessAction, LivenessTimers};
use crate::request::{LocalFailure, PendingEntry, PendingRequest, PendingRequestTable};
use crate::stream::StreamSender;
use crate::transport::{AdapterEvent, AdapterEventSender, AdapterFactory, ProtocolAdapter};
use crate::types::events::EventBus;
use crate::upload::{UploadJob, spawn_upload_worker};
use bytes::Bytes;
use log::{debug, error, info, warn};
use relay_core::attachment::{AttachmentStorage, StreamTransform};
use relay_core::error::{
    AttachmentRequestError, ChatCreateError, ConnectionErrorCode, MassRetrievalError,
    MessageSendError,
};
use relay_core::file_fetch::FileFetchAggregator;
use relay_core::identity::{IdentityComparison, compare_identity};
use relay_core::mass_retrieval::MassRetrievalAggregator;
use relay_core::reconnect::{ReconnectionPolicy, ReconnectionState};
use relay_core::request::{RequestId, RequestIdAllocator, TrackableKey};
use relay_core::store::{Backend, ForegroundQuery};
use relay_core::types::{
    AttachmentDownloadEvent, AttachmentDownloadUpdate, AttachmentRequest, AttachmentUploadEvent,
    ConfigurationEvent, ConnectionEvent, ConnectionFeature, ConnectionOverride, ConnectionState,
    ConversationInfo, ConversationItem, ConversationState, ConversationTarget, LocalConversation,
    MassRetrievalEvent, MassRetrievalParams, MessagingEvent, ModifierInfo, ProxyType,
    ServerIdentity,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Collaborators handed to the connection manager when the client is spawned.
pub(crate) struct ManagerContext {
    pub config: ClientConfig,
    pub factories: Vec<Arc<dyn AdapterFactory>>,
    pub backend: Arc<dyn Backend>,
    pub storage: Arc<dyn AttachmentStorage>,
    pub foreground: Arc<dyn ForegroundQuery>,
    pub event_bus: Arc<EventBus>,
    pub state_tx: watch::Sender<ConnectionState>,
}

/// Owns the session: the active adapter, the state machine, reconnection and
/// liveness timers, and every in-flight request.
///
/// All of it is touched only from [`run`](Self::run), so adapter callbacks,
/// caller commands and timer expiries are handled strictly one at a time.
pub(crate) struct ConnectionManager {
    config: ClientConfig,
    factories: Vec<Arc<dyn AdapterFactory>>,
    backend: Arc<dyn Backend>,
    storage: Arc<dyn AttachmentStorage>,
    foreground: Arc<dyn ForegroundQuery>,
    event_bus: Arc<EventBus>,
    state_tx: watch::Sender<ConnectionState>,

    commands: mpsc::UnboundedReceiver<ManagerCommand>,
    internal_rx: mpsc::UnboundedReceiver<InternalMessage>,
    internal_tx: mpsc::UnboundedSender<InternalMessage>,
    uploads: mpsc::UnboundedSender<UploadJob>,

    adapter: Option<Arc<dyn ProtocolAdapter>>,
    adapter_index: usize,
    generation: u64,
    state: ConnectionState,
    is_connecting: bool,
    is_connecting_silently: bool,
    connection_established: bool,
    disable_reconnections: bool,
    connection_override: Option<ConnectionOverride>,
    server_identity: Option<ServerIdentity>,

    reconnect: ReconnectionPolicy,
    reconnect_at: Option<Instant>,
    liveness: LivenessTimers,

    pending: PendingRequestTable,
    request_ids: RequestIdAllocator,
    pending_conversations: HashMap<String, LocalConversation>,
    mass_retrieval_in_progress: bool,
    is_pending_sync: bool,
}

// Store failures never take the session down; they are logged and the
// operation continues with the type's default.
fn stored<T: Default>(result: anyhow::Result<T>, what: &str) -> T {
    result.unwrap_or_else(|e| {
        warn!(target: "Relay/Connection", "Failed to {what}: {e:?}");
        T::default()
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ConnectionManager {
    pub(crate) fn new(
        context: ManagerContext,
        commands: mpsc::UnboundedReceiver<ManagerCommand>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let uploads = spawn_upload_worker(internal_tx.clone());
        let config = context.config;

        let reconnect = ReconnectionPolicy::new(
            config.immediate_reconnect_delays.clone(),
            config.reconnect_jitter,
            config.passive_reconnect_interval,
        );
        let liveness = LivenessTimers::new(
            config.keepalive_interval,
            config.keepalive_window,
            config.ping_expiry,
        );

        Self {
            config,
            factories: context.factories,
            backend: context.backend,
            storage: context.storage,
            foreground: context.foreground,
            event_bus: context.event_bus,
            state_tx: context.state_tx,
            commands,
            internal_rx,
            internal_tx,
            uploads,
            adapter: None,
            adapter_index: 0,
            generation: 0,
            state: ConnectionState::Disconnected,
            is_connecting: false,
            is_connecting_silently: false,
            connection_established: false,
            disable_reconnections: false,
            connection_override: None,
            server_identity: None,
            reconnect,
            reconnect_at: None,
            liveness,
            pending: PendingRequestTable::new(),
            request_ids: RequestIdAllocator::new(),
            pending_conversations: HashMap::new(),
            mass_retrieval_in_progress: false,
            is_pending_sync: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(target: "Relay/Connection", "Connection manager started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                Some(message) = self.internal_rx.recv() => {
                    self.handle_internal(message).await;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!(target: "Relay/Connection", "All client handles dropped");
                        self.shutdown();
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    self.handle_deadlines().await;
                }
            }
        }
        info!(target: "Relay/Connection", "Connection manager stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.pending.next_deadline(),
            self.reconnect_at,
            self.liveness.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Returns `false` once the manager should stop.
    async fn handle_command(&mut self, command: ManagerCommand) -> bool {
        match command {
            ManagerCommand::Connect => self.connect().await,
            ManagerCommand::ConnectSilently => self.connect_silently().await,
            ManagerCommand::Disconnect(code) => self.disconnect(code).await,
            ManagerCommand::SetDisableReconnections(disabled) => {
                self.set_disable_reconnections(disabled)
            }
            ManagerCommand::SetConnectionOverride(connection_override) => {
                debug!(target: "Relay/Connection", "Connection override set to {connection_override:?}");
                self.connection_override = connection_override;
            }
            ManagerCommand::TestConnection => self.test_connection().await,
            ManagerCommand::SendPushToken { token, reply } => {
                let sent = self.send_push_token(&token).await;
                let _ = reply.send(sent);
            }
            ManagerCommand::SendMessage {
                target,
                text,
                reply,
            } => self.send_message(target, text, reply).await,
            ManagerCommand::SendFile {
                target,
                path,
                events,
            } => self.send_file(target, path, events),
            ManagerCommand::FetchAttachment { request, events } => {
                if self.connected_adapter().is_none() {
                    let _ = events.send(Err(AttachmentRequestError::Network));
                } else {
                    self.start_download(request, Some(events)).await;
                }
            }
            ManagerCommand::CreateChat {
                members,
                service,
                reply,
            } => self.create_chat(members, service, reply).await,
            ManagerCommand::FetchMassConversationData { params, events } => {
                self.fetch_mass_conversation_data(params, events).await
            }
            ManagerCommand::RequestMessagesTimeRange { lower, upper } => {
                self.request_messages_time_range(lower, upper).await
            }
            ManagerCommand::RequestMessagesIdRange { lower_id } => {
                self.request_messages_id_range(lower_id).await
            }
            ManagerCommand::FetchPendingConversations => self.fetch_pending_conversations().await,
            ManagerCommand::ClearPendingSync => self.is_pending_sync = false,
            ManagerCommand::FindRequest { key, reply } => {
                let _ = reply.send(self.pending.find(&key));
            }
            ManagerCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ManagerCommand::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_internal(&mut self, message: InternalMessage) {
        match message {
            InternalMessage::Adapter { generation, event } => {
                if generation != self.generation || self.adapter.is_none() {
                    debug!(
                        target: "Relay/Connection",
                        "Dropping event from retired adapter (generation {generation}, current {})",
                        self.generation
                    );
                    return;
                }
                self.handle_adapter_event(event).await;
            }
            InternalMessage::UploadProgress {
                request_id,
                serial,
                update,
            } => self.on_upload_progress(request_id, serial, update),
        }
    }

    async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Open(identity) => self.on_open(identity).await,
            AdapterEvent::Close(code) => self.on_close(code).await,
            AdapterEvent::Packet => self.on_packet().await,
            AdapterEvent::MessageUpdate(items) => self.on_message_update(items).await,
            AdapterEvent::MassRetrievalStart {
                request_id,
                conversations,
                message_count,
            } => {
                self.on_mass_retrieval_start(request_id, conversations, message_count)
                    .await
            }
            AdapterEvent::MassRetrievalUpdate {
                request_id,
                response_index,
                items,
            } => {
                self.on_mass_retrieval_update(request_id, response_index, items)
                    .await
            }
            AdapterEvent::MassRetrievalComplete { request_id } => {
                self.on_mass_retrieval_complete(request_id).await
            }
            AdapterEvent::MassRetrievalFail { request_id } => {
                self.fail_mass_retrieval(request_id, MassRetrievalError::BadResponse)
            }
            AdapterEvent::MassRetrievalFileStart {
                request_id,
                attachment_guid,
                file_name,
                length,
                transform,
            } => self.on_mass_retrieval_file_start(
                request_id,
                &attachment_guid,
                &file_name,
                length,
                transform,
            ),
            AdapterEvent::MassRetrievalFileProgress {
                request_id,
                response_index,
                attachment_guid,
                data,
            } => self.on_mass_retrieval_file_progress(
                request_id,
                response_index,
                &attachment_guid,
                data,
            ),
            AdapterEvent::MassRetrievalFileComplete {
                request_id,
                attachment_guid,
            } => {
                self.on_mass_retrieval_file_complete(request_id, attachment_guid)
                    .await
            }
            AdapterEvent::ConversationUpdate(conversations) => {
                self.on_conversation_update(conversations).await
            }
            AdapterEvent::ModifierUpdate(modifiers) => self.on_modifier_update(modifiers).await,
            AdapterEvent::FileRequestStart {
                request_id,
                length,
                transform,
            } => self.on_file_request_start(request_id, length, transform),
            AdapterEvent::FileRequestData {
                request_id,
                response_index,
                data,
            } => self.on_file_request_data(request_id, response_index, data),
            AdapterEvent::FileRequestComplete { request_id } => {
                self.on_file_request_complete(request_id).await
            }
            AdapterEvent::FileRequestFail { request_id, code } => self.fail_download(
                request_id,
                AttachmentRequestError::Remote {
                    code,
                    details: None,
                },
            ),
            AdapterEvent::IdUpdate(id) => stored(
                self.backend.set_last_server_message_id(id).await,
                "store last server message ID",
            ),
            AdapterEvent::SendMessageSuccess { request_id } => {
                self.on_send_message_result(request_id, Ok(()))
            }
            AdapterEvent::SendMessageFail { request_id, error } => {
                self.on_send_message_result(request_id, Err(error))
            }
            AdapterEvent::CreateChatSuccess {
                request_id,
                chat_guid,
            } => self.on_create_chat_result(request_id, Ok(chat_guid)),
            AdapterEvent::CreateChatFail { request_id, error } => {
                self.on_create_chat_result(request_id, Err(error))
            }
        }
    }

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();

        for (id, entry) in self.pending.take_expired(now) {
            warn!(target: "Relay/Request", "Request {id} timed out");
            self.fail_entry(id, entry, LocalFailure::Timeout);
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.fire_reconnect(now).await;
        }

        match self.liveness.poll(now) {
            Some(LivenessAction::Ping) => self.test_connection().await,
            Some(LivenessAction::Expired) => {
                warn!(target: "Relay/Connection", "Ping went unanswered, dropping connection");
                self.disconnect(ConnectionErrorCode::Connection).await;
            }
            None => {}
        }
    }

    // --- State machine ---

    fn update_state(&mut self, event: ConnectionEvent) {
        let state = match event {
            ConnectionEvent::Connecting => ConnectionState::Connecting,
            ConnectionEvent::Connected => ConnectionState::Connected,
            ConnectionEvent::Disconnected { .. } => ConnectionState::Disconnected,
        };
        self.state = state;
        self.state_tx.send_replace(state);
        self.event_bus.publish_connection(event);
    }

    fn connected_adapter(&self) -> Option<Arc<dyn ProtocolAdapter>> {
        if self.state == ConnectionState::Connected {
            self.adapter.clone()
        } else {
            None
        }
    }

    async fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        if self.is_connecting {
            if self.is_connecting_silently {
                info!(target: "Relay/Connection", "Promoting background connection attempt");
                self.is_connecting_silently = false;
                self.update_state(ConnectionEvent::Connecting);
            }
            return;
        }

        self.update_state(ConnectionEvent::Connecting);
        self.is_connecting = true;
        self.connect_from_list(0).await;
    }

    async fn connect_silently(&mut self) {
        // A running ladder already owns the next attempt.
        if self.is_connecting || self.state != ConnectionState::Disconnected {
            return;
        }
        debug!(target: "Relay/Connection", "Starting background connection attempt");
        self.is_connecting_silently = true;
        self.is_connecting = true;
        self.connect_from_list(0).await;
    }

    async fn connect_from_list(&mut self, index: usize) {
        let Some(factory) = self.factories.get(index).cloned() else {
            error!(target: "Relay/Connection", "No protocol adapter at priority {index}");
            self.is_connecting = false;
            return;
        };
        self.adapter_index = index;
        self.generation += 1;

        let proxy_type = match &self.connection_override {
            Some(connection_override) => connection_override.proxy_type,
            None => self.backend.proxy_type().await.unwrap_or_else(|e| {
                warn!(target: "Relay/Connection", "Failed to read proxy type, using default: {e:?}");
                ProxyType::default()
            }),
        };
        let override_value = self
            .connection_override
            .as_ref()
            .and_then(|connection_override| connection_override.value.clone());

        let events = AdapterEventSender::new(self.internal_tx.clone(), self.generation);
        let adapter = factory.create(events, proxy_type);
        info!(
            target: "Relay/Connection",
            "Connecting with protocol version {} ({proxy_type:?})",
            adapter.version()
        );
        self.adapter = Some(adapter.clone());
        adapter.open(override_value).await;
    }

    async fn disconnect(&mut self, code: ConnectionErrorCode) {
        if let Some(adapter) = self.connected_adapter() {
            info!(target: "Relay/Connection", "Disconnecting ({code})");
            adapter.close(code).await;
        }
    }

    fn set_disable_reconnections(&mut self, disabled: bool) {
        self.disable_reconnections = disabled;
        if disabled && self.reconnect.is_passive() {
            self.reconnect.reset();
            self.reconnect_at = None;
        }
        self.event_bus
            .publish_configuration(ConfigurationEvent::ReconnectionsDisabled(disabled));
    }

    async fn fire_reconnect(&mut self, now: Instant) {
        match self.reconnect.state() {
            ReconnectionState::ImmediateLadder { index } => {
                if self.is_connecting {
                    debug!(target: "Relay/Connection", "Connection attempt already running, skipping ladder step");
                    return;
                }
                info!(target: "Relay/Connection", "Immediate reconnection attempt {}", index + 1);
                self.is_connecting = true;
                self.connect_from_list(0).await;
            }
            ReconnectionState::PassiveScheduled => {
                self.reconnect_at = Some(now + self.reconnect.passive_interval());
                self.connect_silently().await;
            }
            ReconnectionState::Idle => {}
        }
    }

    async fn on_open(&mut self, identity: ServerIdentity) {
        self.connection_established = true;
        self.server_identity = Some(identity.clone());

        let previous_connection_time =
            stored(self.backend.last_connection_time().await, "read last connection time");
        let now_ms = now_millis();
        stored(
            self.backend.set_last_connection_time(now_ms).await,
            "store last connection time",
        );

        self.update_state(ConnectionEvent::Connected);
        self.is_connecting = false;
        self.is_connecting_silently = false;
        self.reconnect.reset();
        self.reconnect_at = None;
        self.liveness.reset(Instant::now());

        let version = self.adapter.as_ref().map(|adapter| adapter.version());
        info!(
            target: "Relay/Connection",
            "Connected to {} (protocol version {version:?})",
            identity.device_name.as_deref().unwrap_or("server")
        );

        let comparison = self.compare_server_identity(&identity).await;

        self.fetch_pending_conversations().await;

        if comparison.is_new_server {
            stored(
                self.backend.clear_last_server_message_id().await,
                "clear last server message ID",
            );
        } else {
            let supports_id_retrieval = self.adapter.as_ref().is_some_and(|adapter| {
                adapter.is_feature_supported(ConnectionFeature::IdBasedRetrieval)
            });
            let last_message_id = stored(
                self.backend.last_server_message_id().await,
                "read last server message ID",
            );
            match last_message_id {
                Some(id) if supports_id_retrieval => self.request_messages_id_range(id).await,
                _ => {
                    self.request_messages_time_range(previous_connection_time.unwrap_or(0), now_ms)
                        .await
                }
            }
        }

        if comparison.is_new_server_since_sync {
            info!(target: "Relay/Connection", "Server changed since the last sync");
            self.is_pending_sync = true;
            self.event_bus
                .publish_messaging(MessagingEvent::SyncRecommended {
                    installation_id: identity.installation_id.unwrap_or_default(),
                    device_name: identity.device_name,
                });
        }
    }

    async fn compare_server_identity(&self, identity: &ServerIdentity) -> IdentityComparison {
        let last_connection = stored(
            self.backend.last_connection_installation_id().await,
            "read last installation ID",
        );
        let last_sync = stored(
            self.backend.last_sync_installation_id().await,
            "read last sync installation ID",
        );
        let comparison = compare_identity(
            identity.installation_id.as_deref(),
            last_connection.as_deref(),
            last_sync.as_deref(),
        );

        if let Some(current) = identity.installation_id.as_deref() {
            if comparison.update_connection_baseline {
                stored(
                    self.backend.set_last_connection_installation_id(current).await,
                    "store last installation ID",
                );
            }
            if comparison.update_sync_baseline {
                stored(
                    self.backend.set_last_sync_installation_id(current).await,
                    "store last sync installation ID",
                );
            }
        }
        comparison
    }

    async fn on_close(&mut self, code: ConnectionErrorCode) {
        self.is_connecting = false;

        if code.is_connection_level() {
            if !self.connection_established && self.adapter_index + 1 < self.factories.len() {
                info!(
                    target: "Relay/Connection",
                    "Protocol priority {} failed ({code}), falling back",
                    self.adapter_index
                );
                self.is_connecting = true;
                self.connect_from_list(self.adapter_index + 1).await;
                return;
            }

            if self.connection_established && !self.disable_reconnections {
                if let Some(delay) = self.reconnect.advance_immediate() {
                    info!(target: "Relay/Connection", "Connection lost ({code}), retrying in {delay:?}");
                    self.adapter = None;
                    self.liveness.cancel();
                    self.reconnect_at = Some(Instant::now() + delay);
                    if self.state != ConnectionState::Connecting {
                        self.fail_all_pending(LocalFailure::ConnectionLost);
                        self.update_state(ConnectionEvent::Connecting);
                    }
                    return;
                }
            }
        }

        self.adapter = None;
        self.is_connecting_silently = false;

        if self.state != ConnectionState::Disconnected {
            info!(target: "Relay/Connection", "Disconnected ({code})");
            self.connection_established = false;
            self.fail_all_pending(LocalFailure::ConnectionLost);
            self.is_pending_sync = false;
            self.reconnect.reset();
            self.reconnect_at = None;
            self.update_state(ConnectionEvent::Disconnected { code });
            self.liveness.cancel();

            if !self.disable_reconnections {
                let delay = self.reconnect.start_passive();
                self.reconnect_at = Some(Instant::now() + delay);
            }
        } else {
            debug!(target: "Relay/Connection", "Background connection attempt failed ({code})");
        }
    }

    async fn on_packet(&mut self) {
        if !self.connection_established {
            return;
        }
        stored(
            self.backend.set_last_connection_time(now_millis()).await,
            "store last connection time",
        );
        self.liveness.reset(Instant::now());
    }

    async fn test_connection(&mut self) {
        let Some(adapter) = self.connected_adapter() else {
            return;
        };
        debug!(target: "Relay/Connection", "Sending keepalive ping");
        if !adapter.send_ping().await {
            warn!(target: "Relay/Connection", "Failed to send ping");
        }
        self.liveness.ping_sent(Instant::now());
    }

    fn shutdown(&mut self) {
        info!(target: "Relay/Connection", "Shutting down");
        self.fail_all_pending(LocalFailure::ConnectionLost);
        self.adapter = None;
        self.generation += 1;
        self.reconnect.reset();
        self.reconnect_at = None;
        self.liveness.cancel();
    }

    fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            state: self.state,
            communications_version: self.connected_adapter().map(|adapter| adapter.version()),
            server_identity: self.server_identity.clone(),
            mass_retrieval_in_progress: self.mass_retrieval_in_progress,
            pending_sync: self.is_pending_sync,
            pending_requests: self.pending.len(),
            reconnection: self.reconnect.state(),
            reconnections_disabled: self.disable_reconnections,
        }
    }

    // --- Requests ---

    fn allocate_request_id(&mut self) -> Option<RequestId> {
        let pending = &self.pending;
        let id = self.request_ids.next(|id| pending.contains(id));
        if id.is_none() {
            error!(target: "Relay/Request", "Every request ID is in use");
        }
        id
    }

    fn track(&mut self, id: RequestId, request: PendingRequest) -> u64 {
        debug!(target: "Relay/Request", "Tracking request {id} ({:?})", request.shape());
        self.pending
            .insert(id, request, Instant::now(), self.config.request_timeout)
    }

    fn fail_all_pending(&mut self, failure: LocalFailure) {
        for (id, entry) in self.pending.drain() {
            self.fail_entry(id, entry, failure);
        }
    }

    fn fail_entry(&mut self, id: RequestId, entry: PendingEntry, failure: LocalFailure) {
        debug!(target: "Relay/Request", "Failing request {id}: {failure:?}");
        match entry.request {
            PendingRequest::SendMessage { reply } => {
                let _ = reply.send(Err(failure.to_error()));
            }
            PendingRequest::Upload { events } => {
                let _ = events.send(Err(failure.to_error()));
            }
            PendingRequest::CreateChat { reply } => {
                let _ = reply.send(Err(failure.to_error()));
            }
            PendingRequest::Download {
                attachment_guid,
                subscribers,
                aggregator,
            } => self.notify_download_failure(
                &attachment_guid,
                subscribers,
                aggregator,
                failure.to_error(),
            ),
            PendingRequest::MassRetrieval { events, aggregator } => {
                self.notify_mass_retrieval_failure(events, aggregator, failure.to_error())
            }
        }
    }

    async fn send_push_token(&mut self, token: &str) -> bool {
        match self.connected_adapter() {
            Some(adapter) => adapter.send_push_token(token).await,
            None => false,
        }
    }

    async fn send_message(
        &mut self,
        target: ConversationTarget,
        text: String,
        reply: oneshot::Sender<Result<(), MessageSendError>>,
    ) {
        let Some(adapter) = self.connected_adapter() else {
            let _ = reply.send(Err(MessageSendError::Network));
            return;
        };
        let Some(id) = self.allocate_request_id() else {
            let _ = reply.send(Err(MessageSendError::Unknown));
            return;
        };
        if !adapter.send_message(id, &target, &text).await {
            let _ = reply.send(Err(MessageSendError::Network));
            return;
        }
        self.track(id, PendingRequest::SendMessage { reply });
    }

    fn send_file(
        &mut self,
        target: ConversationTarget,
        path: PathBuf,
        events: StreamSender<AttachmentUploadEvent, MessageSendError>,
    ) {
        let Some(adapter) = self.connected_adapter() else {
            let _ = events.send(Err(MessageSendError::Network));
            return;
        };
        let Some(id) = self.allocate_request_id() else {
            let _ = events.send(Err(MessageSendError::Unknown));
            return;
        };

        let stream = adapter.send_file(id, &target, &path);
        let serial = self.track(id, PendingRequest::Upload { events });
        let job = UploadJob {
            request_id: id,
            serial,
            stream,
        };
        if self.uploads.send(job).is_err() {
            error!(target: "Relay/Request", "Upload worker is gone");
            if let Some(PendingEntry {
                request: PendingRequest::Upload { events },
                ..
            }) = self.pending.remove(id)
            {
                let _ = events.send(Err(MessageSendError::Unknown));
            }
        }
    }

    fn on_upload_progress(
        &mut self,
        id: RequestId,
        serial: u64,
        update: Result<AttachmentUploadEvent, MessageSendError>,
    ) {
        let failed = update.is_err();
        match self.pending.get_mut(id) {
            Some(PendingEntry {
                request: PendingRequest::Upload { events },
                serial: current,
                ..
            }) if *current == serial => {
                let _ = events.send(update);
            }
            _ => {
                debug!(target: "Relay/Request", "Dropping upload progress for finished request {id}");
                return;
            }
        }
        if failed {
            self.pending.remove(id);
        } else {
            self.pending
                .touch(id, Instant::now(), self.config.request_timeout);
        }
    }

    fn on_send_message_result(&mut self, id: RequestId, result: Result<(), MessageSendError>) {
        let entry = self.pending.remove_if(id, |request| {
            matches!(
                request,
                PendingRequest::SendMessage { .. } | PendingRequest::Upload { .. }
            )
        });
        match entry.map(|entry| entry.request) {
            Some(PendingRequest::SendMessage { reply }) => {
                let _ = reply.send(result);
            }
            Some(PendingRequest::Upload { events }) => {
                // Dropping the sender ends the stream on success.
                if let Err(error) = result {
                    let _ = events.send(Err(error));
                }
            }
            _ => {
                debug!(target: "Relay/Request", "No pending message send for request {id}");
            }
        }
    }

    async fn create_chat(
        &mut self,
        members: Vec<String>,
        service: String,
        reply: oneshot::Sender<Result<String, ChatCreateError>>,
    ) {
        let Some(adapter) = self.connected_adapter() else {
            let _ = reply.send(Err(ChatCreateError::Network));
            return;
        };
        let Some(id) = self.allocate_request_id() else {
            let _ = reply.send(Err(ChatCreateError::Unknown));
            return;
        };
        if !adapter.request_chat_creation(id, &members, &service).await {
            let _ = reply.send(Err(ChatCreateError::Network));
            return;
        }
        self.track(id, PendingRequest::CreateChat { reply });
    }

    fn on_create_chat_result(&mut self, id: RequestId, result: Result<String, ChatCreateError>) {
        let entry = self
            .pending
            .remove_if(id, |request| matches!(request, PendingRequest::CreateChat { .. }));
        match entry.map(|entry| entry.request) {
            Some(PendingRequest::CreateChat { reply }) => {
                let _ = reply.send(result);
            }
            _ => {
                debug!(target: "Relay/Request", "No pending chat creation for request {id}");
            }
        }
    }

    async fn request_messages_time_range(&mut self, lower: i64, upper: i64) {
        let Some(adapter) = self.connected_adapter() else {
            return;
        };
        debug!(target: "Relay/Request", "Requesting messages between {lower} and {upper}");
        if !adapter.request_retrieval_time(lower, upper).await {
            warn!(target: "Relay/Request", "Failed to request messages by time range");
        }
    }

    async fn request_messages_id_range(&mut self, lower_id: i64) {
        let Some(adapter) = self.connected_adapter() else {
            return;
        };
        debug!(target: "Relay/Request", "Requesting messages after ID {lower_id}");
        if !adapter.request_retrieval_id(lower_id).await {
            warn!(target: "Relay/Request", "Failed to request messages by ID");
        }
    }

    // --- Incoming data ---

    async fn on_message_update(&mut self, items: Vec<ConversationItem>) {
        let outcome = match self.backend.save_message_update(&items).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(target: "Relay/Connection", "Failed to save {} incoming items: {e:?}", items.len());
                return;
            }
        };

        for conversation in outcome.incomplete_conversations {
            self.pending_conversations
                .insert(conversation.guid.clone(), conversation);
        }
        for event in outcome.events {
            self.event_bus.publish_messaging(event);
        }

        self.fetch_pending_conversations().await;

        for candidate in outcome.attachments {
            if candidate.outgoing {
                continue;
            }
            if self.config.auto_download_attachments
                || self.foreground.is_visible(&candidate.conversation_guid)
            {
                self.start_download(candidate.request, None).await;
            }
        }
    }

    async fn fetch_pending_conversations(&mut self) {
        let Some(adapter) = self.connected_adapter() else {
            return;
        };
        if self.pending_conversations.is_empty() {
            return;
        }
        let guids: Vec<String> = self.pending_conversations.keys().cloned().collect();
        debug!(target: "Relay/Request", "Requesting details of {} conversations", guids.len());
        if !adapter.request_conversation_info(&guids).await {
            warn!(target: "Relay/Request", "Failed to request conversation details");
        }
    }

    async fn on_conversation_update(&mut self, conversations: Vec<ConversationInfo>) {
        let mut available = Vec::new();
        let mut unavailable = Vec::new();
        for info in conversations {
            let Some(local) = self.pending_conversations.remove(&info.guid) else {
                continue;
            };
            if local.state != ConversationState::IncompleteServer {
                continue;
            }
            if info.available {
                available.push(info);
            } else {
                unavailable.push(info.guid);
            }
        }
        if available.is_empty() && unavailable.is_empty() {
            return;
        }

        match self
            .backend
            .save_conversation_update(&available, &unavailable)
            .await
        {
            Ok(events) => {
                for event in events {
                    self.event_bus.publish_messaging(event);
                }
            }
            Err(e) => {
                error!(target: "Relay/Connection", "Failed to save conversation details: {e:?}");
            }
        }
    }

    async fn on_modifier_update(&mut self, modifiers: Vec<ModifierInfo>) {
        match self.backend.save_modifiers(&modifiers).await {
            Ok(events) => {
                for event in events {
                    self.event_bus.publish_messaging(event);
                }
            }
            Err(e) => {
                error!(target: "Relay/Connection", "Failed to save {} modifiers: {e:?}", modifiers.len());
            }
        }
    }

    // --- Attachment downloads ---

    async fn start_download(
        &mut self,
        request: AttachmentRequest,
        subscriber: Option<StreamSender<AttachmentDownloadEvent, AttachmentRequestError>>,
    ) {
        let key = TrackableKey::attachment_download(request.attachment_guid.as_str());
        if let Some(id) = self.pending.find(&key) {
            debug!(
                target: "Relay/Download",
                "Attachment {} is already downloading as request {id}",
                request.attachment_guid
            );
            if let (
                Some(subscriber),
                Some(PendingEntry {
                    request: PendingRequest::Download { subscribers, .. },
                    ..
                }),
            ) = (subscriber, self.pending.get_mut(id))
            {
                subscribers.push(subscriber);
            }
            return;
        }

        let Some(adapter) = self.connected_adapter() else {
            if let Some(subscriber) = subscriber {
                let _ = subscriber.send(Err(AttachmentRequestError::Network));
            }
            return;
        };
        let Some(id) = self.allocate_request_id() else {
            if let Some(subscriber) = subscriber {
                let _ = subscriber.send(Err(AttachmentRequestError::Unknown));
            }
            return;
        };

        if !adapter
            .request_attachment_download(id, &request.attachment_guid)
            .await
        {
            warn!(target: "Relay/Download", "Failed to request attachment {}", request.attachment_guid);
            if let Some(subscriber) = subscriber {
                let _ = subscriber.send(Err(AttachmentRequestError::Network));
            }
            return;
        }

        info!(target: "Relay/Download", "Downloading attachment {} as request {id}", request.attachment_guid);
        let attachment_guid = request.attachment_guid.clone();
        self.track(
            id,
            PendingRequest::Download {
                attachment_guid,
                subscribers: subscriber.into_iter().collect(),
                aggregator: FileFetchAggregator::new(request),
            },
        );
    }

    fn on_file_request_start(
        &mut self,
        id: RequestId,
        length: u64,
        transform: Option<StreamTransform>,
    ) {
        let storage = self.storage.clone();
        let result = match self.pending.get_mut(id) {
            Some(PendingEntry {
                request: PendingRequest::Download { aggregator, .. },
                ..
            }) => aggregator.initialize(storage.as_ref(), length, transform),
            _ => {
                debug!(target: "Relay/Download", "Ignoring download start for unknown request {id}");
                return;
            }
        };
        match result {
            Ok(()) => self.emit_download(id, AttachmentDownloadEvent::Start { length }),
            Err(e) => self.fail_download(id, e.classify()),
        }
    }

    fn on_file_request_data(&mut self, id: RequestId, response_index: i32, data: Bytes) {
        let result = match self.pending.get_mut(id) {
            Some(PendingEntry {
                request: PendingRequest::Download { aggregator, .. },
                ..
            }) => aggregator
                .write_chunk(response_index, &data)
                .map(|written| (written, aggregator.total_length())),
            _ => {
                debug!(target: "Relay/Download", "Ignoring chunk for unknown request {id}");
                return;
            }
        };
        match result {
            Ok((written, total)) => {
                self.emit_download(id, AttachmentDownloadEvent::Progress { written, total })
            }
            Err(e) => self.fail_download(id, e.classify()),
        }
    }

    async fn on_file_request_complete(&mut self, id: RequestId) {
        let entry = self
            .pending
            .remove_if(id, |request| matches!(request, PendingRequest::Download { .. }));
        let Some(PendingEntry {
            request:
                PendingRequest::Download {
                    attachment_guid,
                    subscribers,
                    mut aggregator,
                },
            ..
        }) = entry
        else {
            debug!(target: "Relay/Download", "Ignoring completion for unknown request {id}");
            return;
        };

        let path = match aggregator.complete() {
            Ok(path) => path,
            Err(e) => {
                self.notify_download_failure(&attachment_guid, subscribers, aggregator, e.classify());
                return;
            }
        };
        info!(target: "Relay/Download", "Attachment {attachment_guid} saved to {}", path.display());

        let event = AttachmentDownloadEvent::Complete { path: path.clone() };
        for subscriber in &subscribers {
            let _ = subscriber.send(Ok(event.clone()));
        }
        self.event_bus
            .publish_attachment_download(AttachmentDownloadUpdate {
                attachment_guid: attachment_guid.clone(),
                update: Ok(event),
            });

        stored(
            self.backend
                .save_attachment_file(&attachment_guid, &path)
                .await,
            "record downloaded attachment",
        );
        let request = aggregator.request();
        self.event_bus
            .publish_messaging(MessagingEvent::AttachmentFile {
                message_local_id: request.message_local_id,
                attachment_local_id: request.attachment_local_id,
                path,
            });
    }

    fn emit_download(&mut self, id: RequestId, event: AttachmentDownloadEvent) {
        let Some(PendingEntry {
            request:
                PendingRequest::Download {
                    attachment_guid,
                    subscribers,
                    ..
                },
            ..
        }) = self.pending.get_mut(id)
        else {
            return;
        };
        for subscriber in subscribers.iter() {
            let _ = subscriber.send(Ok(event.clone()));
        }
        self.event_bus
            .publish_attachment_download(AttachmentDownloadUpdate {
                attachment_guid: attachment_guid.clone(),
                update: Ok(event),
            });
        self.pending
            .touch(id, Instant::now(), self.config.request_timeout);
    }

    fn fail_download(&mut self, id: RequestId, error: AttachmentRequestError) {
        let entry = self
            .pending
            .remove_if(id, |request| matches!(request, PendingRequest::Download { .. }));
        if let Some(PendingEntry {
            request:
                PendingRequest::Download {
                    attachment_guid,
                    subscribers,
                    aggregator,
                },
            ..
        }) = entry
        {
            self.notify_download_failure(&attachment_guid, subscribers, aggregator, error);
        } else {
            debug!(target: "Relay/Download", "Ignoring failure for unknown request {id}");
        }
    }

    fn notify_download_failure(
        &self,
        attachment_guid: &str,
        subscribers: Vec<StreamSender<AttachmentDownloadEvent, AttachmentRequestError>>,
        mut aggregator: FileFetchAggregator,
        error: AttachmentRequestError,
    ) {
        warn!(target: "Relay/Download", "Download of attachment {attachment_guid} failed: {error}");
        aggregator.cancel();
        for subscriber in &subscribers {
            let _ = subscriber.send(Err(error.clone()));
        }
        self.event_bus
            .publish_attachment_download(AttachmentDownloadUpdate {
                attachment_guid: attachment_guid.to_string(),
                update: Err(error),
            });
    }

    // --- Mass retrieval ---

    async fn fetch_mass_conversation_data(
        &mut self,
        params: MassRetrievalParams,
        events: StreamSender<MassRetrievalEvent, MassRetrievalError>,
    ) {
        if self.mass_retrieval_in_progress {
            let _ = events.send(Err(MassRetrievalError::AlreadyInProgress));
            return;
        }
        let Some(adapter) = self.connected_adapter() else {
            let _ = events.send(Err(MassRetrievalError::Network));
            return;
        };
        let Some(id) = self.allocate_request_id() else {
            let _ = events.send(Err(MassRetrievalError::Unknown));
            return;
        };
        if !adapter.request_retrieval_all(id, &params).await {
            let _ = events.send(Err(MassRetrievalError::Network));
            return;
        }

        info!(target: "Relay/MassRetrieval", "Starting mass retrieval as request {id}");
        self.mass_retrieval_in_progress = true;
        self.track(
            id,
            PendingRequest::MassRetrieval {
                events,
                aggregator: MassRetrievalAggregator::new(),
            },
        );
    }

    fn mass_retrieval_aggregator(&mut self, id: RequestId) -> Option<&mut MassRetrievalAggregator> {
        match self.pending.get_mut(id) {
            Some(PendingEntry {
                request: PendingRequest::MassRetrieval { aggregator, .. },
                ..
            }) => Some(aggregator),
            _ => {
                debug!(target: "Relay/MassRetrieval", "Ignoring callback for unknown request {id}");
                None
            }
        }
    }

    async fn on_mass_retrieval_start(
        &mut self,
        id: RequestId,
        conversations: Vec<ConversationInfo>,
        message_count: u64,
    ) {
        let Some(aggregator) = self.mass_retrieval_aggregator(id) else {
            return;
        };
        if let Err(e) = aggregator.handle_initial_info(message_count) {
            self.fail_mass_retrieval(id, e.classify());
            return;
        }

        let conversations = match self
            .backend
            .save_mass_retrieval_conversations(&conversations)
            .await
        {
            Ok(conversations) => conversations,
            Err(e) => {
                error!(target: "Relay/MassRetrieval", "Failed to save conversations: {e:?}");
                self.fail_mass_retrieval(id, MassRetrievalError::Unknown);
                return;
            }
        };
        info!(
            target: "Relay/MassRetrieval",
            "Receiving {} conversations with {message_count} messages",
            conversations.len()
        );
        self.emit_mass_retrieval(
            id,
            MassRetrievalEvent::Start {
                conversations,
                message_count,
            },
        );
    }

    async fn on_mass_retrieval_update(
        &mut self,
        id: RequestId,
        response_index: i32,
        items: Vec<ConversationItem>,
    ) {
        let Some(aggregator) = self.mass_retrieval_aggregator(id) else {
            return;
        };
        let (received, total) = match aggregator.handle_items(response_index, items.len()) {
            Ok(received) => (received, aggregator.total_messages()),
            Err(e) => {
                self.fail_mass_retrieval(id, e.classify());
                return;
            }
        };

        let items = match self.backend.save_mass_retrieval_items(&items).await {
            Ok(items) => items,
            Err(e) => {
                error!(target: "Relay/MassRetrieval", "Failed to save items: {e:?}");
                self.fail_mass_retrieval(id, MassRetrievalError::Unknown);
                return;
            }
        };
        self.emit_mass_retrieval(
            id,
            MassRetrievalEvent::Progress {
                items,
                received,
                total,
            },
        );
    }

    fn on_mass_retrieval_file_start(
        &mut self,
        id: RequestId,
        attachment_guid: &str,
        file_name: &str,
        length: Option<u64>,
        transform: Option<StreamTransform>,
    ) {
        let storage = self.storage.clone();
        let Some(aggregator) = self.mass_retrieval_aggregator(id) else {
            return;
        };
        match aggregator.initialize_attachment(
            storage.as_ref(),
            attachment_guid,
            file_name,
            length,
            transform,
        ) {
            Ok(()) => self
                .pending
                .touch(id, Instant::now(), self.config.request_timeout),
            Err(e) => self.fail_mass_retrieval(id, e.classify()),
        }
    }

    fn on_mass_retrieval_file_progress(
        &mut self,
        id: RequestId,
        response_index: i32,
        attachment_guid: &str,
        data: Bytes,
    ) {
        let Some(aggregator) = self.mass_retrieval_aggregator(id) else {
            return;
        };
        match aggregator.write_attachment_chunk(attachment_guid, response_index, &data) {
            Ok(_) => self
                .pending
                .touch(id, Instant::now(), self.config.request_timeout),
            Err(e) => self.fail_mass_retrieval(id, e.classify()),
        }
    }

    async fn on_mass_retrieval_file_complete(&mut self, id: RequestId, attachment_guid: String) {
        let Some(aggregator) = self.mass_retrieval_aggregator(id) else {
            return;
        };
        let path = match aggregator.finish_attachment(&attachment_guid) {
            Ok(path) => path,
            Err(e) => {
                self.fail_mass_retrieval(id, e.classify());
                return;
            }
        };
        debug!(target: "Relay/MassRetrieval", "Received attachment {attachment_guid}");
        stored(
            self.backend
                .save_attachment_file(&attachment_guid, &path)
                .await,
            "record retrieved attachment",
        );
        self.emit_mass_retrieval(id, MassRetrievalEvent::File { attachment_guid });
    }

    async fn on_mass_retrieval_complete(&mut self, id: RequestId) {
        let entry = self
            .pending
            .remove_if(id, |request| matches!(request, PendingRequest::MassRetrieval { .. }));
        let Some(PendingEntry {
            request:
                PendingRequest::MassRetrieval {
                    events,
                    mut aggregator,
                },
            ..
        }) = entry
        else {
            debug!(target: "Relay/MassRetrieval", "Ignoring completion for unknown request {id}");
            return;
        };

        if let Err(e) = aggregator.complete() {
            self.notify_mass_retrieval_failure(events, aggregator, e.classify());
            return;
        }

        info!(
            target: "Relay/MassRetrieval",
            "Mass retrieval finished with {} messages",
            aggregator.received_messages()
        );
        self.mass_retrieval_in_progress = false;
        let _ = events.send(Ok(MassRetrievalEvent::Complete));
        self.event_bus
            .publish_mass_retrieval(MassRetrievalEvent::Complete);

        let installation_id = self
            .server_identity
            .as_ref()
            .and_then(|identity| identity.installation_id.clone());
        if let Some(installation_id) = installation_id {
            stored(
                self.backend
                    .set_last_sync_installation_id(&installation_id)
                    .await,
                "store last sync installation ID",
            );
        }
        self.is_pending_sync = false;
    }

    fn emit_mass_retrieval(&mut self, id: RequestId, event: MassRetrievalEvent) {
        let Some(PendingEntry {
            request: PendingRequest::MassRetrieval { events, .. },
            ..
        }) = self.pending.get_mut(id)
        else {
            return;
        };
        let _ = events.send(Ok(event.clone()));
        self.event_bus.publish_mass_retrieval(event);
        self.pending
            .touch(id, Instant::now(), self.config.request_timeout);
    }

    fn fail_mass_retrieval(&mut self, id: RequestId, error: MassRetrievalError) {
        let entry = self
            .pending
            .remove_if(id, |request| matches!(request, PendingRequest::MassRetrieval { .. }));
        if let Some(PendingEntry {
            request: PendingRequest::MassRetrieval { events, aggregator },
            ..
        }) = entry
        {
            self.notify_mass_retrieval_failure(events, aggregator, error);
        } else {
            debug!(target: "Relay/MassRetrieval", "Ignoring failure for unknown request {id}");
        }
    }

    fn notify_mass_retrieval_failure(
        &mut self,
        events: StreamSender<MassRetrievalEvent, MassRetrievalError>,
        mut aggregator: MassRetrievalAggregator,
        error: MassRetrievalError,
    ) {
        warn!(target: "Relay/MassRetrieval", "Mass retrieval failed: {error}");
        aggregator.cancel();
        self.mass_retrieval_in_progress = false;
        let _ = events.send(Err(error.clone()));
        self.event_bus
            .publish_mass_retrieval(MassRetrievalEvent::Error(error));
    }
}
