use crate::client::RelayClient;
use crate::config::ClientConfig;
use crate::store::InMemoryBackend;
use crate::transport::{
    AdapterEvent, AdapterEventSender, AdapterFactory, ProtocolAdapter, UploadStream,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use relay_core::error::{ConnectionErrorCode, MessageSendError};
use relay_core::request::RequestId;
use relay_core::store::{Backend, ForegroundQuery};
use relay_core::types::{
    AttachmentUploadEvent, ConnectionFeature, ConnectionState, ConversationTarget,
    MassRetrievalParams, ProxyType, ServerIdentity,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Everything the manager asked an adapter to do, tagged with its version.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AdapterCall {
    Open {
        version: u32,
        proxy_type: ProxyType,
        override_value: Option<String>,
    },
    Close {
        version: u32,
        code: ConnectionErrorCode,
    },
    Ping,
    PushToken(String),
    SendMessage {
        id: RequestId,
        text: String,
    },
    SendFile {
        id: RequestId,
        path: PathBuf,
    },
    AttachmentDownload {
        id: RequestId,
        attachment_guid: String,
    },
    RetrievalTime {
        lower: i64,
        upper: i64,
    },
    RetrievalId {
        lower_id: i64,
    },
    RetrievalAll {
        id: RequestId,
    },
    ConversationInfo(Vec<String>),
    ChatCreation {
        id: RequestId,
        members: Vec<String>,
        service: String,
    },
}

/// Behaviour shared by every scripted adapter of a harness.
#[derive(Default)]
pub(crate) struct Script {
    pub features: Vec<ConnectionFeature>,
    /// Makes every send method report that nothing went out.
    pub reject_sends: bool,
    pub upload_events: Vec<Result<AttachmentUploadEvent, MessageSendError>>,
}

/// Sends events as the server would, through the adapters' own senders.
#[derive(Clone, Default)]
pub(crate) struct Remote {
    senders: Arc<Mutex<Vec<AdapterEventSender>>>,
}

impl Remote {
    /// Emits through the most recently created adapter.
    pub fn send(&self, event: AdapterEvent) {
        let senders = self.senders.lock().unwrap();
        senders
            .last()
            .expect("no adapter has been created")
            .send(event);
    }

    /// Emits through the adapter created `index`-th, even after it was replaced.
    pub fn send_from(&self, index: usize, event: AdapterEvent) {
        self.senders.lock().unwrap()[index].send(event);
    }

    pub fn adapters_created(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    pub fn open(&self, installation_id: &str) {
        self.send(AdapterEvent::Open(ServerIdentity {
            installation_id: Some(installation_id.to_string()),
            device_name: Some("Mac".to_string()),
            system_version: None,
            software_version: None,
        }));
    }

    pub fn close(&self, code: ConnectionErrorCode) {
        self.send(AdapterEvent::Close(code));
    }
}

pub(crate) struct ScriptedFactory {
    version: u32,
    calls: mpsc::UnboundedSender<AdapterCall>,
    remote: Remote,
    script: Arc<Mutex<Script>>,
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, events: AdapterEventSender, proxy_type: ProxyType) -> Arc<dyn ProtocolAdapter> {
        self.remote.senders.lock().unwrap().push(events.clone());
        Arc::new(ScriptedAdapter {
            version: self.version,
            proxy_type,
            events,
            calls: self.calls.clone(),
            script: self.script.clone(),
        })
    }
}

struct ScriptedAdapter {
    version: u32,
    proxy_type: ProxyType,
    events: AdapterEventSender,
    calls: mpsc::UnboundedSender<AdapterCall>,
    script: Arc<Mutex<Script>>,
}

impl ScriptedAdapter {
    fn record(&self, call: AdapterCall) -> bool {
        let _ = self.calls.send(call);
        !self.script.lock().unwrap().reject_sends
    }
}

#[async_trait]
impl ProtocolAdapter for ScriptedAdapter {
    fn version(&self) -> u32 {
        self.version
    }

    async fn open(&self, override_value: Option<String>) {
        self.record(AdapterCall::Open {
            version: self.version,
            proxy_type: self.proxy_type,
            override_value,
        });
    }

    async fn close(&self, code: ConnectionErrorCode) {
        self.record(AdapterCall::Close {
            version: self.version,
            code,
        });
        self.events.send(AdapterEvent::Close(code));
    }

    fn is_feature_supported(&self, feature: ConnectionFeature) -> bool {
        self.script.lock().unwrap().features.contains(&feature)
    }

    async fn send_ping(&self) -> bool {
        self.record(AdapterCall::Ping)
    }

    async fn send_push_token(&self, token: &str) -> bool {
        self.record(AdapterCall::PushToken(token.to_string()))
    }

    async fn send_message(&self, id: RequestId, _target: &ConversationTarget, text: &str) -> bool {
        self.record(AdapterCall::SendMessage {
            id,
            text: text.to_string(),
        })
    }

    fn send_file(&self, id: RequestId, _target: &ConversationTarget, path: &Path) -> UploadStream {
        self.record(AdapterCall::SendFile {
            id,
            path: path.to_path_buf(),
        });
        let events = std::mem::take(&mut self.script.lock().unwrap().upload_events);
        stream::iter(events).boxed()
    }

    async fn request_attachment_download(&self, id: RequestId, attachment_guid: &str) -> bool {
        self.record(AdapterCall::AttachmentDownload {
            id,
            attachment_guid: attachment_guid.to_string(),
        })
    }

    async fn request_retrieval_time(&self, lower: i64, upper: i64) -> bool {
        self.record(AdapterCall::RetrievalTime { lower, upper })
    }

    async fn request_retrieval_id(&self, lower_id: i64) -> bool {
        self.record(AdapterCall::RetrievalId { lower_id })
    }

    async fn request_retrieval_all(&self, id: RequestId, _params: &MassRetrievalParams) -> bool {
        self.record(AdapterCall::RetrievalAll { id })
    }

    async fn request_conversation_info(&self, conversation_guids: &[String]) -> bool {
        let mut guids = conversation_guids.to_vec();
        guids.sort();
        self.record(AdapterCall::ConversationInfo(guids))
    }

    async fn request_chat_creation(&self, id: RequestId, members: &[String], service: &str) -> bool {
        self.record(AdapterCall::ChatCreation {
            id,
            members: members.to_vec(),
            service: service.to_string(),
        })
    }
}

/// A client wired to scripted adapters, an in-memory backend and a temporary
/// attachment directory.
pub(crate) struct Harness {
    pub client: RelayClient,
    pub calls: mpsc::UnboundedReceiver<AdapterCall>,
    pub remote: Remote,
    pub script: Arc<Mutex<Script>>,
    pub backend: Arc<InMemoryBackend>,
    pub visible: Arc<Mutex<Vec<String>>>,
    pub dir: TempDir,
}

impl Harness {
    /// `versions` is the protocol priority list, newest first.
    pub fn new(versions: &[u32]) -> Self {
        Self::with_config(versions, ClientConfig::default())
    }

    pub fn with_config(versions: &[u32], mut config: ClientConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().expect("temp dir");
        config.attachment_dir = dir.path().to_path_buf();

        let (calls_tx, calls) = mpsc::unbounded_channel();
        let remote = Remote::default();
        let script = Arc::new(Mutex::new(Script::default()));
        let factories = versions
            .iter()
            .map(|&version| {
                Arc::new(ScriptedFactory {
                    version,
                    calls: calls_tx.clone(),
                    remote: remote.clone(),
                    script: script.clone(),
                }) as Arc<dyn AdapterFactory>
            })
            .collect();

        let backend = Arc::new(InMemoryBackend::new());
        let visible = Arc::new(Mutex::new(Vec::<String>::new()));
        let visible_query = visible.clone();
        let foreground: Arc<dyn ForegroundQuery> =
            Arc::new(move || visible_query.lock().unwrap().clone());

        let client = RelayClient::spawn(
            config,
            factories,
            backend.clone() as Arc<dyn Backend>,
            foreground,
        )
        .expect("client should start");

        Self {
            client,
            calls,
            remote,
            script,
            backend,
            visible,
            dir,
        }
    }

    pub async fn next_call(&mut self) -> AdapterCall {
        self.calls.recv().await.expect("adapter call channel closed")
    }

    /// Skips calls until one matches.
    pub async fn call_matching(&mut self, matches: impl Fn(&AdapterCall) -> bool) -> AdapterCall {
        loop {
            let call = self.next_call().await;
            if matches(&call) {
                return call;
            }
        }
    }

    /// Waits until the manager has handled everything sent so far.
    pub async fn settle(&self) {
        self.client.snapshot().await.expect("manager stopped");
    }

    /// Every call recorded up to now.
    pub async fn drain_calls(&mut self) -> Vec<AdapterCall> {
        self.settle().await;
        let mut calls = Vec::new();
        while let Ok(call) = self.calls.try_recv() {
            calls.push(call);
        }
        calls
    }

    pub async fn wait_for_state(&self, state: ConnectionState) {
        let mut changes = self.client.state_changes();
        changes
            .wait_for(|current| *current == state)
            .await
            .expect("manager stopped");
    }

    /// Connects and completes the handshake with the given server.
    pub async fn connect_as(&mut self, installation_id: &str) {
        self.client.connect();
        self.call_matching(|call| matches!(call, AdapterCall::Open { .. }))
            .await;
        self.remote.open(installation_id);
        self.wait_for_state(ConnectionState::Connected).await;
        self.settle().await;
    }
}
