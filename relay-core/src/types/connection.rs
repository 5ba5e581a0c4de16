use serde::{Deserialize, Serialize};

/// Observable state of the single logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Optional behaviour a protocol adapter may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionFeature {
    /// Missed messages can be fetched by the last server-assigned message ID
    /// instead of by time range.
    IdBasedRetrieval,
    /// Attachments can be included in a mass retrieval.
    MassRetrievalFiles,
    /// The server accepts a push token.
    PushNotifications,
}

/// How the transport reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProxyType {
    /// Straight to the server address.
    #[default]
    Direct,
    /// Through the relay connect service.
    Connect,
}

/// Values that replace the stored connection parameters for new attempts,
/// for example while the user is testing a server address during setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOverride {
    pub proxy_type: ProxyType,
    pub value: Option<String>,
}

/// Details reported by the server when the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub installation_id: Option<String>,
    pub device_name: Option<String>,
    pub system_version: Option<String>,
    pub software_version: Option<String>,
}
