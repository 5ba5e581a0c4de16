// Runtime-agnostic pieces live in relay-core and are re-exported here.
pub use relay_core::{attachment, error, file_fetch, identity, mass_retrieval, reconnect};

// Core types are re-exported, but events (with EventBus) remain here for the tokio side
pub mod types {
    pub use relay_core::types::*;
    pub mod events;
}

pub mod actors;
pub mod client;
pub mod config;
pub mod download;
mod keepalive;
mod request;
pub mod store;
pub mod stream;
pub mod transport;
mod upload;

#[cfg(test)]
pub(crate) mod test_utils;

pub use client::RelayClient;
pub use config::ClientConfig;
pub use relay_core::request::{RequestId, TrackableCategory, TrackableKey};
