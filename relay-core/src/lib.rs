//! Runtime-agnostic building blocks of the relay connection layer.
//!
//! Nothing in this crate spawns tasks or touches a clock directly; the tokio
//! side lives in `relay-client` and drives these types from its owner task.

pub mod attachment;
pub mod error;
pub mod file_fetch;
pub mod identity;
pub mod mass_retrieval;
pub mod reconnect;
pub mod request;
pub mod store;
pub mod types;
