pub(crate) mod connection_manager;
pub mod messages;
