pub mod connection;
pub mod conversation;
pub mod events;

pub use connection::*;
pub use conversation::*;
pub use events::*;
