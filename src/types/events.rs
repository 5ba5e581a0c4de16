use relay_core::types::{
    AttachmentDownloadUpdate, ConfigurationEvent, ConnectionEvent, MassRetrievalEvent,
    MessagingEvent,
};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per topic.
        ///
        /// Each channel preserves publication order. Slow subscribers lag and
        /// miss events instead of holding up the connection manager.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (connection, ConnectionEvent),
    (messaging, Arc<MessagingEvent>),
    (mass_retrieval, Arc<MassRetrievalEvent>),
    (attachment_download, Arc<AttachmentDownloadUpdate>),
    (configuration, ConfigurationEvent),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    // A send only fails when nobody is subscribed, which is not an error here.
    pub(crate) fn publish_connection(&self, event: ConnectionEvent) {
        let _ = self.connection.send(event);
    }

    pub(crate) fn publish_messaging(&self, event: MessagingEvent) {
        let _ = self.messaging.send(Arc::new(event));
    }

    pub(crate) fn publish_mass_retrieval(&self, event: MassRetrievalEvent) {
        let _ = self.mass_retrieval.send(Arc::new(event));
    }

    pub(crate) fn publish_attachment_download(&self, update: AttachmentDownloadUpdate) {
        let _ = self.attachment_download.send(Arc::new(update));
    }

    pub(crate) fn publish_configuration(&self, event: ConfigurationEvent) {
        let _ = self.configuration.send(event);
    }
}
