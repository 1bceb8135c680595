use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
};

use shared::{
    domain::{CorrelationKey, DeliveryStatus, MessageId},
    error::FailureClass,
    protocol::RemoteMessage,
};
use tokio::sync::broadcast;
use tracing::warn;

/// Presentation-facing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A new message in the conversation that is currently on screen.
    MessageReceived(RemoteMessage),
    DeliveryChanged {
        correlation_key: CorrelationKey,
        status: DeliveryStatus,
        server_id: Option<MessageId>,
    },
    Banner {
        class: FailureClass,
        message: String,
    },
    BannerCleared {
        class: FailureClass,
    },
}

pub struct EventHub {
    tx: broadcast::Sender<SyncEvent>,
    banners: Mutex<HashSet<FailureClass>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            banners: Mutex::new(HashSet::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    /// Shows one banner per failure class until [`EventHub::clear_banner`].
    pub fn raise_banner(&self, class: FailureClass, message: impl Into<String>) {
        let newly_raised = self
            .banners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class);
        if newly_raised {
            let message = message.into();
            warn!(?class, %message, "sync: raising banner");
            self.emit(SyncEvent::Banner { class, message });
        }
    }

    pub fn clear_banner(&self, class: FailureClass) {
        let was_raised = self
            .banners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&class);
        if was_raised {
            self.emit(SyncEvent::BannerCleared { class });
        }
    }

    pub fn active_banners(&self) -> Vec<FailureClass> {
        self.banners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}
