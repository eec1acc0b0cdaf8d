use crate::types::RelayEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sending half of the notification channel to the command surface.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

pub type EventStream = mpsc::UnboundedReceiver<RelayEvent>;

impl EventSink {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: RelayEvent) {
        debug!(destination = %event.destination_id(), "Emitting {:?}", event);
        if self.tx.send(event).is_err() {
            warn!("Event receiver dropped; notification lost");
        }
    }
}
