use tokio::sync::broadcast;

use crate::{playback::PlaybackState, Channel};

/// State-change notifications for UI layers.
///
/// Delivery is FIFO per source; slow subscribers may observe
/// [`broadcast::error::RecvError::Lagged`] and should resynchronize from
/// the player's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    ManifestReceived { channel: Channel },
    SegmentReady { channel: Channel, index: u64 },
    PlaybackStateChanged(PlaybackState),
    CurrentIndexChanged(u64),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlayerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers. Events emitted with no
    /// subscribers are dropped.
    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
