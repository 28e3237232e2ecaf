//! In-process event bus for queue updates.
//!
//! Presentation layers subscribe here to render now-playing messages; the
//! engine itself never talks to the chat platform.

use tokio::sync::broadcast;

use guild_audio_types::{PlaybackEndReason, Track};

/// Events published by queue workers and the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// Pending list, loop flag or volume changed.
    QueueChanged { guild_id: String },
    /// A track started producing audio.
    TrackStarted { guild_id: String, track: Track },
    /// A track stopped playing.
    TrackEnded {
        guild_id: String,
        track: Track,
        reason: PlaybackEndReason,
    },
    /// A track could not be resolved and was skipped.
    TrackFailed {
        guild_id: String,
        track: Track,
        error: String,
    },
    /// Playback was paused or resumed.
    PauseChanged { guild_id: String, paused: bool },
    /// The last pending track finished.
    Drained { guild_id: String },
    /// The queue was stopped and cleared.
    Stopped { guild_id: String },
    /// The voice connection was lost and the queue torn down.
    ConnectionLost { guild_id: String },
}

impl QueueEvent {
    pub fn guild_id(&self) -> &str {
        match self {
            QueueEvent::QueueChanged { guild_id }
            | QueueEvent::TrackStarted { guild_id, .. }
            | QueueEvent::TrackEnded { guild_id, .. }
            | QueueEvent::TrackFailed { guild_id, .. }
            | QueueEvent::PauseChanged { guild_id, .. }
            | QueueEvent::Drained { guild_id }
            | QueueEvent::Stopped { guild_id }
            | QueueEvent::ConnectionLost { guild_id } => guild_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    pub fn queue_changed(&self, guild_id: &str) {
        self.publish(QueueEvent::QueueChanged {
            guild_id: guild_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.queue_changed("g1");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.guild_id(), "g1");
        assert!(matches!(event, QueueEvent::QueueChanged { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_ignored() {
        let bus = EventBus::new();
        bus.publish(QueueEvent::Drained {
            guild_id: "g1".to_string(),
        });
    }
}
