//! Voice transport seam.
//!
//! The chat platform's voice library sits behind these traits; the engine
//! only needs to join a channel, watch the connection state and hand audio to
//! a sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::playback_session::AudioSink;

/// Lifecycle of a voice connection as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

pub trait VoiceConnection: Send + Sync {
    /// Current state plus change notifications.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Route audio from `sink` into this connection.
    fn subscribe(&self, sink: Arc<dyn AudioSink>);

    /// Leave the channel and release the connection.
    fn destroy(&self);
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Start joining `channel_id`; the connection may not be ready yet.
    async fn join(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Arc<dyn VoiceConnection>, TransportError>;

    /// Create the audio sink a guild's queue plays into.
    fn create_sink(&self, guild_id: &str) -> Arc<dyn AudioSink>;
}

/// Join and wait until the connection is ready, bounded by `timeout`.
///
/// A connection that is not ready in time is destroyed before returning.
pub async fn connect_with_timeout(
    transport: &dyn VoiceTransport,
    guild_id: &str,
    channel_id: &str,
    timeout: Duration,
) -> Result<Arc<dyn VoiceConnection>, TransportError> {
    let deadline = Instant::now() + timeout;
    let connection = tokio::time::timeout_at(deadline, transport.join(guild_id, channel_id))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

    let mut state = connection.state();
    let settled = tokio::time::timeout_at(
        deadline,
        state.wait_for(|s| *s != ConnectionState::Connecting),
    )
    .await
    .map(|result| result.map(|s| *s));

    match settled {
        Ok(Ok(ConnectionState::Ready)) => {
            tracing::info!(guild_id, channel_id, "voice connection ready");
            Ok(connection)
        }
        Ok(Ok(other)) => {
            tracing::warn!(guild_id, channel_id, state = ?other, "voice connection failed");
            connection.destroy();
            Err(TransportError::Disconnected)
        }
        Ok(Err(_)) => {
            connection.destroy();
            Err(TransportError::Disconnected)
        }
        Err(_) => {
            tracing::warn!(guild_id, channel_id, ?timeout, "voice connection timed out");
            connection.destroy();
            Err(TransportError::Timeout(timeout))
        }
    }
}
