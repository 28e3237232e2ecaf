//! Binding between a guild's audio sink and its voice connection.
//!
//! The session turns sink callbacks into a single ordered status stream.
//! Every `play` starts a new generation; callbacks from older generations are
//! dropped so a replaced or stopped stream can never end the current one.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;

use guild_audio_types::PlaybackState;

use crate::queue_state::clamp_volume;
use crate::source::AudioStream;
use crate::voice_transport::VoiceConnection;

/// Audio output for one guild, provided by the voice transport.
///
/// `play` replaces whatever is currently playing and reports progress through
/// `events`.
pub trait AudioSink: Send + Sync {
    fn play(&self, stream: AudioStream, volume: f32, events: SinkEvents);
    fn pause(&self) -> bool;
    fn resume(&self) -> bool;
    fn stop(&self);
    fn set_volume(&self, volume: f32);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Started,
    Finished,
    Failed(String),
}

/// Callback handle given to the sink for one played stream.
#[derive(Debug, Clone)]
pub struct SinkEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SinkEvent)>,
}

impl SinkEvents {
    pub fn started(&self) {
        self.send(SinkEvent::Started);
    }

    pub fn finished(&self) {
        self.send(SinkEvent::Finished);
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.send(SinkEvent::Failed(message.into()));
    }

    fn send(&self, event: SinkEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Playing,
    Paused,
    Idle,
    Error(String),
}

pub struct PlaybackSession {
    sink: Arc<dyn AudioSink>,
    connection: Option<Arc<dyn VoiceConnection>>,
    state: PlaybackState,
    generation: u64,
    pending_status: VecDeque<SessionStatus>,
    events_tx: mpsc::UnboundedSender<(u64, SinkEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, SinkEvent)>,
}

impl PlaybackSession {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            sink,
            connection: None,
            state: PlaybackState::Idle,
            generation: 0,
            pending_status: VecDeque::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn connection(&self) -> Option<&Arc<dyn VoiceConnection>> {
        self.connection.as_ref()
    }

    /// Route the sink into `connection`, replacing any previous binding.
    pub fn attach(&mut self, connection: Arc<dyn VoiceConnection>) {
        connection.subscribe(self.sink.clone());
        self.connection = Some(connection);
    }

    /// Start `stream`, replacing whatever is playing.
    pub fn play(&mut self, stream: AudioStream, volume: f32) {
        self.generation += 1;
        self.pending_status.clear();
        self.state = PlaybackState::Playing;
        let events = SinkEvents {
            generation: self.generation,
            tx: self.events_tx.clone(),
        };
        self.sink.play(stream, clamp_volume(volume), events);
    }

    pub fn pause(&mut self) -> bool {
        if self.state != PlaybackState::Playing {
            return false;
        }
        self.sink.pause();
        self.state = PlaybackState::Paused;
        self.pending_status.push_back(SessionStatus::Paused);
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != PlaybackState::Paused {
            return false;
        }
        self.sink.resume();
        self.state = PlaybackState::Playing;
        self.pending_status.push_back(SessionStatus::Playing);
        true
    }

    /// Halt the current stream and report `Idle`; returns `false` when idle already.
    pub fn stop_track(&mut self) -> bool {
        if self.state == PlaybackState::Idle {
            return false;
        }
        self.generation += 1;
        self.sink.stop();
        self.state = PlaybackState::Idle;
        self.pending_status.push_back(SessionStatus::Idle);
        true
    }

    /// Halt playback and destroy the connection. No status is reported.
    pub fn stop(&mut self) {
        self.generation += 1;
        self.sink.stop();
        self.state = PlaybackState::Idle;
        self.pending_status.clear();
        if let Some(connection) = self.connection.take() {
            connection.destroy();
        }
    }

    pub fn set_volume(&self, volume: f32) -> f32 {
        let volume = clamp_volume(volume);
        self.sink.set_volume(volume);
        volume
    }

    /// Next status change. Cancel safe.
    pub async fn next_status(&mut self) -> SessionStatus {
        loop {
            if let Some(status) = self.pending_status.pop_front() {
                return status;
            }
            // The session holds a sender, so the channel never closes.
            let Some((generation, event)) = self.events_rx.recv().await else {
                std::future::pending::<()>().await;
                continue;
            };
            if generation != self.generation || self.state == PlaybackState::Idle {
                continue;
            }
            match event {
                SinkEvent::Started => return SessionStatus::Playing,
                SinkEvent::Finished => {
                    self.state = PlaybackState::Idle;
                    return SessionStatus::Idle;
                }
                SinkEvent::Failed(message) => {
                    self.state = PlaybackState::Idle;
                    return SessionStatus::Error(message);
                }
            }
        }
    }
}
