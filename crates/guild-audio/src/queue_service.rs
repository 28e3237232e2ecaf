//! Per-guild queue worker + auto-advance logic.
//!
//! Each guild gets one worker task that owns the queue state, the playback
//! session and the in-flight resolve. Callers talk to it through a cloneable
//! `QueueHandle`; commands are applied one at a time, in arrival order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use guild_audio_types::{PlaybackEndReason, PlaybackState, QueueSnapshot, Track};

use crate::config::QueueSettings;
use crate::error::{QueueError, ResolutionError};
use crate::events::{EventBus, QueueEvent};
use crate::playback_session::{AudioSink, PlaybackSession, SessionStatus};
use crate::queue_state::QueueState;
use crate::source::{AudioStream, SourcePipeline};
use crate::voice_transport::VoiceConnection;

const COMMAND_BUFFER: usize = 64;

enum QueueCommand {
    Add {
        track: Track,
        reply: oneshot::Sender<Result<usize, QueueError>>,
    },
    Remove {
        position: usize,
        reply: oneshot::Sender<Result<Track, QueueError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Skip {
        reply: oneshot::Sender<Result<Track, QueueError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetVolume {
        volume: f32,
        reply: oneshot::Sender<f32>,
    },
    ToggleLoop {
        reply: oneshot::Sender<bool>,
    },
    Attach {
        connection: Arc<dyn VoiceConnection>,
        reply: oneshot::Sender<()>,
    },
}

/// Control surface of one guild queue.
#[derive(Clone)]
pub struct QueueHandle {
    guild_id: Arc<str>,
    cmd_tx: mpsc::Sender<QueueCommand>,
    snapshot_rx: watch::Receiver<QueueSnapshot>,
}

impl QueueHandle {
    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    /// Append a track; returns its 1-based position in the pending list.
    pub async fn add(&self, track: Track) -> Result<usize, QueueError> {
        self.request(|reply| QueueCommand::Add { track, reply })
            .await?
    }

    /// Remove the pending track at 1-based `position`.
    pub async fn remove(&self, position: usize) -> Result<Track, QueueError> {
        self.request(|reply| QueueCommand::Remove { position, reply })
            .await?
    }

    pub async fn pause(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Pause { reply }).await?
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Resume { reply }).await?
    }

    /// Stop the current track and move on; returns the skipped track.
    pub async fn skip(&self) -> Result<Track, QueueError> {
        self.request(|reply| QueueCommand::Skip { reply }).await?
    }

    /// Clear the queue, stop playback and leave the voice channel.
    pub async fn stop(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Stop { reply }).await
    }

    /// Returns the applied (clamped) volume.
    pub async fn set_volume(&self, volume: f32) -> Result<f32, QueueError> {
        self.request(|reply| QueueCommand::SetVolume { volume, reply })
            .await
    }

    /// Returns the new loop flag.
    pub async fn toggle_loop(&self) -> Result<bool, QueueError> {
        self.request(|reply| QueueCommand::ToggleLoop { reply })
            .await
    }

    /// Bind the queue's sink to a voice connection.
    pub async fn attach(&self, connection: Arc<dyn VoiceConnection>) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Attach { connection, reply })
            .await
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_rx.clone()
    }

    /// True once the worker has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let closed = || QueueError::Closed(self.guild_id.to_string());
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply))
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }
}

struct Resolved {
    generation: u64,
    track: Track,
    result: Result<AudioStream, ResolutionError>,
}

/// The worker behind a `QueueHandle`.
pub struct QueueService {
    state: QueueState,
    settings: QueueSettings,
    session: PlaybackSession,
    pipeline: Arc<SourcePipeline>,
    events: EventBus,
    cmd_rx: mpsc::Receiver<QueueCommand>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
    resolve_generation: u64,
    resolving: Option<JoinHandle<()>>,
    resolved_tx: mpsc::UnboundedSender<Resolved>,
    resolved_rx: mpsc::UnboundedReceiver<Resolved>,
    skip_requested: bool,
    track_announced: bool,
}

impl QueueService {
    /// Spawn the worker for `guild_id` and return its handle.
    ///
    /// The worker exits once every handle has been dropped.
    pub fn spawn(
        guild_id: &str,
        settings: QueueSettings,
        pipeline: Arc<SourcePipeline>,
        sink: Arc<dyn AudioSink>,
        events: EventBus,
    ) -> QueueHandle {
        let state = QueueState::new(guild_id, &settings);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        let service = QueueService {
            state,
            settings,
            session: PlaybackSession::new(sink),
            pipeline,
            events,
            cmd_rx,
            snapshot_tx,
            resolve_generation: 0,
            resolving: None,
            resolved_tx,
            resolved_rx,
            skip_requested: false,
            track_announced: false,
        };
        tokio::spawn(service.run());
        QueueHandle {
            guild_id: Arc::from(guild_id),
            cmd_tx,
            snapshot_rx,
        }
    }

    async fn run(mut self) {
        tracing::debug!(guild_id = %self.state.guild_id(), "queue worker started");
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                status = self.session.next_status() => self.handle_status(status),
                Some(resolved) = self.resolved_rx.recv() => self.handle_resolved(resolved),
            }
            self.publish_snapshot();
        }
        self.cancel_resolve();
        self.session.stop_track();
        tracing::debug!(guild_id = %self.state.guild_id(), "queue worker stopped");
    }

    fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Add { track, reply } => {
                let result = self.add(track);
                self.reply(reply, result);
            }
            QueueCommand::Remove { position, reply } => {
                let result = self.state.remove(position);
                if let Ok(track) = &result {
                    tracing::info!(guild_id = %self.state.guild_id(), track_id = %track.id, position, "track removed");
                    self.events.queue_changed(self.state.guild_id());
                }
                self.reply(reply, result);
            }
            QueueCommand::Pause { reply } => {
                let result = self.pause();
                self.reply(reply, result);
            }
            QueueCommand::Resume { reply } => {
                let result = self.resume();
                self.reply(reply, result);
            }
            QueueCommand::Skip { reply } => {
                let result = self.skip();
                self.reply(reply, result);
            }
            QueueCommand::Stop { reply } => {
                self.stop();
                self.reply(reply, ());
            }
            QueueCommand::SetVolume { volume, reply } => {
                let applied = self.state.set_volume(volume);
                self.session.set_volume(applied);
                self.events.queue_changed(self.state.guild_id());
                self.reply(reply, applied);
            }
            QueueCommand::ToggleLoop { reply } => {
                let enabled = self.state.toggle_loop();
                tracing::info!(guild_id = %self.state.guild_id(), enabled, "loop toggled");
                self.events.queue_changed(self.state.guild_id());
                self.reply(reply, enabled);
            }
            QueueCommand::Attach { connection, reply } => {
                self.session.attach(connection);
                self.reply(reply, ());
            }
        }
    }

    /// Publish the snapshot first so callers observe the state they caused.
    fn reply<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish_snapshot();
        let _ = reply.send(value);
    }

    fn add(&mut self, track: Track) -> Result<usize, QueueError> {
        let track_id = track.id.clone();
        let position = self.state.push(track)?;
        tracing::info!(guild_id = %self.state.guild_id(), track_id = %track_id, position, "track queued");
        self.events.queue_changed(self.state.guild_id());
        if self.state.is_idle() && self.resolving.is_none() {
            self.advance();
        }
        Ok(position)
    }

    fn pause(&mut self) -> Result<(), QueueError> {
        self.state.pause()?;
        // While resolving, the pause is applied once the stream starts.
        if self.resolving.is_none() {
            self.session.pause();
        }
        self.publish(QueueEvent::PauseChanged {
            guild_id: self.state.guild_id().to_string(),
            paused: true,
        });
        Ok(())
    }

    fn resume(&mut self) -> Result<(), QueueError> {
        self.state.resume()?;
        if self.resolving.is_none() {
            self.session.resume();
        }
        self.publish(QueueEvent::PauseChanged {
            guild_id: self.state.guild_id().to_string(),
            paused: false,
        });
        Ok(())
    }

    fn skip(&mut self) -> Result<Track, QueueError> {
        let track = self
            .state
            .current()
            .cloned()
            .ok_or(QueueError::NothingPlaying)?;
        if self.skip_requested {
            // The pending Idle already ends this track.
            return Ok(track);
        }
        tracing::info!(guild_id = %self.state.guild_id(), track_id = %track.id, "skipping track");
        if self.resolving.is_none() && self.session.stop_track() {
            // The session reports Idle next; the flag makes it advance even when looping.
            self.skip_requested = true;
        } else {
            self.end_current(PlaybackEndReason::Stopped);
            self.advance();
        }
        Ok(track)
    }

    fn stop(&mut self) {
        self.cancel_resolve();
        let removed = self.state.clear();
        self.skip_requested = false;
        self.session.stop();
        tracing::info!(guild_id = %self.state.guild_id(), removed, "queue stopped");
        self.publish(QueueEvent::Stopped {
            guild_id: self.state.guild_id().to_string(),
        });
    }

    fn handle_status(&mut self, status: SessionStatus) {
        match status {
            SessionStatus::Playing => {
                if self.track_announced {
                    return;
                }
                if let Some(track) = self.state.current().cloned() {
                    self.track_announced = true;
                    tracing::info!(guild_id = %self.state.guild_id(), track_id = %track.id, "track started");
                    self.publish(QueueEvent::TrackStarted {
                        guild_id: self.state.guild_id().to_string(),
                        track,
                    });
                }
            }
            SessionStatus::Paused => {
                tracing::debug!(guild_id = %self.state.guild_id(), "playback paused");
            }
            SessionStatus::Idle => {
                let skipped = std::mem::take(&mut self.skip_requested);
                if self.state.current().is_none() {
                    return;
                }
                if skipped {
                    self.end_current(PlaybackEndReason::Stopped);
                    self.advance();
                } else if self.state.loop_enabled() {
                    self.replay_current(PlaybackEndReason::Eof);
                } else {
                    self.end_current(PlaybackEndReason::Eof);
                    self.advance();
                }
            }
            SessionStatus::Error(message) => {
                let skipped = std::mem::take(&mut self.skip_requested);
                if self.state.current().is_none() {
                    return;
                }
                tracing::warn!(guild_id = %self.state.guild_id(), error = %message, "playback error");
                if !skipped && self.state.loop_enabled() && self.settings.loop_failed_tracks {
                    self.replay_current(PlaybackEndReason::Error);
                } else {
                    self.end_current(PlaybackEndReason::Error);
                    self.advance();
                }
            }
        }
    }

    fn handle_resolved(&mut self, resolved: Resolved) {
        let Resolved {
            generation,
            track,
            result,
        } = resolved;
        if generation != self.resolve_generation {
            tracing::debug!(track_id = %track.id, "dropping stale resolve");
            return;
        }
        self.resolving = None;
        match result {
            Ok(stream) => {
                tracing::debug!(
                    guild_id = %self.state.guild_id(),
                    track_id = %track.id,
                    origin = %stream.origin,
                    format = %stream.format,
                    "track resolved"
                );
                self.session.play(stream, self.state.volume());
                if self.state.playback() == PlaybackState::Paused {
                    self.session.pause();
                }
            }
            Err(err) => {
                tracing::warn!(guild_id = %self.state.guild_id(), track_id = %track.id, error = %err, "track failed, skipping");
                self.state.finish_current();
                self.publish(QueueEvent::TrackFailed {
                    guild_id: self.state.guild_id().to_string(),
                    track,
                    error: err.to_string(),
                });
                self.advance();
            }
        }
    }

    /// Start the next pending track, or go idle when there is none.
    fn advance(&mut self) {
        self.cancel_resolve();
        match self.state.begin_next() {
            Some(track) => self.start_resolve(track),
            None => {
                tracing::info!(guild_id = %self.state.guild_id(), "queue drained");
                self.publish(QueueEvent::Drained {
                    guild_id: self.state.guild_id().to_string(),
                });
                if self.settings.leave_when_empty && self.session.connection().is_some() {
                    self.session.stop();
                }
            }
        }
        self.events.queue_changed(self.state.guild_id());
    }

    fn replay_current(&mut self, reason: PlaybackEndReason) {
        let Some(track) = self.state.restart_current() else {
            return;
        };
        self.publish(QueueEvent::TrackEnded {
            guild_id: self.state.guild_id().to_string(),
            track: track.clone(),
            reason,
        });
        tracing::debug!(guild_id = %self.state.guild_id(), track_id = %track.id, "looping track");
        self.start_resolve(track);
    }

    fn end_current(&mut self, reason: PlaybackEndReason) {
        self.cancel_resolve();
        if let Some(track) = self.state.finish_current() {
            self.publish(QueueEvent::TrackEnded {
                guild_id: self.state.guild_id().to_string(),
                track,
                reason,
            });
        }
    }

    fn start_resolve(&mut self, track: Track) {
        self.resolve_generation += 1;
        self.track_announced = false;
        let generation = self.resolve_generation;
        let pipeline = self.pipeline.clone();
        let tx = self.resolved_tx.clone();
        tracing::debug!(guild_id = %self.state.guild_id(), track_id = %track.id, "resolving track");
        self.resolving = Some(tokio::spawn(async move {
            let result = pipeline.resolve(&track).await;
            let _ = tx.send(Resolved {
                generation,
                track,
                result,
            });
        }));
    }

    fn cancel_resolve(&mut self) {
        if let Some(task) = self.resolving.take() {
            task.abort();
            self.resolve_generation += 1;
        }
    }

    fn publish(&self, event: QueueEvent) {
        self.events.publish(event);
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.state.snapshot());
    }
}
