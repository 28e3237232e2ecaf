//! Guild id → queue registry.
//!
//! Creates queues on first use, joins voice channels with a bounded wait and
//! tears queues down when their connection is lost for good.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{QueueSettings, VoiceSettings};
use crate::error::TransportError;
use crate::events::{EventBus, QueueEvent};
use crate::queue_service::{QueueHandle, QueueService};
use crate::source::SourcePipeline;
use crate::voice_transport::{ConnectionState, VoiceConnection, VoiceTransport, connect_with_timeout};

struct RegistryEntry {
    queue: QueueHandle,
    /// Bumped on every successful join; stale connection watchers compare it.
    join_id: u64,
}

struct RegistryInner {
    queues: Mutex<HashMap<String, RegistryEntry>>,
    next_join_id: AtomicU64,
    pipeline: Arc<SourcePipeline>,
    transport: Arc<dyn VoiceTransport>,
    events: EventBus,
    queue_settings: QueueSettings,
    voice_settings: VoiceSettings,
}

/// Shared registry; clones refer to the same map.
#[derive(Clone)]
pub struct QueueRegistry {
    inner: Arc<RegistryInner>,
}

impl QueueRegistry {
    pub fn new(
        pipeline: Arc<SourcePipeline>,
        transport: Arc<dyn VoiceTransport>,
        events: EventBus,
        queue_settings: QueueSettings,
        voice_settings: VoiceSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                queues: Mutex::new(HashMap::new()),
                next_join_id: AtomicU64::new(0),
                pipeline,
                transport,
                events,
                queue_settings,
                voice_settings,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Queue for `guild_id`, created on first use.
    pub fn get(&self, guild_id: &str) -> QueueHandle {
        let mut queues = self.lock_queues();
        if let Some(entry) = queues.get(guild_id) {
            if !entry.queue.is_closed() {
                return entry.queue.clone();
            }
        }
        let sink = self.inner.transport.create_sink(guild_id);
        let queue = QueueService::spawn(
            guild_id,
            self.inner.queue_settings.clone(),
            self.inner.pipeline.clone(),
            sink,
            self.inner.events.clone(),
        );
        tracing::info!(guild_id, "queue created");
        queues.insert(
            guild_id.to_string(),
            RegistryEntry {
                queue: queue.clone(),
                join_id: 0,
            },
        );
        queue
    }

    /// Queue for `guild_id` if one exists.
    pub fn find(&self, guild_id: &str) -> Option<QueueHandle> {
        self.lock_queues()
            .get(guild_id)
            .map(|entry| entry.queue.clone())
    }

    /// Forget the queue without stopping it.
    pub fn delete(&self, guild_id: &str) -> Option<QueueHandle> {
        self.lock_queues()
            .remove(guild_id)
            .map(|entry| entry.queue)
    }

    /// Stop the queue, leave the voice channel and forget it.
    pub async fn teardown(&self, guild_id: &str) -> bool {
        let Some(queue) = self.delete(guild_id) else {
            return false;
        };
        if let Err(err) = queue.stop().await {
            tracing::debug!(guild_id, error = %err, "queue already closed");
        }
        tracing::info!(guild_id, "queue torn down");
        true
    }

    pub fn guild_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_queues().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Join a voice channel and bind the guild's queue to it.
    ///
    /// When the connection is not ready within the configured timeout the
    /// queue is torn down and the error returned.
    pub async fn join(&self, guild_id: &str, channel_id: &str) -> Result<QueueHandle, TransportError> {
        let queue = self.get(guild_id);
        let connection = match connect_with_timeout(
            self.inner.transport.as_ref(),
            guild_id,
            channel_id,
            self.inner.voice_settings.connect_timeout,
        )
        .await
        {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(guild_id, channel_id, error = %err, "voice join failed");
                self.teardown(guild_id).await;
                return Err(err);
            }
        };
        if queue.attach(connection.clone()).await.is_err() {
            connection.destroy();
            return Err(TransportError::Disconnected);
        }
        let join_id = self.record_join(guild_id);
        self.watch_connection(guild_id.to_string(), connection, join_id);
        Ok(queue)
    }

    fn record_join(&self, guild_id: &str) -> u64 {
        let join_id = self.inner.next_join_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(entry) = self.lock_queues().get_mut(guild_id) {
            entry.join_id = join_id;
        }
        join_id
    }

    fn is_current_join(&self, guild_id: &str, join_id: u64) -> bool {
        self.lock_queues()
            .get(guild_id)
            .is_some_and(|entry| entry.join_id == join_id)
    }

    /// Tear the queue down when the connection drops and does not start
    /// reconnecting within the grace period.
    fn watch_connection(&self, guild_id: String, connection: Arc<dyn VoiceConnection>, join_id: u64) {
        let registry = self.clone();
        let grace = self.inner.voice_settings.reconnect_grace;
        let mut state = connection.state();
        drop(connection);
        tokio::spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Destroyed => return,
                    ConnectionState::Disconnected => {
                        let recovered = tokio::time::timeout(
                            grace,
                            state.wait_for(|s| *s != ConnectionState::Disconnected),
                        )
                        .await
                        .map(|result| result.map(|s| *s));
                        match recovered {
                            Ok(Ok(ConnectionState::Destroyed)) => return,
                            Ok(Ok(_)) => {
                                tracing::info!(guild_id = %guild_id, "voice connection recovering");
                                continue;
                            }
                            Ok(Err(_)) | Err(_) => {
                                if !registry.is_current_join(&guild_id, join_id) {
                                    return;
                                }
                                tracing::warn!(guild_id = %guild_id, "voice connection lost");
                                registry.teardown(&guild_id).await;
                                registry.inner.events.publish(QueueEvent::ConnectionLost {
                                    guild_id: guild_id.clone(),
                                });
                                return;
                            }
                        }
                    }
                    ConnectionState::Connecting | ConnectionState::Ready => {}
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }
}
