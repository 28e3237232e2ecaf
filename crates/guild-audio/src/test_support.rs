//! Test doubles for the transport, sink and fetch seams.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{Semaphore, watch};

use guild_audio_types::{QueueSnapshot, Track, TrackDuration};

use crate::cache_index::CacheIndex;
use crate::config::{CacheSettings, PipelineSettings};
use crate::error::{ResolutionError, TransportError};
use crate::playback_session::{AudioSink, SinkEvents};
use crate::queue_service::QueueHandle;
use crate::source::fetch::{Fetcher, SourceHandle, SourceStream};
use crate::source::probe::ContainerFormat;
use crate::source::transcode::Transcoder;
use crate::source::{AudioStream, SourcePipeline, StreamOrigin};
use crate::voice_transport::{ConnectionState, VoiceConnection, VoiceTransport};

pub fn track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        title: format!("title {id}"),
        source_ref: format!("https://example.com/watch/{id}"),
        duration: TrackDuration::Seconds(180),
        author: "someone".to_string(),
        thumbnail_ref: None,
    }
}

/// `len` bytes starting with an EBML header.
pub fn webm_payload(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x1A, 0x45, 0xDF, 0xA3];
    bytes.extend((0..len.saturating_sub(4)).map(|i| (i % 251) as u8));
    bytes.truncate(len);
    bytes
}

pub fn test_stream() -> AudioStream {
    AudioStream::new(
        ContainerFormat::Webm,
        StreamOrigin::Cache,
        Box::pin(io::Cursor::new(webm_payload(64))),
    )
}

/// Pipeline with a cache in `dir` and a single fake strategy.
pub async fn pipeline_with(dir: &Path, fetcher: Arc<FakeFetcher>) -> Arc<SourcePipeline> {
    let mut settings = CacheSettings::with_dir(dir);
    settings.min_artifact_bytes = 16;
    let cache = Arc::new(CacheIndex::new(settings));
    cache.initialize().await.unwrap();
    Arc::new(SourcePipeline::with_parts(
        PipelineSettings::default(),
        Some(cache),
        vec![fetcher],
        Arc::new(PassthroughTranscoder),
    ))
}

/// Wait until the queue publishes a snapshot matching `pred`.
pub async fn wait_snapshot(
    queue: &QueueHandle,
    pred: impl Fn(&QueueSnapshot) -> bool,
) -> QueueSnapshot {
    let mut rx = queue.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
        .await
        .expect("snapshot condition not reached")
        .expect("queue worker gone")
        .clone();
    snapshot
}

/// Reader that always fails.
pub struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("source failed")))
    }
}

/// Reader that never produces data nor ends.
pub struct Stalled;

impl AsyncRead for Stalled {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

#[derive(Clone)]
pub enum FetchBehavior {
    Payload(Vec<u8>),
    Empty,
    OpenError,
    StreamError(Vec<u8>),
}

pub struct FakeFetcher {
    name: &'static str,
    behavior: FetchBehavior,
    supported: bool,
    fail_ids: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    opens: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(name: &'static str, behavior: FetchBehavior) -> Self {
        Self {
            name,
            behavior,
            supported: true,
            fail_ids: HashSet::new(),
            gate: None,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn serving(name: &'static str, payload: Vec<u8>) -> Self {
        Self::new(name, FetchBehavior::Payload(payload))
    }

    pub fn fail_for(mut self, track_id: &str) -> Self {
        self.fail_ids.insert(track_id.to_string());
        self
    }

    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    /// Make `open` wait for a permit on [`FakeFetcher::gate`].
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn gate(&self) -> Option<Arc<Semaphore>> {
        self.gate.clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports(&self, _track: &Track) -> bool {
        self.supported
    }

    async fn open(&self, track: &Track) -> Result<SourceStream, ResolutionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let failure = || ResolutionError::Fetch {
            strategy: self.name,
            message: "fake failure".to_string(),
        };
        if self.fail_ids.contains(&track.id) {
            return Err(failure());
        }
        let reader: Pin<Box<dyn AsyncRead + Send>> = match &self.behavior {
            FetchBehavior::Payload(bytes) => Box::pin(io::Cursor::new(bytes.clone())),
            FetchBehavior::Empty => Box::pin(io::Cursor::new(Vec::new())),
            FetchBehavior::OpenError => return Err(failure()),
            FetchBehavior::StreamError(bytes) => {
                Box::pin(io::Cursor::new(bytes.clone()).chain(FailingReader))
            }
        };
        Ok(SourceStream::new(reader, SourceHandle::detached()))
    }
}

pub struct PassthroughTranscoder;

impl Transcoder for PassthroughTranscoder {
    fn transcode(&self, input: SourceStream) -> Result<SourceStream, ResolutionError> {
        Ok(input)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Play { volume: f32 },
    Pause,
    Resume,
    Stop,
    SetVolume(f32),
}

#[derive(Default)]
struct FakeSinkState {
    calls: Vec<SinkCall>,
    current: Option<(Option<AudioStream>, SinkEvents)>,
    plays: usize,
    finished: usize,
    played: Vec<Vec<u8>>,
}

/// Sink recording every call.
///
/// A manual sink holds the stream until the test ends it; a draining sink
/// reads each stream to the end and reports completion on its own.
pub struct FakeSink {
    drain: bool,
    inner: Arc<Mutex<FakeSinkState>>,
}

impl FakeSink {
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            drain: false,
            inner: Arc::default(),
        })
    }

    pub fn draining() -> Arc<Self> {
        Arc::new(Self {
            drain: true,
            inner: Arc::default(),
        })
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn plays(&self) -> usize {
        self.inner.lock().unwrap().plays
    }

    pub fn finished(&self) -> usize {
        self.inner.lock().unwrap().finished
    }

    pub fn played_bytes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().played.clone()
    }

    pub fn current_events(&self) -> Option<SinkEvents> {
        self.inner
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(|(_, events)| events.clone())
    }

    /// Report natural end of the current stream.
    pub fn finish_current(&self) {
        let current = self.inner.lock().unwrap().current.take();
        if let Some((_, events)) = current {
            events.finished();
        }
    }

    pub fn fail_current(&self, message: &str) {
        let current = self.inner.lock().unwrap().current.take();
        if let Some((_, events)) = current {
            events.failed(message);
        }
    }
}

impl AudioSink for FakeSink {
    fn play(&self, mut stream: AudioStream, volume: f32, events: SinkEvents) {
        {
            let mut state = self.inner.lock().unwrap();
            state.calls.push(SinkCall::Play { volume });
            state.plays += 1;
        }
        events.started();
        if !self.drain {
            self.inner.lock().unwrap().current = Some((Some(stream), events));
            return;
        }
        self.inner.lock().unwrap().current = Some((None, events.clone()));
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut bytes = Vec::new();
            let result = stream.read_to_end(&mut bytes).await;
            {
                let mut state = inner.lock().unwrap();
                state.played.push(bytes);
                state.finished += 1;
                state.current = None;
            }
            match result {
                Ok(_) => events.finished(),
                Err(err) => events.failed(err.to_string()),
            }
        });
    }

    fn pause(&self) -> bool {
        self.inner.lock().unwrap().calls.push(SinkCall::Pause);
        true
    }

    fn resume(&self) -> bool {
        self.inner.lock().unwrap().calls.push(SinkCall::Resume);
        true
    }

    fn stop(&self) {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(SinkCall::Stop);
        state.current = None;
    }

    fn set_volume(&self, volume: f32) {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(SinkCall::SetVolume(volume));
    }
}

pub struct FakeConnection {
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: AtomicUsize,
    destroyed: AtomicBool,
}

impl FakeConnection {
    pub fn new(initial: ConnectionState) -> Arc<Self> {
        let (state_tx, _) = watch::channel(initial);
        Arc::new(Self {
            state_tx,
            subscriptions: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl VoiceConnection for FakeConnection {
    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn subscribe(&self, _sink: Arc<dyn AudioSink>) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Destroyed);
    }
}

/// Transport handing out fake connections in a fixed initial state.
pub struct FakeTransport {
    initial: ConnectionState,
    join_error: Option<TransportError>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    sinks: Mutex<Vec<Arc<FakeSink>>>,
}

impl FakeTransport {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            initial,
            join_error: None,
            connections: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing(error: TransportError) -> Self {
        Self {
            join_error: Some(error),
            ..Self::new(ConnectionState::Connecting)
        }
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }

    pub fn sinks_created(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn join(
        &self,
        _guild_id: &str,
        _channel_id: &str,
    ) -> Result<Arc<dyn VoiceConnection>, TransportError> {
        if let Some(err) = &self.join_error {
            return Err(err.clone());
        }
        let connection = FakeConnection::new(self.initial);
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }

    fn create_sink(&self, _guild_id: &str) -> Arc<dyn AudioSink> {
        let sink = FakeSink::manual();
        self.sinks.lock().unwrap().push(sink.clone());
        sink
    }
}
