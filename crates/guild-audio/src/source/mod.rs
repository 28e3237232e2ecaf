//! Source pipeline: cache lookup, fetch, transcode and fan-out.
//!
//! `SourcePipeline::resolve` turns a track into an `AudioStream` ready for a
//! sink. Network streams are teed into the cache while they play.

pub mod fanout;
pub mod fetch;
pub mod probe;
pub mod transcode;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use guild_audio_types::Track;

use crate::cache_index::{CacheIndex, CachedArtifact};
use crate::config::PipelineSettings;
use crate::error::ResolutionError;
use fanout::{CacheBranch, FanoutOptions};
use fetch::{BoxReader, Fetcher, HttpFetcher, YtDlpFetcher};
use probe::ContainerFormat;
use transcode::{FfmpegTranscoder, Transcoder};

/// Where a stream's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Cache,
    Network { strategy: &'static str },
}

impl fmt::Display for StreamOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOrigin::Cache => f.write_str("cache"),
            StreamOrigin::Network { strategy } => write!(f, "network ({strategy})"),
        }
    }
}

/// Playable byte stream in a known container.
pub struct AudioStream {
    pub format: ContainerFormat,
    pub origin: StreamOrigin,
    reader: BoxReader,
}

impl AudioStream {
    pub fn new(format: ContainerFormat, origin: StreamOrigin, reader: BoxReader) -> Self {
        Self {
            format,
            origin,
            reader,
        }
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStream")
            .field("format", &self.format)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for AudioStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().reader.as_mut().poll_read(cx, buf)
    }
}

pub struct SourcePipeline {
    settings: PipelineSettings,
    cache: Option<Arc<CacheIndex>>,
    fetchers: Vec<Arc<dyn Fetcher>>,
    transcoder: Arc<dyn Transcoder>,
}

impl SourcePipeline {
    /// Default strategies: `yt-dlp`, then direct HTTP when enabled, through `ffmpeg`.
    pub fn new(settings: PipelineSettings, cache: Option<Arc<CacheIndex>>) -> Self {
        let mut fetchers: Vec<Arc<dyn Fetcher>> =
            vec![Arc::new(YtDlpFetcher::new(settings.yt_dlp_path.clone()))];
        if settings.http_fallback {
            fetchers.push(Arc::new(HttpFetcher::new(reqwest::Client::new())));
        }
        let transcoder = Arc::new(FfmpegTranscoder::from_settings(&settings));
        Self::with_parts(settings, cache, fetchers, transcoder)
    }

    pub fn with_parts(
        settings: PipelineSettings,
        cache: Option<Arc<CacheIndex>>,
        fetchers: Vec<Arc<dyn Fetcher>>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            settings,
            cache,
            fetchers,
            transcoder,
        }
    }

    pub fn cache(&self) -> Option<&Arc<CacheIndex>> {
        self.cache.as_ref()
    }

    /// Produce a playable stream for `track`.
    pub async fn resolve(&self, track: &Track) -> Result<AudioStream, ResolutionError> {
        if let Some(cache) = self.cache.as_ref() {
            if let Some(hit) = cache.lookup(&track.id).await {
                match self.open_cached(&hit).await {
                    Ok(stream) => {
                        tracing::debug!(track_id = %track.id, format = %stream.format, "playing from cache");
                        return Ok(stream);
                    }
                    Err(err) => {
                        tracing::warn!(track_id = %track.id, error = %err, "cached artifact unusable, fetching");
                    }
                }
            }
        }

        let mut last_error = None;
        for fetcher in &self.fetchers {
            if !fetcher.supports(track) {
                tracing::debug!(track_id = %track.id, strategy = fetcher.name(), "strategy unavailable");
                continue;
            }
            match self.open_network(fetcher.as_ref(), track).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    tracing::warn!(
                        track_id = %track.id,
                        strategy = fetcher.name(),
                        error = %err,
                        "fetch strategy failed"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(err) => ResolutionError::Exhausted(Box::new(err)),
            None => ResolutionError::NoStrategy(track.source_ref.clone()),
        })
    }

    async fn open_cached(&self, hit: &CachedArtifact) -> Result<AudioStream, ResolutionError> {
        let cache_error = |source| ResolutionError::CacheRead {
            path: hit.path.clone(),
            source,
        };
        let mut file = tokio::fs::File::open(&hit.path).await.map_err(cache_error)?;
        let head = read_head(&mut file, self.settings.probe_bytes)
            .await
            .map_err(cache_error)?;
        let format = self.detect(&head);
        let reader = std::io::Cursor::new(head).chain(file);
        Ok(AudioStream::new(format, StreamOrigin::Cache, Box::pin(reader)))
    }

    async fn open_network(
        &self,
        fetcher: &dyn Fetcher,
        track: &Track,
    ) -> Result<AudioStream, ResolutionError> {
        let strategy = fetcher.name();
        let raw = fetcher.open(track).await?;
        let mut source = self.transcoder.transcode(raw)?;
        let head = read_head(&mut source.reader, self.settings.probe_bytes)
            .await
            .map_err(|err| ResolutionError::Fetch {
                strategy,
                message: err.to_string(),
            })?;
        if head.is_empty() {
            return Err(ResolutionError::EmptyStream(strategy));
        }
        let format = self.detect(&head);

        let mut finalize_on_error = false;
        let mut cache_branch = None;
        if let Some(cache) = self.cache.as_ref().filter(|c| c.is_enabled()) {
            finalize_on_error = cache.settings().finalize_on_error;
            match cache.begin(&track.id).await {
                Ok(temp) => {
                    cache_branch = Some(CacheBranch {
                        index: cache.clone(),
                        temp,
                        title: Some(track.title.clone()),
                    })
                }
                Err(err) => {
                    tracing::warn!(track_id = %track.id, error = %err, "cannot open temp artifact, streaming without cache");
                }
            }
        }

        let options = FanoutOptions {
            chunk_bytes: self.settings.chunk_bytes,
            channel_depth: self.settings.channel_depth,
            exit_timeout: self.settings.exit_timeout,
            finalize_on_error,
        };
        let (reader, _pump) = fanout::spawn(Bytes::from(head), source, cache_branch, options);
        tracing::info!(track_id = %track.id, strategy, format = %format, "streaming from network");
        Ok(AudioStream::new(
            format,
            StreamOrigin::Network { strategy },
            reader,
        ))
    }

    fn detect(&self, head: &[u8]) -> ContainerFormat {
        probe::detect(head).unwrap_or_else(|| {
            tracing::debug!(
                fallback = %self.settings.fallback_format,
                "unrecognized container, using fallback"
            );
            self.settings.fallback_format
        })
    }
}

/// Read up to `limit` bytes, stopping early only at end of stream.
async fn read_head<R>(reader: &mut R, limit: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(head)
}
