//! Tee of a transcoded stream into playback and the cache.
//!
//! A single pump task reads the source and forwards every chunk to the
//! playback channel first and the temp artifact second. The artifact is
//! finalized before the playback side sees end of stream.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::cache_index::{CacheIndex, TempArtifact};
use crate::source::fetch::{BoxReader, SourceStream};

/// Cache side of the tee.
pub struct CacheBranch {
    pub index: Arc<CacheIndex>,
    pub temp: TempArtifact,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct FanoutOptions {
    pub chunk_bytes: usize,
    pub channel_depth: usize,
    pub exit_timeout: Duration,
    pub finalize_on_error: bool,
}

/// Start the pump; returns the playback reader and the pump task.
///
/// `head` holds bytes already read from `source` for probing and is emitted
/// before anything else.
pub fn spawn(
    head: Bytes,
    source: SourceStream,
    cache: Option<CacheBranch>,
    options: FanoutOptions,
) -> (BoxReader, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(options.channel_depth.max(1));
    let pump = tokio::spawn(pump(head, source, tx, cache, options));
    let reader = StreamReader::new(ReceiverStream::new(rx));
    (Box::pin(reader), pump)
}

async fn pump(
    head: Bytes,
    source: SourceStream,
    tx: mpsc::Sender<io::Result<Bytes>>,
    mut cache: Option<CacheBranch>,
    options: FanoutOptions,
) {
    let SourceStream { mut reader, handle } = source;
    if !head.is_empty() && !forward(&tx, &mut cache, head).await {
        return;
    }

    let mut buf = BytesMut::with_capacity(options.chunk_bytes);
    loop {
        buf.reserve(options.chunk_bytes);
        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read,
            _ = tx.closed() => {
                tracing::debug!("playback consumer gone, abandoning stream");
                return;
            }
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if !forward(&tx, &mut cache, chunk).await {
                    return;
                }
            }
            Err(err) => {
                drop(reader);
                fail(&tx, cache, err, options).await;
                return;
            }
        }
    }
    drop(reader);

    match handle.finish(options.exit_timeout).await {
        Ok(()) => {
            if let Some(branch) = cache {
                let track_id = branch.temp.track_id().to_string();
                branch
                    .index
                    .finalize(branch.temp, &track_id, branch.title.as_deref())
                    .await;
            }
        }
        Err(err) => fail(&tx, cache, err, options).await,
    }
}

/// Send a chunk to playback, then to the cache branch.
///
/// Returns `false` when the playback consumer has gone away.
async fn forward(
    tx: &mpsc::Sender<io::Result<Bytes>>,
    cache: &mut Option<CacheBranch>,
    chunk: Bytes,
) -> bool {
    if tx.send(Ok(chunk.clone())).await.is_err() {
        tracing::debug!("playback consumer gone, abandoning stream");
        return false;
    }
    if let Some(branch) = cache.as_mut() {
        if let Err(err) = branch.temp.write(&chunk).await {
            tracing::warn!(
                track_id = %branch.temp.track_id(),
                error = %err,
                "cache write failed, continuing without cache"
            );
            *cache = None;
        }
    }
    true
}

async fn fail(
    tx: &mpsc::Sender<io::Result<Bytes>>,
    cache: Option<CacheBranch>,
    err: io::Error,
    options: FanoutOptions,
) {
    tracing::warn!(error = %err, "source stream failed");
    if let Some(branch) = cache {
        if options.finalize_on_error {
            let track_id = branch.temp.track_id().to_string();
            branch
                .index
                .finalize(branch.temp, &track_id, branch.title.as_deref())
                .await;
        }
    }
    let _ = tx.send(Err(err)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::CacheSettings;
    use crate::source::fetch::SourceHandle;
    use crate::test_support::{FailingReader, Stalled, webm_payload};

    const OPTIONS: FanoutOptions = FanoutOptions {
        chunk_bytes: 1024,
        channel_depth: 4,
        exit_timeout: Duration::from_secs(1),
        finalize_on_error: false,
    };

    async fn index_in(dir: &std::path::Path) -> Arc<CacheIndex> {
        let mut settings = CacheSettings::with_dir(dir);
        settings.min_artifact_bytes = 16;
        let index = Arc::new(CacheIndex::new(settings));
        index.initialize().await.unwrap();
        index
    }

    fn source(reader: impl tokio::io::AsyncRead + Send + 'static) -> SourceStream {
        SourceStream::new(Box::pin(reader), SourceHandle::detached())
    }

    fn tmp_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    #[tokio::test]
    async fn head_and_body_reach_playback_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path()).await;
        let payload = webm_payload(5000);
        let temp = index.begin("abc").await.unwrap();

        let (mut reader, _pump) = spawn(
            Bytes::copy_from_slice(&payload[..100]),
            source(std::io::Cursor::new(payload[100..].to_vec())),
            Some(CacheBranch {
                index: index.clone(),
                temp,
                title: Some("Song".to_string()),
            }),
            OPTIONS,
        );
        let mut played = Vec::new();
        reader.read_to_end(&mut played).await.unwrap();

        assert_eq!(played, payload);
        let hit = index.lookup("abc").await.unwrap();
        assert_eq!(std::fs::read(hit.path).unwrap(), payload);
        assert_eq!(tmp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn stream_error_reaches_consumer_and_discards_temp() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path()).await;
        let temp = index.begin("abc").await.unwrap();
        let reader = tokio::io::AsyncReadExt::chain(
            std::io::Cursor::new(webm_payload(4096)),
            FailingReader,
        );

        let (mut playback, pump) = spawn(
            Bytes::new(),
            source(reader),
            Some(CacheBranch {
                index: index.clone(),
                temp,
                title: None,
            }),
            OPTIONS,
        );
        let mut played = Vec::new();
        assert!(playback.read_to_end(&mut played).await.is_err());
        pump.await.unwrap();

        assert!(index.lookup("abc").await.is_none());
        assert_eq!(tmp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn finalize_on_error_keeps_partial_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path()).await;
        let temp = index.begin("abc").await.unwrap();
        let reader = tokio::io::AsyncReadExt::chain(
            std::io::Cursor::new(webm_payload(4096)),
            FailingReader,
        );
        let options = FanoutOptions {
            finalize_on_error: true,
            ..OPTIONS
        };

        let (mut playback, pump) = spawn(
            Bytes::new(),
            source(reader),
            Some(CacheBranch {
                index: index.clone(),
                temp,
                title: None,
            }),
            options,
        );
        let mut played = Vec::new();
        assert!(playback.read_to_end(&mut played).await.is_err());
        pump.await.unwrap();

        assert!(index.lookup("abc").await.is_some());
    }

    #[tokio::test]
    async fn dropped_consumer_abandons_cache_branch() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path()).await;
        let temp = index.begin("abc").await.unwrap();
        let reader =
            tokio::io::AsyncReadExt::chain(std::io::Cursor::new(webm_payload(2048)), Stalled);

        let (mut playback, pump) = spawn(
            Bytes::new(),
            source(reader),
            Some(CacheBranch {
                index: index.clone(),
                temp,
                title: None,
            }),
            OPTIONS,
        );
        let mut first = [0u8; 512];
        playback.read_exact(&mut first).await.unwrap();
        drop(playback);

        tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(index.lookup("abc").await.is_none());
        assert_eq!(tmp_files(dir.path()), 0);
    }
}
