//! Fetch strategies producing raw audio byte streams.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use guild_audio_types::Track;

use crate::error::ResolutionError;

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Subprocesses and helper tasks backing a byte stream.
///
/// Children are spawned with `kill_on_drop`, tasks are aborted on drop, so
/// dropping the handle releases everything the stream was using.
#[derive(Default)]
pub struct SourceHandle {
    children: Vec<(&'static str, Child)>,
    tasks: Vec<(&'static str, JoinHandle<io::Result<()>>)>,
}

impl SourceHandle {
    /// Handle for streams without processes (files, HTTP bodies, test doubles).
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn push_child(&mut self, label: &'static str, child: Child) {
        self.children.push((label, child));
    }

    pub fn push_task(&mut self, label: &'static str, task: JoinHandle<io::Result<()>>) {
        self.tasks.push((label, task));
    }

    /// Take over everything owned by `other`.
    pub fn merge(&mut self, mut other: SourceHandle) {
        self.children.append(&mut other.children);
        self.tasks.append(&mut other.tasks);
    }

    /// Wait for the stream producers to exit after end of stream.
    ///
    /// Fails when a child exits unsuccessfully, does not exit within
    /// `timeout`, or a helper task failed.
    pub async fn finish(mut self, timeout: Duration) -> io::Result<()> {
        for (label, mut child) in self.children.drain(..) {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => {
                    return Err(io::Error::other(format!("{label} exited with {status}")));
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{label} did not exit within {timeout:?}"),
                    ));
                }
            }
        }
        for (label, task) in self.tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {}
                Ok(Err(err)) => return Err(io::Error::new(err.kind(), format!("{label}: {err}"))),
                Err(err) if err.is_cancelled() => {}
                Err(err) => return Err(io::Error::other(format!("{label} panicked: {err}"))),
            }
        }
        Ok(())
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        for (_, task) in &self.tasks {
            task.abort();
        }
    }
}

/// A raw byte stream plus the resources producing it.
pub struct SourceStream {
    pub reader: BoxReader,
    pub handle: SourceHandle,
}

impl SourceStream {
    pub fn new(reader: BoxReader, handle: SourceHandle) -> Self {
        Self { reader, handle }
    }
}

/// One way of obtaining audio bytes for a track.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether this strategy can be tried for `track` at all.
    fn supports(&self, track: &Track) -> bool;

    /// Open a byte stream for `track`.
    async fn open(&self, track: &Track) -> Result<SourceStream, ResolutionError>;
}

/// Primary strategy: pipe the best audio format out of `yt-dlp`.
pub struct YtDlpFetcher {
    binary: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn supports(&self, track: &Track) -> bool {
        self.binary.is_some() && !track.source_ref.trim().is_empty()
    }

    async fn open(&self, track: &Track) -> Result<SourceStream, ResolutionError> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| ResolutionError::NoStrategy(track.source_ref.clone()))?;
        let mut child = Command::new(binary)
            .args([
                "-f",
                "bestaudio/best",
                "--no-playlist",
                "--quiet",
                "--no-warnings",
                "-o",
                "-",
            ])
            .arg(&track.source_ref)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ResolutionError::Fetch {
                strategy: self.name(),
                message: format!("spawn {}: {err}", binary.display()),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| ResolutionError::Fetch {
            strategy: self.name(),
            message: "stdout not captured".to_string(),
        })?;
        let mut handle = SourceHandle::detached();
        if let Some(stderr) = child.stderr.take() {
            handle.push_task("yt-dlp stderr", log_stderr("yt-dlp", stderr));
        }
        handle.push_child("yt-dlp", child);
        tracing::debug!(track_id = %track.id, "yt-dlp started");
        Ok(SourceStream::new(Box::pin(stdout), handle))
    }
}

/// Secondary strategy: stream a direct http(s) media URL.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, track: &Track) -> bool {
        let source = track.source_ref.trim();
        source.starts_with("http://") || source.starts_with("https://")
    }

    async fn open(&self, track: &Track) -> Result<SourceStream, ResolutionError> {
        let fetch_error = |err: reqwest::Error| ResolutionError::Fetch {
            strategy: "http",
            message: err.to_string(),
        };
        let response = self
            .client
            .get(track.source_ref.trim())
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(fetch_error)?;
        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(SourceStream::new(
            Box::pin(StreamReader::new(body)),
            SourceHandle::detached(),
        ))
    }
}

/// Forward a child's stderr to the log, one line per event.
pub(crate) fn log_stderr(label: &'static str, stderr: ChildStderr) -> JoinHandle<io::Result<()>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if !line.is_empty() {
                tracing::debug!(process = label, "{line}");
            }
        }
        Ok(())
    })
}
