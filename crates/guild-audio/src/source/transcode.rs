//! Transcoding raw sources into the sink's container.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::PipelineSettings;
use crate::error::ResolutionError;
use crate::source::fetch::{SourceStream, log_stderr};

/// Turns an arbitrary audio byte stream into the output container.
pub trait Transcoder: Send + Sync {
    fn transcode(&self, input: SourceStream) -> Result<SourceStream, ResolutionError>;
}

/// `ffmpeg` emitting opus in webm at a fixed rate and channel count.
pub struct FfmpegTranscoder {
    binary: PathBuf,
    sample_rate: u32,
    channels: u16,
}

impl FfmpegTranscoder {
    pub fn new(binary: PathBuf, sample_rate: u32, channels: u16) -> Self {
        Self {
            binary,
            sample_rate,
            channels,
        }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(
            settings.ffmpeg_path.clone(),
            settings.sample_rate,
            settings.channels,
        )
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-analyzeduration",
            "0",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-vn",
            "-c:a",
            "libopus",
            "-f",
            "webm",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend([
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            self.channels.to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(&self, input: SourceStream) -> Result<SourceStream, ResolutionError> {
        let SourceStream {
            reader: mut input_reader,
            handle: input_handle,
        } = input;
        let mut child = Command::new(&self.binary)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ResolutionError::Transcode(format!("spawn {}: {err}", self.binary.display()))
            })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ResolutionError::Transcode("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ResolutionError::Transcode("stdout not captured".to_string()))?;

        let mut handle = input_handle;
        let feeder = tokio::spawn(async move {
            tokio::io::copy(&mut input_reader, &mut stdin).await?;
            stdin.shutdown().await
        });
        handle.push_task("ffmpeg feeder", feeder);
        if let Some(stderr) = child.stderr.take() {
            handle.push_task("ffmpeg stderr", log_stderr("ffmpeg", stderr));
        }
        handle.push_child("ffmpeg", child);
        Ok(SourceStream::new(Box::pin(stdout), handle))
    }
}
