//! Track lookup: free-text queries and URLs to `Track` metadata.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use guild_audio_types::{Track, TrackDuration};

use crate::error::LookupError;

#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Best match for a search query, if any.
    async fn resolve_by_query(&self, query: &str) -> Result<Option<Track>, LookupError>;

    /// Metadata for a direct URL, if it points at something playable.
    async fn resolve_by_url(&self, url: &str) -> Result<Option<Track>, LookupError>;

    fn is_url(&self, text: &str) -> bool {
        reqwest::Url::parse(text.trim())
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false)
    }
}

/// Dispatch user input to URL or query lookup.
pub async fn resolve_request(
    resolver: &dyn TrackResolver,
    text: &str,
) -> Result<Option<Track>, LookupError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if resolver.is_url(text) {
        resolver.resolve_by_url(text).await
    } else {
        resolver.resolve_by_query(text).await
    }
}

/// Resolver shelling out to `yt-dlp --dump-json`.
pub struct YtDlpResolver {
    binary: Option<PathBuf>,
}

impl YtDlpResolver {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    async fn dump_json(&self, target: &str) -> Result<Option<Track>, LookupError> {
        let binary = self.binary.as_ref().ok_or(LookupError::Unavailable)?;
        let output = Command::new(binary)
            .args([
                "--dump-json",
                "--no-playlist",
                "--skip-download",
                "--no-warnings",
            ])
            .arg(target)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| LookupError::Failed(format!("spawn {}: {err}", binary.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LookupError::Failed(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Ok(None);
        };
        let info: Value =
            serde_json::from_str(line).map_err(|err| LookupError::Malformed(err.to_string()))?;
        Ok(track_from_info(&info))
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve_by_query(&self, query: &str) -> Result<Option<Track>, LookupError> {
        tracing::debug!(query, "searching track");
        self.dump_json(&format!("ytsearch1:{query}")).await
    }

    async fn resolve_by_url(&self, url: &str) -> Result<Option<Track>, LookupError> {
        tracing::debug!(url, "resolving track url");
        self.dump_json(url).await
    }
}

/// Map a `yt-dlp` info document to a track; `None` without an id.
pub fn track_from_info(info: &Value) -> Option<Track> {
    let text = |key: &str| {
        info.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let id = text("id")?;
    let source_ref = text("webpage_url")
        .or_else(|| text("original_url"))
        .or_else(|| text("url"))?;
    let is_live = info.get("is_live").and_then(Value::as_bool).unwrap_or(false);
    let duration = match info.get("duration").and_then(Value::as_f64) {
        Some(secs) if !is_live && secs.is_finite() && secs >= 0.0 => {
            TrackDuration::Seconds(secs.round() as u64)
        }
        _ => TrackDuration::Live,
    };
    Some(Track {
        id,
        title: text("title").unwrap_or_else(|| "Unknown title".to_string()),
        source_ref,
        duration,
        author: text("uploader")
            .or_else(|| text("channel"))
            .unwrap_or_else(|| "Unknown".to_string()),
        thumbnail_ref: text("thumbnail"),
    })
}
