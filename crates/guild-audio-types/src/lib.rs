use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Length of a track as reported by the resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackDuration {
    /// Finite recording length in whole seconds.
    Seconds(u64),
    /// Live stream without a known end.
    Live,
}

impl TrackDuration {
    /// Seconds for finite tracks, `None` for live streams.
    pub fn as_secs(&self) -> Option<u64> {
        match self {
            TrackDuration::Seconds(secs) => Some(*secs),
            TrackDuration::Live => None,
        }
    }
}

impl fmt::Display for TrackDuration {
    /// Formats as `m:ss`, `h:mm:ss` or `Live`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = match self {
            TrackDuration::Live => return f.write_str("Live"),
            TrackDuration::Seconds(secs) => *secs,
        };
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let seconds = secs % 60;
        if hours > 0 {
            write!(f, "{hours}:{minutes:02}:{seconds:02}")
        } else {
            write!(f, "{minutes}:{seconds:02}")
        }
    }
}

/// One playable unit requested into a guild queue.
///
/// Tracks are produced by a resolver and never mutated afterwards; the queue
/// only moves them between its pending list and the now-playing slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Resolver-defined stable id, also used as the cache key.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Locator handed to the fetch strategies (usually a URL).
    pub source_ref: String,
    /// Track length or the live sentinel.
    pub duration: TrackDuration,
    /// Uploader / artist name.
    pub author: String,
    /// Optional artwork locator.
    pub thumbnail_ref: Option<String>,
}

/// Coarse playback state of a guild queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// Reason why playback of a single track ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream.
    Eof,
    /// Fetch, transcode or sink error interrupted playback.
    Error,
    /// Playback was explicitly stopped or skipped.
    Stopped,
}

/// Read-only view of a guild queue for presentation layers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Guild this queue belongs to.
    pub guild_id: String,
    /// Track in the now-playing slot, if any.
    pub current: Option<Track>,
    /// Upcoming tracks in play order.
    pub pending: Vec<Track>,
    /// Current playback state.
    pub playback: PlaybackState,
    /// Whether the current track repeats when it ends.
    pub loop_enabled: bool,
    /// Output volume in `[0, 2]`.
    pub volume: f32,
}

impl QueueSnapshot {
    /// Empty idle snapshot for a freshly created queue.
    pub fn idle(guild_id: impl Into<String>, volume: f32) -> Self {
        Self {
            guild_id: guild_id.into(),
            current: None,
            pending: Vec::new(),
            playback: PlaybackState::Idle,
            loop_enabled: false,
            volume,
        }
    }

    /// Sum of the known durations of pending tracks; live tracks are skipped.
    pub fn pending_secs(&self) -> u64 {
        self.pending
            .iter()
            .filter_map(|track| track.duration.as_secs())
            .sum()
    }
}

/// Persisted cache index record, keyed by track id in `index.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Artifact file name relative to the cache directory.
    pub file: String,
    /// Track title at the time the artifact was stored.
    #[serde(default)]
    pub title: Option<String>,
    /// Creation time in milliseconds since the unix epoch.
    #[serde(default, deserialize_with = "deserialize_millis")]
    pub created_at: u64,
    /// Artifact size in bytes when recorded.
    #[serde(default)]
    pub size: Option<u64>,
}

/// Older index files stored fractional millisecond timestamps.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw.is_finite() && raw > 0.0 {
        Ok(raw as u64)
    } else {
        Ok(0)
    }
}
