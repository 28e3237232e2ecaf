//! Error taxonomy for the queue engine.
//!
//! Track-level failures stay inside the queue, connection-level failures reach
//! the caller, cache-level failures are healed where they are found.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A track could not be turned into a playable stream.
///
/// The queue treats every variant the same way: the track is dropped and the
/// next one is tried.
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// No configured fetch strategy accepts this source reference.
    #[error("no fetch strategy available for {0}")]
    NoStrategy(String),

    /// A fetch strategy failed to open the source.
    #[error("{strategy} fetch failed: {message}")]
    Fetch { strategy: &'static str, message: String },

    /// The transcoder could not be started.
    #[error("transcode failed: {0}")]
    Transcode(String),

    /// The source ended before producing any audio.
    #[error("{0} produced no audio")]
    EmptyStream(&'static str),

    /// A cached artifact could not be opened.
    #[error("cached artifact {path:?} unreadable: {source}")]
    CacheRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every strategy was tried; carries the last failure.
    #[error("all fetch strategies failed, last error: {0}")]
    Exhausted(Box<ResolutionError>),
}

/// Voice connection failures surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection did not become ready in time.
    #[error("voice connection not ready after {0:?}")]
    Timeout(Duration),

    /// The connection was lost or the bot was moved out of the channel.
    #[error("voice connection disconnected")]
    Disconnected,

    /// The transport refused to join the channel.
    #[error("failed to join voice channel: {0}")]
    Join(String),
}

/// Internal cache inconsistency; always repaired, never returned to callers.
#[derive(Error, Debug)]
pub enum CacheIntegrityError {
    #[error("artifact {0:?} is missing")]
    Missing(PathBuf),

    #[error("artifact {path:?} has {size} bytes, needs more than {min}")]
    Truncated { path: PathBuf, size: u64, min: u64 },

    #[error("index {path:?} unreadable: {message}")]
    Index { path: PathBuf, message: String },

    #[error("cache io on {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Rejections from the queue control surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full ({0} tracks)")]
    Full(usize),

    #[error("position 0 is the track currently playing")]
    CurrentSlot,

    #[error("no track at position {0}")]
    InvalidPosition(usize),

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("playback is already paused")]
    AlreadyPaused,

    #[error("playback is not paused")]
    NotPaused,

    /// The queue worker has shut down.
    #[error("queue for guild {0} is closed")]
    Closed(String),
}

/// Track lookup failures from a resolver.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("resolver binary not available")]
    Unavailable,

    #[error("lookup failed: {0}")]
    Failed(String),

    #[error("resolver returned malformed metadata: {0}")]
    Malformed(String),
}
