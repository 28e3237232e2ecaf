//! Configuration loading and parsing.
//!
//! Defines the TOML schema and resolves it into concrete settings with defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::source::probe::ContainerFormat;

const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_INDEX_FILE: &str = "index.json";
const DEFAULT_MIN_ARTIFACT_BYTES: u64 = 102_400;
const DEFAULT_ARTIFACT_EXTENSION: &str = "webm";
/// Matches YouTube-style ids embedded in legacy artifact names.
pub const DEFAULT_ID_PATTERN: &str = "[A-Za-z0-9_-]{11}";
const DEFAULT_SAMPLE_RATE: u32 = 48_000;
const DEFAULT_CHANNELS: u16 = 2;
const DEFAULT_PROBE_BYTES: usize = 4096;
const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
const DEFAULT_CHANNEL_DEPTH: usize = 64;
const DEFAULT_EXIT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_VOLUME: f32 = 0.5;
const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_GRACE_MS: u64 = 5_000;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct AudioConfig {
    /// Content cache settings.
    pub cache: Option<CacheConfig>,
    /// Fetch/transcode pipeline settings.
    pub pipeline: Option<PipelineConfig>,
    /// Queue behavior settings.
    pub queue: Option<QueueConfig>,
    /// Voice transport settings.
    pub voice: Option<VoiceConfig>,
}

/// `[cache]` section.
#[derive(Debug, Default, Deserialize)]
pub struct CacheConfig {
    /// Enable the artifact cache (default: true).
    pub enabled: Option<bool>,
    /// Cache directory (default: `cache`).
    pub dir: Option<String>,
    /// Index file name inside the cache directory (default: `index.json`).
    pub index_file: Option<String>,
    /// Artifacts must be strictly larger than this to count as valid.
    pub min_artifact_bytes: Option<u64>,
    /// Artifact file extension (default: `webm`).
    pub artifact_extension: Option<String>,
    /// Keep partially downloaded artifacts when the stream fails (default: false).
    pub finalize_on_error: Option<bool>,
    /// Regex used to recover track ids from file names when rebuilding the index.
    pub id_pattern: Option<String>,
}

/// `[pipeline]` section.
#[derive(Debug, Default, Deserialize)]
pub struct PipelineConfig {
    /// Path or name of the `yt-dlp` binary.
    pub yt_dlp_path: Option<String>,
    /// Path or name of the `ffmpeg` binary.
    pub ffmpeg_path: Option<String>,
    /// Fall back to a direct HTTP fetch when `yt-dlp` is unavailable or fails.
    pub http_fallback: Option<bool>,
    /// Output sample rate in Hz (default: 48000).
    pub sample_rate: Option<u32>,
    /// Output channel count (default: 2).
    pub channels: Option<u16>,
    /// Bytes inspected to detect the output container.
    pub probe_bytes: Option<usize>,
    /// Container assumed when detection fails (default: `webm`).
    pub fallback_format: Option<String>,
    /// Read size of the fan-out pump.
    pub chunk_bytes: Option<usize>,
    /// Chunks buffered between the pump and the playback consumer.
    pub channel_depth: Option<usize>,
    /// How long to wait for subprocesses to exit after end of stream.
    pub exit_timeout_ms: Option<u64>,
}

/// `[queue]` section.
#[derive(Debug, Default, Deserialize)]
pub struct QueueConfig {
    /// Initial volume for new queues (default: 0.5).
    pub default_volume: Option<f32>,
    /// Maximum number of pending tracks (default: 100).
    pub max_queue_size: Option<usize>,
    /// Replay a looping track even when it failed (default: false).
    pub loop_failed_tracks: Option<bool>,
    /// Tear down the voice connection once the queue drains (default: true).
    pub leave_when_empty: Option<bool>,
}

/// `[voice]` section.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfig {
    /// Bound on waiting for a new connection to become ready.
    pub connect_timeout_ms: Option<u64>,
    /// How long a dropped connection may take to start reconnecting.
    pub reconnect_grace_ms: Option<u64>,
}

/// Resolved cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub index_file: String,
    pub min_artifact_bytes: u64,
    pub artifact_extension: String,
    pub finalize_on_error: bool,
    pub id_pattern: Regex,
}

impl CacheSettings {
    /// Defaults rooted at `dir`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            dir: dir.into(),
            index_file: DEFAULT_INDEX_FILE.to_string(),
            min_artifact_bytes: DEFAULT_MIN_ARTIFACT_BYTES,
            artifact_extension: DEFAULT_ARTIFACT_EXTENSION.to_string(),
            finalize_on_error: false,
            id_pattern: Regex::new(DEFAULT_ID_PATTERN).expect("default id pattern"),
        }
    }

    /// Full path of the index file.
    pub fn index_path(&self) -> PathBuf {
        self.dir.join(&self.index_file)
    }
}

/// Resolved pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub yt_dlp_path: Option<PathBuf>,
    pub ffmpeg_path: PathBuf,
    pub http_fallback: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub probe_bytes: usize,
    pub fallback_format: ContainerFormat,
    pub chunk_bytes: usize,
    pub channel_depth: usize,
    pub exit_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            yt_dlp_path: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            http_fallback: true,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            probe_bytes: DEFAULT_PROBE_BYTES,
            fallback_format: ContainerFormat::Webm,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            channel_depth: DEFAULT_CHANNEL_DEPTH,
            exit_timeout: Duration::from_millis(DEFAULT_EXIT_TIMEOUT_MS),
        }
    }
}

/// Resolved queue settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub loop_failed_tracks: bool,
    pub leave_when_empty: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_volume: DEFAULT_VOLUME,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            loop_failed_tracks: false,
            leave_when_empty: true,
        }
    }
}

/// Resolved voice transport settings.
#[derive(Debug, Clone)]
pub struct VoiceSettings {
    pub connect_timeout: Duration,
    pub reconnect_grace: Duration,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            reconnect_grace: Duration::from_millis(DEFAULT_RECONNECT_GRACE_MS),
        }
    }
}

impl AudioConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<AudioConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Resolve cache settings, relative directories are taken as-is.
pub fn cache_settings_from_config(cfg: &AudioConfig) -> Result<CacheSettings> {
    let section = cfg.cache.as_ref();
    let dir = section
        .and_then(|c| c.dir.as_deref())
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_CACHE_DIR);
    let mut settings = CacheSettings::with_dir(dir);
    let Some(section) = section else {
        return Ok(settings);
    };
    if let Some(enabled) = section.enabled {
        settings.enabled = enabled;
    }
    if let Some(index_file) = section.index_file.as_deref().filter(|f| !f.trim().is_empty()) {
        settings.index_file = index_file.trim().to_string();
    }
    if let Some(min) = section.min_artifact_bytes {
        settings.min_artifact_bytes = min;
    }
    if let Some(ext) = section.artifact_extension.as_deref() {
        let ext = ext.trim().trim_start_matches('.');
        if ext.is_empty() {
            return Err(anyhow::anyhow!("cache.artifact_extension must not be empty"));
        }
        settings.artifact_extension = ext.to_ascii_lowercase();
    }
    if let Some(finalize) = section.finalize_on_error {
        settings.finalize_on_error = finalize;
    }
    if let Some(pattern) = section.id_pattern.as_deref() {
        settings.id_pattern =
            Regex::new(pattern).with_context(|| format!("parse cache.id_pattern {pattern}"))?;
    }
    Ok(settings)
}

/// Resolve pipeline settings and locate external binaries.
pub fn pipeline_settings_from_config(cfg: &AudioConfig) -> Result<PipelineSettings> {
    let mut settings = PipelineSettings::default();
    let section = cfg.pipeline.as_ref();

    settings.yt_dlp_path = locate_binary(section.and_then(|p| p.yt_dlp_path.as_deref()), "yt-dlp");
    if let Some(ffmpeg) = locate_binary(section.and_then(|p| p.ffmpeg_path.as_deref()), "ffmpeg") {
        settings.ffmpeg_path = ffmpeg;
    }

    let Some(section) = section else {
        return Ok(settings);
    };
    if let Some(fallback) = section.http_fallback {
        settings.http_fallback = fallback;
    }
    if let Some(rate) = section.sample_rate {
        if rate == 0 {
            return Err(anyhow::anyhow!("pipeline.sample_rate must be positive"));
        }
        settings.sample_rate = rate;
    }
    if let Some(channels) = section.channels {
        if !(1..=2).contains(&channels) {
            return Err(anyhow::anyhow!("pipeline.channels must be 1 or 2"));
        }
        settings.channels = channels;
    }
    if let Some(bytes) = section.probe_bytes {
        settings.probe_bytes = bytes.max(16);
    }
    if let Some(format) = section.fallback_format.as_deref() {
        settings.fallback_format = format
            .parse()
            .with_context(|| format!("parse pipeline.fallback_format {format}"))?;
    }
    if let Some(chunk) = section.chunk_bytes {
        settings.chunk_bytes = chunk.max(1024);
    }
    if let Some(depth) = section.channel_depth {
        settings.channel_depth = depth.max(1);
    }
    if let Some(ms) = section.exit_timeout_ms {
        settings.exit_timeout = Duration::from_millis(ms);
    }
    Ok(settings)
}

/// Resolve queue settings.
pub fn queue_settings_from_config(cfg: &AudioConfig) -> Result<QueueSettings> {
    let mut settings = QueueSettings::default();
    let Some(section) = cfg.queue.as_ref() else {
        return Ok(settings);
    };
    if let Some(volume) = section.default_volume {
        if !volume.is_finite() || !(0.0..=2.0).contains(&volume) {
            return Err(anyhow::anyhow!("queue.default_volume must be within 0..=2"));
        }
        settings.default_volume = volume;
    }
    if let Some(max) = section.max_queue_size {
        settings.max_queue_size = max.max(1);
    }
    if let Some(flag) = section.loop_failed_tracks {
        settings.loop_failed_tracks = flag;
    }
    if let Some(flag) = section.leave_when_empty {
        settings.leave_when_empty = flag;
    }
    Ok(settings)
}

/// Resolve voice settings.
pub fn voice_settings_from_config(cfg: &AudioConfig) -> VoiceSettings {
    let mut settings = VoiceSettings::default();
    if let Some(section) = cfg.voice.as_ref() {
        if let Some(ms) = section.connect_timeout_ms {
            settings.connect_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = section.reconnect_grace_ms {
            settings.reconnect_grace = Duration::from_millis(ms);
        }
    }
    settings
}

/// Find an executable: explicit path, then `PATH`, then common install dirs.
pub fn locate_binary(configured: Option<&str>, name: &str) -> Option<PathBuf> {
    let file_name = executable_name(name);
    if let Some(configured) = configured.map(str::trim).filter(|c| !c.is_empty()) {
        let path = PathBuf::from(configured);
        if path.components().count() > 1 || path.is_absolute() {
            return path.is_file().then_some(path);
        }
        return search_path(&executable_name(configured));
    }
    if let Some(found) = search_path(&file_name) {
        return Some(found);
    }
    let mut candidates = vec![
        PathBuf::from("/usr/local/bin").join(&file_name),
        PathBuf::from("/usr/bin").join(&file_name),
    ];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".local/bin").join(&file_name));
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(&file_name));
    }
    candidates.into_iter().find(|c| c.is_file())
}

fn search_path(file_name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}
