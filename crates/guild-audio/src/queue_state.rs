//! Pure queue data and transitions, without any I/O.

use std::collections::VecDeque;

use guild_audio_types::{PlaybackState, QueueSnapshot, Track};

use crate::config::QueueSettings;
use crate::error::QueueError;

/// Clamp a requested volume into `[0, 2]`; NaN becomes silence.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 2.0)
    }
}

#[derive(Debug, Clone)]
pub struct QueueState {
    guild_id: String,
    pending: VecDeque<Track>,
    current: Option<Track>,
    playback: PlaybackState,
    loop_enabled: bool,
    volume: f32,
    max_pending: usize,
}

impl QueueState {
    pub fn new(guild_id: impl Into<String>, settings: &QueueSettings) -> Self {
        Self {
            guild_id: guild_id.into(),
            pending: VecDeque::new(),
            current: None,
            playback: PlaybackState::Idle,
            loop_enabled: false,
            volume: clamp_volume(settings.default_volume),
            max_pending: settings.max_queue_size,
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Track> {
        self.pending.iter()
    }

    pub fn playback(&self) -> PlaybackState {
        self.playback
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Nothing playing or paused.
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Append a track; returns its 1-based position in the pending list.
    pub fn push(&mut self, track: Track) -> Result<usize, QueueError> {
        if self.pending.len() >= self.max_pending {
            return Err(QueueError::Full(self.max_pending));
        }
        self.pending.push_back(track);
        Ok(self.pending.len())
    }

    /// Remove the pending track at 1-based `position`; 0 is the current track.
    pub fn remove(&mut self, position: usize) -> Result<Track, QueueError> {
        if position == 0 {
            return Err(QueueError::CurrentSlot);
        }
        self.pending
            .remove(position - 1)
            .ok_or(QueueError::InvalidPosition(position))
    }

    /// Move the head of the pending list into the current slot.
    ///
    /// With nothing pending the queue becomes idle and `None` is returned.
    pub fn begin_next(&mut self) -> Option<Track> {
        match self.pending.pop_front() {
            Some(track) => {
                self.current = Some(track.clone());
                self.playback = PlaybackState::Playing;
                Some(track)
            }
            None => {
                self.current = None;
                self.playback = PlaybackState::Idle;
                None
            }
        }
    }

    /// Replay the current track from the start.
    pub fn restart_current(&mut self) -> Option<Track> {
        let track = self.current.clone()?;
        self.playback = PlaybackState::Playing;
        Some(track)
    }

    /// Clear the current slot; returns the track that was there.
    pub fn finish_current(&mut self) -> Option<Track> {
        self.playback = PlaybackState::Idle;
        self.current.take()
    }

    pub fn pause(&mut self) -> Result<(), QueueError> {
        match self.playback {
            PlaybackState::Idle => Err(QueueError::NothingPlaying),
            PlaybackState::Paused => Err(QueueError::AlreadyPaused),
            PlaybackState::Playing => {
                self.playback = PlaybackState::Paused;
                Ok(())
            }
        }
    }

    pub fn resume(&mut self) -> Result<(), QueueError> {
        match self.playback {
            PlaybackState::Idle => Err(QueueError::NothingPlaying),
            PlaybackState::Playing => Err(QueueError::NotPaused),
            PlaybackState::Paused => {
                self.playback = PlaybackState::Playing;
                Ok(())
            }
        }
    }

    pub fn set_volume(&mut self, volume: f32) -> f32 {
        self.volume = clamp_volume(volume);
        self.volume
    }

    pub fn toggle_loop(&mut self) -> bool {
        self.loop_enabled = !self.loop_enabled;
        self.loop_enabled
    }

    /// Drop every track and go idle; returns how many tracks were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.pending.len() + usize::from(self.current.is_some());
        self.pending.clear();
        self.current = None;
        self.playback = PlaybackState::Idle;
        removed
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            guild_id: self.guild_id.clone(),
            current: self.current.clone(),
            pending: self.pending.iter().cloned().collect(),
            playback: self.playback,
            loop_enabled: self.loop_enabled,
            volume: self.volume,
        }
    }
}
