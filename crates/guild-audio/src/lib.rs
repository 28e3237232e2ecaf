//! Per-guild audio queue engine for chat-bot voice channels.
//!
//! Tracks are resolved into transcoded streams (`source`), cached on disk
//! (`cache_index`), played through a voice transport (`playback_session`,
//! `voice_transport`) and sequenced by one worker per guild (`queue_service`,
//! `queue_registry`).

pub mod cache_index;
pub mod config;
pub mod error;
pub mod events;
pub mod playback_session;
pub mod queue_registry;
pub mod queue_service;
pub mod queue_state;
pub mod resolver;
pub mod source;
pub mod voice_transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use guild_audio_types as types;
