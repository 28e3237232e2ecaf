//! Container sniffing from the first bytes of a stream.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Audio containers the pipeline can hand to a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    Webm,
    Ogg,
    Mp3,
    Flac,
    Wav,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown container format: {0}")]
pub struct UnknownFormat(pub String);

impl ContainerFormat {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Webm => "webm",
            ContainerFormat::Ogg => "ogg",
            ContainerFormat::Mp3 => "mp3",
            ContainerFormat::Flac => "flac",
            ContainerFormat::Wav => "wav",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ContainerFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "webm" | "mkv" | "matroska" => Ok(ContainerFormat::Webm),
            "ogg" | "opus" | "oga" => Ok(ContainerFormat::Ogg),
            "mp3" | "mpeg" => Ok(ContainerFormat::Mp3),
            "flac" => Ok(ContainerFormat::Flac),
            "wav" | "wave" => Ok(ContainerFormat::Wav),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

/// Identify the container from the head of a stream.
///
/// Returns `None` when no known signature matches; callers fall back to the
/// configured default.
pub fn detect(head: &[u8]) -> Option<ContainerFormat> {
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(ContainerFormat::Webm);
    }
    if head.starts_with(b"OggS") {
        return Some(ContainerFormat::Ogg);
    }
    if head.starts_with(b"fLaC") {
        return Some(ContainerFormat::Flac);
    }
    if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WAVE" {
        return Some(ContainerFormat::Wav);
    }
    if head.starts_with(b"ID3") {
        return Some(ContainerFormat::Mp3);
    }
    // MPEG audio frame sync: 11 set bits.
    if head.len() >= 2 && head[0] == 0xFF && head[1] & 0xE0 == 0xE0 {
        return Some(ContainerFormat::Mp3);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_signatures() {
        assert_eq!(
            detect(&[0x1A, 0x45, 0xDF, 0xA3, 0x01]),
            Some(ContainerFormat::Webm)
        );
        assert_eq!(detect(b"OggS\0\x02"), Some(ContainerFormat::Ogg));
        assert_eq!(detect(b"fLaC\0\0\0\x22"), Some(ContainerFormat::Flac));
        assert_eq!(detect(b"RIFF\x24\0\0\0WAVEfmt "), Some(ContainerFormat::Wav));
        assert_eq!(detect(b"ID3\x04\0"), Some(ContainerFormat::Mp3));
        assert_eq!(detect(&[0xFF, 0xFB, 0x90, 0x00]), Some(ContainerFormat::Mp3));
    }

    #[test]
    fn unknown_or_short_heads_are_undetected() {
        assert_eq!(detect(b""), None);
        assert_eq!(detect(b"RIFF\0\0"), None);
        assert_eq!(detect(b"<html>"), None);
        assert_eq!(detect(&[0xFF]), None);
    }

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("WebM".parse::<ContainerFormat>(), Ok(ContainerFormat::Webm));
        assert_eq!(".opus".parse::<ContainerFormat>(), Ok(ContainerFormat::Ogg));
        assert!("aiff".parse::<ContainerFormat>().is_err());
        assert_eq!(ContainerFormat::Flac.to_string(), "flac");
    }
}
