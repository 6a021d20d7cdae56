//! Encoding profiles: what each media kind is encoded to, and the container
//! the encoded streams are packaged in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{error::TranscodeError, media::MediaKind};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFormat {
    pub name: String,
    /// Container caps, e.g. "video/webm".
    pub caps: String,
    /// Muxer name understood by the mux backend, e.g. "webm".
    pub muxer: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderParameters {
    /// Encoded caps, e.g. "video/x-vp8".
    pub caps: String,
    /// Encoder name understood by the mux backend, e.g. "libvpx".
    pub codec: String,
    // bps
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub preset: Option<String>,
    /// Maximum number of streams of this kind, 0 = unlimited.
    #[serde(default)]
    pub presence: u32,
}

impl EncoderParameters {
    pub fn new(caps: &str, codec: &str) -> Self {
        Self {
            caps: caps.to_string(),
            codec: codec.to_string(),
            bitrate: None,
            preset: None,
            presence: 0,
        }
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_presence(mut self, presence: u32) -> Self {
        self.presence = presence;
        self
    }
}

/// Everything an encoder input needs for one media kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetParameters {
    pub kind: MediaKind,
    pub encoder: EncoderParameters,
    pub container: ContainerFormat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodingProfile {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub container: ContainerFormat,
    pub streams: BTreeMap<MediaKind, EncoderParameters>,
}

impl EncodingProfile {
    pub fn new(name: &str, container: ContainerFormat) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            container,
            streams: BTreeMap::new(),
        }
    }

    /// VP8 video and Vorbis audio in a WebM container.
    pub fn webm() -> Self {
        Self::new(
            "webm",
            ContainerFormat {
                name: "webm".to_string(),
                caps: "video/webm".to_string(),
                muxer: "webm".to_string(),
            },
        )
        .with_stream(
            MediaKind::Video,
            EncoderParameters::new("video/x-vp8", "libvpx"),
        )
        .with_stream(
            MediaKind::Audio,
            EncoderParameters::new("audio/x-vorbis", "libvorbis"),
        )
    }

    /// Adds or replaces the encoder for `kind`. `MediaKind::Other` is never routed and is ignored.
    pub fn with_stream(mut self, kind: MediaKind, encoder: EncoderParameters) -> Self {
        if kind == MediaKind::Other {
            log::warn!("profile {}: ignoring encoder for non-routable kind", self.name);
            return self;
        }
        self.streams.insert(kind, encoder);
        self
    }

    pub fn for_kind(&self, kind: MediaKind) -> Option<TargetParameters> {
        if kind == MediaKind::Other {
            return None;
        }
        self.streams.get(&kind).map(|encoder| TargetParameters {
            kind,
            encoder: encoder.clone(),
            container: self.container.clone(),
        })
    }

    pub fn kinds(&self) -> impl Iterator<Item = MediaKind> + '_ {
        self.streams.keys().copied()
    }

    /// A profile is usable when it can encode at least one routable kind.
    pub fn validate(&self) -> Result<(), TranscodeError> {
        if self.container.muxer.is_empty() {
            return Err(TranscodeError::config(format!(
                "profile {} has no container muxer",
                self.name
            )));
        }
        if self.for_kind(MediaKind::Video).is_none() && self.for_kind(MediaKind::Audio).is_none() {
            return Err(TranscodeError::config(format!(
                "profile {} has no video or audio encoder",
                self.name
            )));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, TranscodeError> {
        let profile: EncodingProfile = serde_json::from_str(json)
            .map_err(|e| TranscodeError::config(format!("invalid encoding profile: {}", e)))?;
        profile.validate()?;
        Ok(profile)
    }
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self::webm()
    }
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod profile_test;
