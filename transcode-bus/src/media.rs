use std::{
    any::Any,
    collections::BTreeMap,
    fmt::{Debug, Display, Formatter},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

impl MediaKind {
    /// Classifies a caps media type by its category prefix.
    pub fn classify(media_type: &str) -> Self {
        if media_type.starts_with("video") {
            MediaKind::Video
        } else if media_type.starts_with("audio") {
            MediaKind::Audio
        } else {
            MediaKind::Other
        }
    }

    /// Name template prefix of the encoder slots for this kind, e.g. `video_%u`.
    pub fn slot_prefix(&self) -> Option<&'static str> {
        match self {
            MediaKind::Video => Some("video"),
            MediaKind::Audio => Some("audio"),
            MediaKind::Other => None,
        }
    }
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Other => f.write_str("other"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CapsValue {
    Int(i64),
    Fraction(i32, i32),
    Str(String),
}

impl Display for CapsValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CapsValue::Int(v) => write!(f, "(int){}", v),
            CapsValue::Fraction(n, d) => write!(f, "(fraction){}/{}", n, d),
            CapsValue::Str(s) => write!(f, "(string){}", s),
        }
    }
}

/// Format description of an elementary stream: a media type such as
/// `video/x-raw` plus named fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Caps {
    media_type: String,
    fields: BTreeMap<String, CapsValue>,
}

impl Caps {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_int(mut self, name: &str, value: i64) -> Self {
        self.fields.insert(name.to_string(), CapsValue::Int(value));
        self
    }

    pub fn with_fraction(mut self, name: &str, num: i32, den: i32) -> Self {
        self.fields
            .insert(name.to_string(), CapsValue::Fraction(num, den));
        self
    }

    pub fn with_str(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields
            .insert(name.to_string(), CapsValue::Str(value.into()));
        self
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn kind(&self) -> MediaKind {
        MediaKind::classify(&self.media_type)
    }

    pub fn get(&self, name: &str) -> Option<&CapsValue> {
        self.fields.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(CapsValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_fraction(&self, name: &str) -> Option<(i32, i32)> {
        match self.fields.get(name) {
            Some(CapsValue::Fraction(n, d)) => Some((*n, *d)),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(CapsValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl Display for Caps {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.media_type)?;
        for (name, value) in &self.fields {
            write!(f, ", {}={}", name, value)?;
        }
        Ok(())
    }
}

/// Per-run identifier of an elementary stream, assigned by the demuxer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescriptor {
    id: StreamId,
    caps: Option<Caps>,
    kind: MediaKind,
}

impl StreamDescriptor {
    pub fn new(id: StreamId, caps: Option<Caps>) -> Self {
        let kind = caps.as_ref().map(Caps::kind).unwrap_or(MediaKind::Other);
        Self { id, caps, kind }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn caps(&self) -> Option<&Caps> {
        self.caps.as_ref()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Caps rendered for diagnostics.
    pub fn caps_string(&self) -> String {
        match &self.caps {
            Some(caps) => caps.to_string(),
            None => "(none)".to_string(),
        }
    }
}

/// A unit of stream data moving between stages.
///
/// The engine never looks inside the payload; demuxers and muxers agree on
/// its concrete type (encoded bytes, a decoded frame, ...).
pub struct Buffer {
    pts: Option<i64>,
    payload: Box<dyn Any + Send>,
}

impl Buffer {
    pub fn new<T: Any + Send>(payload: T) -> Self {
        Self {
            pts: None,
            payload: Box::new(payload),
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(data.into())
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        self.payload::<Bytes>()
    }

    /// Takes the payload out as `T`, handing the buffer back on a type mismatch.
    pub fn into_payload<T: Any>(self) -> Result<T, Self> {
        let pts = self.pts;
        match self.payload.downcast::<T>() {
            Ok(payload) => Ok(*payload),
            Err(payload) => Err(Self { pts, payload }),
        }
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("pts", &self.pts).finish()
    }
}

#[cfg(test)]
#[path = "media_test.rs"]
mod media_test;
