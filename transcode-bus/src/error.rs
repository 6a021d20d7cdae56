use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::media::{MediaKind, StreamId};

/// Category of a terminal error, as reported to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    StartFailure,
    Runtime,
    NoRoutableStreams,
    Aborted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::StartFailure => "start-failure",
            ErrorKind::Runtime => "runtime",
            ErrorKind::NoRoutableStreams => "no-routable-streams",
            ErrorKind::Aborted => "aborted",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to start: {message}")]
    StartFailure {
        message: String,
        debug: Option<String>,
    },

    #[error("{message}")]
    Runtime {
        message: String,
        debug: Option<String>,
    },

    #[error("no stream matched the encoding profile")]
    NoRoutableStreams,

    #[error("aborted")]
    Aborted,
}

impl TranscodeError {
    pub fn config(message: impl Into<String>) -> Self {
        TranscodeError::Configuration(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscodeError::Configuration(_) => ErrorKind::Configuration,
            TranscodeError::StartFailure { .. } => ErrorKind::StartFailure,
            TranscodeError::Runtime { .. } => ErrorKind::Runtime,
            TranscodeError::NoRoutableStreams => ErrorKind::NoRoutableStreams,
            TranscodeError::Aborted => ErrorKind::Aborted,
        }
    }

    pub fn debug(&self) -> Option<&str> {
        match self {
            TranscodeError::StartFailure { debug, .. } | TranscodeError::Runtime { debug, .. } => {
                debug.as_deref()
            }
            _ => None,
        }
    }
}

/// Why a discovered stream was left out of the output.
///
/// Never fatal to the run: the stream is logged and skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteDrop {
    /// The stream carries no format information at all.
    NoCaps(StreamId),
    /// The format is neither video nor audio.
    UnknownKind { stream: StreamId, caps: String },
    /// The active profile has no encoder for this kind.
    NoProfileEntry { stream: StreamId, kind: MediaKind },
    /// The mux stage refused to create an input.
    SlotRejected {
        stream: StreamId,
        kind: MediaKind,
        reason: String,
    },
    /// Announced after the demuxer signalled no more streams.
    LateStream(StreamId),
}

impl RouteDrop {
    pub fn stream(&self) -> StreamId {
        match self {
            RouteDrop::NoCaps(stream) | RouteDrop::LateStream(stream) => *stream,
            RouteDrop::UnknownKind { stream, .. }
            | RouteDrop::NoProfileEntry { stream, .. }
            | RouteDrop::SlotRejected { stream, .. } => *stream,
        }
    }
}

impl Display for RouteDrop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteDrop::NoCaps(stream) => write!(f, "{}: pad with no caps ignored", stream),
            RouteDrop::UnknownKind { stream, caps } => {
                write!(f, "{}: ignoring unknown stream, {}", stream, caps)
            }
            RouteDrop::NoProfileEntry { stream, kind } => {
                write!(f, "{}: profile has no {} encoder", stream, kind)
            }
            RouteDrop::SlotRejected {
                stream,
                kind,
                reason,
            } => write!(
                f,
                "{}: couldn't create {} encoding slot: {}",
                stream, kind, reason
            ),
            RouteDrop::LateStream(stream) => {
                write!(f, "{}: announced after no-more-streams", stream)
            }
        }
    }
}
