//! Contracts of the collaborators plugged into a stage graph.
//!
//! The engine connects these stages and moves [`Buffer`]s between them; it
//! never interprets payloads. Each method is called from a single worker
//! thread at a time.

use std::{
    fmt::{Display, Formatter},
    io::{Read, Seek, SeekFrom},
    sync::Arc,
};

use crate::{
    file::{FileSink, FileSource},
    media::{Buffer, MediaKind, StreamDescriptor, StreamId},
    profile::{ContainerFormat, TargetParameters},
};

pub trait ByteSource: Send {
    fn location(&self) -> &str;

    fn open(&mut self) -> anyhow::Result<()>;

    /// Total size in bytes, if known once opened.
    fn size(&self) -> Option<u64>;

    /// Reads into `buf`, returning 0 at end of input.
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;

    fn seek(&mut self, _pos: SeekFrom) -> anyhow::Result<u64> {
        Err(anyhow::anyhow!("{} is not seekable", self.location()))
    }
}

pub trait ByteSink: Send {
    fn location(&self) -> &str;

    fn open(&mut self) -> anyhow::Result<()>;

    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;

    fn seek(&mut self, _pos: SeekFrom) -> anyhow::Result<u64> {
        Err(anyhow::anyhow!("{} is not seekable", self.location()))
    }

    /// Flushes and closes the destination.
    fn finish(&mut self) -> anyhow::Result<()>;
}

/// Seekable byte input handed to a demuxer.
pub trait MediaInput: Read + Seek + Send {}

impl<T: Read + Seek + Send> MediaInput for T {}

pub enum DemuxEvent {
    /// A new elementary stream was found.
    StreamAdded(StreamDescriptor),
    /// Decoded data for a previously announced stream.
    Data { stream: StreamId, buffer: Buffer },
    /// No further streams will be announced.
    NoMoreStreams,
}

/// The demultiplexer/decoder stage.
pub trait Demuxer: Send {
    fn open(&mut self, input: Box<dyn MediaInput>) -> anyhow::Result<()>;

    /// Next event, `Ok(None)` once the input is exhausted and every stream drained.
    fn next_event(&mut self) -> anyhow::Result<Option<DemuxEvent>>;
}

/// Name of an encoder input, `video_0`, `audio_1`, ...
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlotName {
    kind: MediaKind,
    index: u32,
}

impl SlotName {
    pub fn new(kind: MediaKind, index: u32) -> Self {
        Self { kind, index }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Display for SlotName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}",
            self.kind.slot_prefix().unwrap_or("other"),
            self.index
        )
    }
}

/// The encoder/multiplexer stage.
pub trait Muxer: Send {
    fn open(&mut self, output: Box<dyn ByteSink>) -> anyhow::Result<()>;

    /// Creates the encoder input behind `slot`. An error rejects the slot.
    fn add_input(
        &mut self,
        slot: &SlotName,
        stream: &StreamDescriptor,
        target: &TargetParameters,
    ) -> anyhow::Result<()>;

    /// No more inputs will be added.
    fn seal(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn write(&mut self, slot: &SlotName, buffer: Buffer) -> anyhow::Result<()>;

    fn end_input(&mut self, slot: &SlotName) -> anyhow::Result<()>;

    /// Drains encoders, finalizes the container and closes the output.
    fn finish(&mut self) -> anyhow::Result<()>;
}

pub trait StageFactory: Send + Sync {
    fn name(&self) -> &str;

    fn make_source(&self, location: &str) -> anyhow::Result<Box<dyn ByteSource>> {
        Ok(Box::new(FileSource::new(location)))
    }

    fn make_sink(&self, location: &str) -> anyhow::Result<Box<dyn ByteSink>> {
        Ok(Box::new(FileSink::new(location)))
    }

    fn make_demuxer(&self) -> anyhow::Result<Box<dyn Demuxer>>;

    /// Fails when the container cannot be produced.
    fn make_muxer(&self, container: &ContainerFormat) -> anyhow::Result<Box<dyn Muxer>>;
}

#[cfg(not(feature = "ffmpeg"))]
struct UnavailableFactory;

#[cfg(not(feature = "ffmpeg"))]
impl StageFactory for UnavailableFactory {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn make_demuxer(&self) -> anyhow::Result<Box<dyn Demuxer>> {
        Err(anyhow::anyhow!(
            "no demux/decode backend: built without the `ffmpeg` feature"
        ))
    }

    fn make_muxer(&self, container: &ContainerFormat) -> anyhow::Result<Box<dyn Muxer>> {
        Err(anyhow::anyhow!(
            "no encode/mux backend for {}: built without the `ffmpeg` feature",
            container.name
        ))
    }
}

/// Stage factory of this build: FFmpeg when the `ffmpeg` feature is on.
pub fn default_factory() -> Arc<dyn StageFactory> {
    #[cfg(feature = "ffmpeg")]
    {
        Arc::new(crate::ffmpeg::FfmpegFactory::new())
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Arc::new(UnavailableFactory)
    }
}
