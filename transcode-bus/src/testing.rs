//! In-memory stage doubles used by the engine tests.

use std::{
    collections::{HashMap, VecDeque},
    io::{Read, SeekFrom},
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;

use crate::{
    media::{Buffer, Caps, MediaKind, StreamDescriptor, StreamId},
    profile::{ContainerFormat, TargetParameters},
    stage::{ByteSink, ByteSource, DemuxEvent, Demuxer, MediaInput, Muxer, SlotName, StageFactory},
};

pub fn video_caps() -> Caps {
    Caps::new("video/x-raw")
        .with_int("width", 320)
        .with_int("height", 240)
        .with_fraction("framerate", 10, 1)
}

pub fn audio_caps() -> Caps {
    Caps::new("audio/x-raw")
        .with_int("rate", 44100)
        .with_int("channels", 2)
}

pub fn subtitle_caps() -> Caps {
    Caps::new("text/x-raw").with_str("format", "utf8")
}

/// One video and one audio stream with a few buffers each.
pub fn video_and_audio_steps() -> Vec<Step> {
    vec![
        Step::Stream(0, Some(video_caps())),
        Step::Stream(1, Some(audio_caps())),
        Step::NoMoreStreams,
        Step::Data(0, b"v0"),
        Step::Data(1, b"a0"),
        Step::Data(0, b"v1"),
        Step::Data(1, b"a1"),
        Step::Data(0, b"v2"),
    ]
}

pub struct MemorySource {
    data: Bytes,
    position: usize,
    known_size: bool,
    fail_open: bool,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            known_size: true,
            fail_open: false,
        }
    }

    pub fn with_unknown_size(mut self) -> Self {
        self.known_size = false;
        self
    }
}

impl ByteSource for MemorySource {
    fn location(&self) -> &str {
        "memory"
    }

    fn open(&mut self) -> anyhow::Result<()> {
        if self.fail_open {
            anyhow::bail!("memory source refused to open");
        }
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        self.known_size.then_some(self.data.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let remaining = &self.data[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> anyhow::Result<u64> {
        let position = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(p) => self.position as i64 + p,
            SeekFrom::End(p) => self.data.len() as i64 + p,
        };
        self.position = position.clamp(0, self.data.len() as i64) as usize;
        Ok(self.position as u64)
    }
}

#[derive(Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    finished: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.data.lock().unwrap()).into_owned()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap()
    }
}

impl ByteSink for MemorySink {
    fn location(&self) -> &str {
        "memory"
    }

    fn open(&mut self) -> anyhow::Result<()> {
        self.data.lock().unwrap().clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        *self.finished.lock().unwrap() = true;
        Ok(())
    }
}

pub enum Step {
    Stream(u32, Option<Caps>),
    NoMoreStreams,
    Data(u32, &'static [u8]),
    Fail(&'static str),
    /// Emits data for the stream until the graph is torn down.
    Endless(u32),
}

/// Plays back a fixed list of demux events, reading one chunk of input
/// before each so the progress probe sees the source being consumed.
pub struct ScriptedDemuxer {
    steps: VecDeque<Step>,
    input: Option<Box<dyn MediaInput>>,
    chunk: usize,
}

impl ScriptedDemuxer {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            input: None,
            chunk: 16,
        }
    }

    fn read_chunk(&mut self) -> anyhow::Result<usize> {
        let mut buf = vec![0u8; self.chunk];
        match self.input.as_mut() {
            Some(input) => Ok(input.read(&mut buf)?),
            None => Err(anyhow::anyhow!("demuxer is not open")),
        }
    }
}

impl Demuxer for ScriptedDemuxer {
    fn open(&mut self, input: Box<dyn MediaInput>) -> anyhow::Result<()> {
        self.input = Some(input);
        Ok(())
    }

    fn next_event(&mut self) -> anyhow::Result<Option<DemuxEvent>> {
        self.read_chunk()?;
        let step = match self.steps.pop_front() {
            Some(step) => step,
            None => {
                while self.read_chunk()? > 0 {}
                return Ok(None);
            }
        };
        let event = match step {
            Step::Stream(id, caps) => {
                DemuxEvent::StreamAdded(StreamDescriptor::new(StreamId(id), caps))
            }
            Step::NoMoreStreams => DemuxEvent::NoMoreStreams,
            Step::Data(id, data) => DemuxEvent::Data {
                stream: StreamId(id),
                buffer: Buffer::from_bytes(Bytes::from_static(data)),
            },
            Step::Fail(message) => anyhow::bail!("{}", message),
            Step::Endless(id) => {
                self.steps.push_front(Step::Endless(id));
                std::thread::sleep(Duration::from_millis(2));
                DemuxEvent::Data {
                    stream: StreamId(id),
                    buffer: Buffer::from_bytes(Bytes::from_static(b"x")),
                }
            }
        };
        Ok(Some(event))
    }
}

#[derive(Default)]
pub struct MuxRecord {
    pub inputs: Vec<(String, MediaKind, StreamId)>,
    pub buffers: HashMap<String, Vec<Bytes>>,
    pub ended: Vec<String>,
    pub sealed: bool,
    pub finished: bool,
}

/// Muxer writing a text summary of what it received on `finish`:
/// one `<slot> <encoder caps> <buffers>` line per input.
pub struct RecordingMuxer {
    record: Arc<Mutex<MuxRecord>>,
    output: Option<Box<dyn ByteSink>>,
    targets: HashMap<String, TargetParameters>,
    reject: Vec<MediaKind>,
    fail_write: bool,
}

impl RecordingMuxer {
    pub fn new(record: Arc<Mutex<MuxRecord>>) -> Self {
        Self {
            record,
            output: None,
            targets: HashMap::new(),
            reject: Vec::new(),
            fail_write: false,
        }
    }
}

impl Muxer for RecordingMuxer {
    fn open(&mut self, output: Box<dyn ByteSink>) -> anyhow::Result<()> {
        self.output = Some(output);
        Ok(())
    }

    fn add_input(
        &mut self,
        slot: &SlotName,
        stream: &StreamDescriptor,
        target: &TargetParameters,
    ) -> anyhow::Result<()> {
        if self.reject.contains(&slot.kind()) {
            anyhow::bail!("{} inputs are not accepted", slot.kind());
        }
        self.targets.insert(slot.to_string(), target.clone());
        self.record
            .lock()
            .unwrap()
            .inputs
            .push((slot.to_string(), slot.kind(), stream.id()));
        Ok(())
    }

    fn seal(&mut self) -> anyhow::Result<()> {
        self.record.lock().unwrap().sealed = true;
        Ok(())
    }

    fn write(&mut self, slot: &SlotName, buffer: Buffer) -> anyhow::Result<()> {
        if self.fail_write {
            anyhow::bail!("encoder failure on {}", slot);
        }
        let data = buffer
            .into_payload::<Bytes>()
            .map_err(|_| anyhow::anyhow!("unexpected payload"))?;
        self.record
            .lock()
            .unwrap()
            .buffers
            .entry(slot.to_string())
            .or_default()
            .push(data);
        Ok(())
    }

    fn end_input(&mut self, slot: &SlotName) -> anyhow::Result<()> {
        self.record.lock().unwrap().ended.push(slot.to_string());
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or(anyhow::anyhow!("muxer is not open"))?;
        let mut record = self.record.lock().unwrap();
        let mut slots: Vec<_> = self.targets.iter().collect();
        slots.sort_by(|a, b| a.0.cmp(b.0));
        for (slot, target) in slots {
            let buffers = record.buffers.get(slot).map(Vec::len).unwrap_or(0);
            output.write(format!("{} {} {}\n", slot, target.encoder.caps, buffers).as_bytes())?;
        }
        output.finish()?;
        record.finished = true;
        Ok(())
    }
}

/// Factory handing out the doubles above; each graph built from it gets a
/// fresh demuxer from `steps`.
pub struct TestFactory {
    pub input: Bytes,
    pub steps: Mutex<Option<Vec<Step>>>,
    pub record: Arc<Mutex<MuxRecord>>,
    pub sink: MemorySink,
    pub fail_source_open: bool,
    pub unknown_size: bool,
    pub reject: Vec<MediaKind>,
    pub fail_write: bool,
    pub unsupported_muxer: bool,
}

impl TestFactory {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            input: Bytes::from(vec![0u8; 256]),
            steps: Mutex::new(Some(steps)),
            record: Arc::new(Mutex::new(MuxRecord::default())),
            sink: MemorySink::default(),
            fail_source_open: false,
            unknown_size: false,
            reject: Vec::new(),
            fail_write: false,
            unsupported_muxer: false,
        }
    }

    pub fn video_and_audio() -> Self {
        Self::new(video_and_audio_steps())
    }
}

impl StageFactory for TestFactory {
    fn name(&self) -> &str {
        "test"
    }

    fn make_source(&self, _location: &str) -> anyhow::Result<Box<dyn ByteSource>> {
        let mut source = MemorySource::new(self.input.clone());
        source.fail_open = self.fail_source_open;
        source.known_size = !self.unknown_size;
        Ok(Box::new(source))
    }

    fn make_sink(&self, _location: &str) -> anyhow::Result<Box<dyn ByteSink>> {
        Ok(Box::new(self.sink.clone()))
    }

    fn make_demuxer(&self) -> anyhow::Result<Box<dyn Demuxer>> {
        let steps = self
            .steps
            .lock()
            .unwrap()
            .take()
            .ok_or(anyhow::anyhow!("demuxer script already used"))?;
        Ok(Box::new(ScriptedDemuxer::new(steps)))
    }

    fn make_muxer(&self, container: &ContainerFormat) -> anyhow::Result<Box<dyn Muxer>> {
        if self.unsupported_muxer {
            anyhow::bail!("no muxer for {}", container.muxer);
        }
        let mut muxer = RecordingMuxer::new(Arc::clone(&self.record));
        muxer.reject = self.reject.clone();
        muxer.fail_write = self.fail_write;
        Ok(Box::new(muxer))
    }
}
