use std::collections::{HashMap, VecDeque};

use ffmpeg_next::{Rational, Rescale, media::Type};

use super::{DecodedFrame, io::InputContext};
use crate::{
    media::{Buffer, Caps, StreamDescriptor, StreamId},
    stage::{DemuxEvent, Demuxer, MediaInput},
};

enum StreamDecoder {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

impl StreamDecoder {
    fn new(stream: &ffmpeg_next::format::stream::Stream) -> anyhow::Result<Self> {
        let mut context = ffmpeg_next::codec::Context::from_parameters(stream.parameters())?;
        unsafe {
            (*context.as_mut_ptr()).time_base = stream.time_base().into();
        }
        match stream.parameters().medium() {
            Type::Video => {
                let decoder = context.decoder().video()?;
                if decoder.format() == ffmpeg_next::format::Pixel::None
                    || decoder.width() == 0
                    || decoder.height() == 0
                {
                    return Err(anyhow::anyhow!("missing codec parameters"));
                }
                Ok(StreamDecoder::Video(decoder))
            }
            Type::Audio => Ok(StreamDecoder::Audio(context.decoder().audio()?)),
            other => Err(anyhow::anyhow!("no decoder for {:?} streams", other)),
        }
    }

    fn caps(&self, stream: &ffmpeg_next::format::stream::Stream) -> Caps {
        match self {
            StreamDecoder::Video(decoder) => {
                let rate = stream.avg_frame_rate();
                Caps::new("video/x-raw")
                    .with_str("format", format!("{:?}", decoder.format()).to_lowercase())
                    .with_int("width", decoder.width() as i64)
                    .with_int("height", decoder.height() as i64)
                    .with_fraction("framerate", rate.numerator(), rate.denominator())
            }
            StreamDecoder::Audio(decoder) => Caps::new("audio/x-raw")
                .with_str("format", format!("{:?}", decoder.format()).to_lowercase())
                .with_int("rate", decoder.rate() as i64)
                .with_int("channels", decoder.channels() as i64),
        }
    }

    fn send_packet(&mut self, packet: &ffmpeg_next::Packet) -> anyhow::Result<()> {
        match self {
            StreamDecoder::Video(decoder) => decoder.send_packet(packet)?,
            StreamDecoder::Audio(decoder) => decoder.send_packet(packet)?,
        }
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        match self {
            StreamDecoder::Video(decoder) => decoder.send_eof()?,
            StreamDecoder::Audio(decoder) => decoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> anyhow::Result<Option<DecodedFrame>> {
        let result = match self {
            StreamDecoder::Video(decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                decoder
                    .receive_frame(&mut frame)
                    .map(|_| DecodedFrame::Video(frame))
            }
            StreamDecoder::Audio(decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                decoder
                    .receive_frame(&mut frame)
                    .map(|_| DecodedFrame::Audio(frame))
            }
        };
        match result {
            Ok(frame) => Ok(Some(frame)),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Caps of a stream nothing here can decode.
fn undecoded_caps(medium: Type) -> Option<Caps> {
    match medium {
        Type::Subtitle => Some(Caps::new("text/x-raw")),
        Type::Data => Some(Caps::new("application/x-data")),
        Type::Attachment => Some(Caps::new("application/x-attachment")),
        _ => None,
    }
}

struct DecodingStream {
    decoder: StreamDecoder,
    time_base: Rational,
}

/// Demuxes and decodes every audio and video stream of the input; buffers
/// carry [`DecodedFrame`]s with timestamps in microseconds.
pub struct FfmpegDemuxer {
    context: Option<InputContext>,
    streams: HashMap<usize, DecodingStream>,
    pending: VecDeque<DemuxEvent>,
    draining: bool,
}

impl FfmpegDemuxer {
    pub fn new() -> Self {
        Self {
            context: None,
            streams: HashMap::new(),
            pending: VecDeque::new(),
            draining: false,
        }
    }

    fn receive_frames(&mut self, index: usize) -> anyhow::Result<()> {
        let Some(stream) = self.streams.get_mut(&index) else {
            return Ok(());
        };
        while let Some(mut frame) = stream.decoder.receive_frame()? {
            let pts = frame.timestamp().map(|ts| {
                ts.rescale(stream.time_base, ffmpeg_next::util::mathematics::rescale::TIME_BASE)
            });
            frame.set_pts(pts);
            self.pending.push_back(DemuxEvent::Data {
                stream: StreamId(index as u32),
                buffer: Buffer::new(frame).with_pts(pts),
            });
        }
        Ok(())
    }
}

impl Default for FfmpegDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer for FfmpegDemuxer {
    fn open(&mut self, input: Box<dyn MediaInput>) -> anyhow::Result<()> {
        let context = InputContext::open(input)?;
        for stream in context.input.streams() {
            let index = stream.index();
            let medium = stream.parameters().medium();
            let caps = match StreamDecoder::new(&stream) {
                Ok(decoder) => {
                    let caps = decoder.caps(&stream);
                    self.streams.insert(
                        index,
                        DecodingStream {
                            decoder,
                            time_base: stream.time_base(),
                        },
                    );
                    Some(caps)
                }
                Err(e) => {
                    log::debug!("stream {} is not decoded: {:#}", index, e);
                    undecoded_caps(medium)
                }
            };
            self.pending.push_back(DemuxEvent::StreamAdded(StreamDescriptor::new(
                StreamId(index as u32),
                caps,
            )));
        }
        self.pending.push_back(DemuxEvent::NoMoreStreams);
        self.context = Some(context);
        Ok(())
    }

    fn next_event(&mut self) -> anyhow::Result<Option<DemuxEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.draining {
                return Ok(None);
            }
            let context = self
                .context
                .as_mut()
                .ok_or(anyhow::anyhow!("demuxer is not open"))?;
            let next = context
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) => {
                    if let Some(decoding) = self.streams.get_mut(&index) {
                        decoding.decoder.send_packet(&packet)?;
                        self.receive_frames(index)?;
                    }
                }
                None => {
                    self.draining = true;
                    let indexes: Vec<usize> = self.streams.keys().copied().collect();
                    for index in indexes {
                        if let Some(decoding) = self.streams.get_mut(&index) {
                            decoding.decoder.send_eof()?;
                        }
                        self.receive_frames(index)?;
                    }
                }
            }
        }
    }
}
