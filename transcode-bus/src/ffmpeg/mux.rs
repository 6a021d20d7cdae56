use std::collections::HashMap;

use ffmpeg_next::{
    Dictionary, Rational, picture,
    software::{resampling, scaling},
    util::{
        channel_layout::ChannelLayout,
        format::{
            Pixel,
            sample::{Sample, Type as SampleType},
        },
        mathematics::rescale::TIME_BASE,
    },
};

use super::{DecodedFrame, io::OutputContext};
use crate::{
    media::{Buffer, Caps, MediaKind, StreamDescriptor},
    profile::{ContainerFormat, EncoderParameters, TargetParameters},
    stage::{ByteSink, Muxer, SlotName},
};

/// Holds converted audio until the encoder's frame size is reached.
struct SampleFifo {
    format: Sample,
    layout: ChannelLayout,
    rate: u32,
    // bytes of one sample in one plane
    stride: usize,
    planes: Vec<Vec<u8>>,
}

impl SampleFifo {
    fn new(format: Sample, layout: ChannelLayout, rate: u32) -> Self {
        let channels = layout.channels().max(1) as usize;
        let (planes, stride) = if format.is_planar() {
            (channels, format.bytes())
        } else {
            (1, format.bytes() * channels)
        };
        Self {
            format,
            layout,
            rate,
            stride,
            planes: vec![Vec::new(); planes],
        }
    }

    fn len(&self) -> usize {
        self.planes.first().map_or(0, |plane| plane.len() / self.stride)
    }

    fn push(&mut self, frame: &ffmpeg_next::frame::Audio) {
        let bytes = frame.samples() * self.stride;
        for (index, plane) in self.planes.iter_mut().enumerate() {
            plane.extend_from_slice(&frame.data(index)[..bytes]);
        }
    }

    /// Appends silence up to `samples`.
    fn pad_to(&mut self, samples: usize) {
        let bytes = samples * self.stride;
        for plane in self.planes.iter_mut() {
            if plane.len() < bytes {
                plane.resize(bytes, 0);
            }
        }
    }

    fn pop(&mut self, samples: usize) -> Option<ffmpeg_next::frame::Audio> {
        let samples = samples.min(self.len());
        if samples == 0 {
            return None;
        }
        let mut frame = ffmpeg_next::frame::Audio::new(self.format, samples, self.layout);
        frame.set_rate(self.rate);
        let bytes = samples * self.stride;
        for (index, plane) in self.planes.iter_mut().enumerate() {
            frame.data_mut(index)[..bytes].copy_from_slice(&plane[..bytes]);
            plane.drain(..bytes);
        }
        Some(frame)
    }
}

enum StreamEncoder {
    Video {
        encoder: ffmpeg_next::codec::encoder::Video,
        scaler: Option<scaling::Context>,
        frame_index: i64,
    },
    Audio {
        encoder: ffmpeg_next::codec::encoder::Audio,
        resampler: Option<resampling::Context>,
        fifo: SampleFifo,
        // 0 = any size
        frame_size: usize,
        samples: i64,
    },
}

impl StreamEncoder {
    fn send_frame(&mut self, frame: &ffmpeg_next::Frame) -> anyhow::Result<()> {
        match self {
            StreamEncoder::Video { encoder, .. } => encoder.send_frame(frame)?,
            StreamEncoder::Audio { encoder, .. } => encoder.send_frame(frame)?,
        }
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        match self {
            StreamEncoder::Video { encoder, .. } => encoder.send_eof()?,
            StreamEncoder::Audio { encoder, .. } => encoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> anyhow::Result<Option<ffmpeg_next::Packet>> {
        let mut packet = ffmpeg_next::Packet::empty();
        let result = match self {
            StreamEncoder::Video { encoder, .. } => encoder.receive_packet(&mut packet),
            StreamEncoder::Audio { encoder, .. } => encoder.receive_packet(&mut packet),
        };
        match result {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

unsafe impl Send for StreamEncoder {}

fn encoder_options(parameters: &EncoderParameters) -> Dictionary<'static> {
    let mut options = Dictionary::new();
    if let Some(preset) = &parameters.preset {
        options.set("preset", preset);
    }
    options
}

fn find_codec(parameters: &EncoderParameters) -> anyhow::Result<ffmpeg_next::Codec> {
    ffmpeg_next::encoder::find_by_name(&parameters.codec)
        .ok_or(anyhow::anyhow!("encoder not found: {}", parameters.codec))
}

struct EncodingSlot {
    encoder: StreamEncoder,
    stream_index: usize,
    time_base: Rational,
    ended: bool,
}

impl EncodingSlot {
    fn video(
        output: &mut ffmpeg_next::format::context::Output,
        caps: &Caps,
        parameters: &EncoderParameters,
        global_header: bool,
    ) -> anyhow::Result<Self> {
        let width = caps
            .get_int("width")
            .filter(|w| *w > 0)
            .ok_or(anyhow::anyhow!("video caps without a width: {}", caps))?;
        let height = caps
            .get_int("height")
            .filter(|h| *h > 0)
            .ok_or(anyhow::anyhow!("video caps without a height: {}", caps))?;
        let codec = find_codec(parameters)?;
        let format = codec
            .video()
            .ok()
            .and_then(|video| video.formats())
            .and_then(|mut formats| formats.next())
            .unwrap_or(Pixel::YUV420P);

        let mut encoder = ffmpeg_next::codec::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_width(width as u32);
        encoder.set_height(height as u32);
        encoder.set_format(format);
        if let Some((num, den)) = caps.get_fraction("framerate").filter(|(n, d)| *n > 0 && *d > 0) {
            encoder.set_frame_rate(Some(Rational::new(num, den)));
        }
        encoder.set_time_base(TIME_BASE);
        if let Some(bitrate) = parameters.bitrate {
            encoder.set_bit_rate(bitrate as usize);
        }
        if global_header {
            encoder.set_flags(ffmpeg_next::codec::flag::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_with(encoder_options(parameters))?;

        let mut stream = output.add_stream(codec)?;
        stream.set_time_base(TIME_BASE);
        stream.set_parameters(&encoder);
        Ok(Self {
            stream_index: stream.index(),
            encoder: StreamEncoder::Video {
                encoder,
                scaler: None,
                frame_index: 0,
            },
            time_base: TIME_BASE,
            ended: false,
        })
    }

    fn audio(
        output: &mut ffmpeg_next::format::context::Output,
        caps: &Caps,
        parameters: &EncoderParameters,
        global_header: bool,
    ) -> anyhow::Result<Self> {
        let rate = caps
            .get_int("rate")
            .filter(|r| *r > 0)
            .ok_or(anyhow::anyhow!("audio caps without a rate: {}", caps))?;
        let layout = match caps.get_int("channels") {
            Some(1) => ChannelLayout::MONO,
            _ => ChannelLayout::STEREO,
        };
        let codec = find_codec(parameters)?;
        let format = codec
            .audio()
            .ok()
            .and_then(|audio| audio.formats())
            .and_then(|mut formats| formats.next())
            .unwrap_or(Sample::F32(SampleType::Planar));
        let time_base = Rational::new(1, rate as i32);

        let mut encoder = ffmpeg_next::codec::Context::new_with_codec(codec)
            .encoder()
            .audio()?;
        encoder.set_rate(rate as i32);
        encoder.set_channel_layout(layout);
        encoder.set_format(format);
        encoder.set_time_base(time_base);
        if let Some(bitrate) = parameters.bitrate {
            encoder.set_bit_rate(bitrate as usize);
        }
        if global_header {
            encoder.set_flags(ffmpeg_next::codec::flag::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_with(encoder_options(parameters))?;
        let frame_size = encoder.frame_size() as usize;

        let mut stream = output.add_stream(codec)?;
        stream.set_time_base(time_base);
        stream.set_parameters(&encoder);
        Ok(Self {
            stream_index: stream.index(),
            encoder: StreamEncoder::Audio {
                encoder,
                resampler: None,
                fifo: SampleFifo::new(format, layout, rate as u32),
                frame_size,
                samples: 0,
            },
            time_base,
            ended: false,
        })
    }

    fn write(
        &mut self,
        frame: DecodedFrame,
        output: &mut ffmpeg_next::format::context::Output,
    ) -> anyhow::Result<()> {
        let kind = self.kind();
        match (&mut self.encoder, frame) {
            (
                StreamEncoder::Video {
                    encoder,
                    scaler,
                    frame_index,
                },
                DecodedFrame::Video(mut frame),
            ) => {
                if frame.pts().is_none() {
                    frame.set_pts(Some(*frame_index));
                }
                *frame_index += 1;
                // Let the encoder pick its own picture types.
                frame.set_kind(picture::Type::None);
                if frame.format() != encoder.format()
                    || frame.width() != encoder.width()
                    || frame.height() != encoder.height()
                {
                    let context = match scaler.take() {
                        Some(context) => context,
                        None => scaling::Context::get(
                            frame.format(),
                            frame.width(),
                            frame.height(),
                            encoder.format(),
                            encoder.width(),
                            encoder.height(),
                            scaling::flag::Flags::BILINEAR,
                        )?,
                    };
                    let context = scaler.insert(context);
                    let mut converted = ffmpeg_next::frame::Video::empty();
                    context.run(&frame, &mut converted)?;
                    converted.set_pts(frame.pts());
                    frame = converted;
                }
                self.encoder.send_frame(&frame)?;
                self.drain(output)
            }
            (
                StreamEncoder::Audio {
                    encoder,
                    resampler,
                    fifo,
                    ..
                },
                DecodedFrame::Audio(frame),
            ) => {
                let layout = if frame.channel_layout().bits() == 0 {
                    match frame.channels() {
                        1 => ChannelLayout::MONO,
                        _ => ChannelLayout::STEREO,
                    }
                } else {
                    frame.channel_layout()
                };
                if frame.format() == encoder.format()
                    && layout == encoder.channel_layout()
                    && frame.rate() == encoder.rate()
                {
                    fifo.push(&frame);
                } else {
                    let context = match resampler.take() {
                        Some(context) => context,
                        None => resampling::Context::get(
                            frame.format(),
                            layout,
                            frame.rate(),
                            encoder.format(),
                            encoder.channel_layout(),
                            encoder.rate(),
                        )?,
                    };
                    let context = resampler.insert(context);
                    let mut converted = ffmpeg_next::frame::Audio::empty();
                    context.run(&frame, &mut converted)?;
                    if converted.samples() > 0 {
                        fifo.push(&converted);
                    }
                }
                self.send_audio(output, false)
            }
            _ => anyhow::bail!("frame does not match the {} encoder", kind),
        }
    }

    /// Encodes what the FIFO holds in encoder-sized frames. On `last` the
    /// remainder is padded with silence.
    fn send_audio(
        &mut self,
        output: &mut ffmpeg_next::format::context::Output,
        last: bool,
    ) -> anyhow::Result<()> {
        loop {
            let StreamEncoder::Audio {
                fifo,
                frame_size,
                samples,
                ..
            } = &mut self.encoder
            else {
                return Ok(());
            };
            let wanted = match *frame_size {
                0 => fifo.len(),
                size if fifo.len() >= size => size,
                size if last && fifo.len() > 0 => {
                    fifo.pad_to(size);
                    size
                }
                _ => return Ok(()),
            };
            let Some(mut frame) = fifo.pop(wanted) else {
                return Ok(());
            };
            frame.set_pts(Some(*samples));
            *samples += frame.samples() as i64;
            self.encoder.send_frame(&frame)?;
            self.drain(output)?;
        }
    }

    fn end(&mut self, output: &mut ffmpeg_next::format::context::Output) -> anyhow::Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        if let StreamEncoder::Audio {
            resampler: Some(context),
            fifo,
            ..
        } = &mut self.encoder
        {
            let mut remaining = ffmpeg_next::frame::Audio::empty();
            match context.flush(&mut remaining) {
                Ok(_) if remaining.samples() > 0 => fifo.push(&remaining),
                Ok(_) => {}
                Err(e) => log::debug!("resampler flush: {}", e),
            }
        }
        self.send_audio(output, true)?;
        self.encoder.send_eof()?;
        self.drain(output)
    }

    fn drain(&mut self, output: &mut ffmpeg_next::format::context::Output) -> anyhow::Result<()> {
        while let Some(mut packet) = self.encoder.receive_packet()? {
            let stream_time_base = output
                .stream(self.stream_index)
                .map(|stream| stream.time_base())
                .ok_or(anyhow::anyhow!("output stream {} is gone", self.stream_index))?;
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.time_base, stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }

    fn kind(&self) -> MediaKind {
        match self.encoder {
            StreamEncoder::Video { .. } => MediaKind::Video,
            StreamEncoder::Audio { .. } => MediaKind::Audio,
        }
    }
}

enum PendingWrite {
    Data(SlotName, Buffer),
    End(SlotName),
}

/// Encodes decoded frames per slot and packages them with an FFmpeg muxer.
///
/// The container header can only go out once every stream is known, so
/// writes that arrive before [`Muxer::seal`] are held back and replayed.
pub struct FfmpegMuxer {
    container: ContainerFormat,
    output: Option<OutputContext>,
    slots: HashMap<SlotName, EncodingSlot>,
    pending: Vec<PendingWrite>,
    header_written: bool,
}

impl FfmpegMuxer {
    pub fn new(container: ContainerFormat) -> Self {
        Self {
            container,
            output: None,
            slots: HashMap::new(),
            pending: Vec::new(),
            header_written: false,
        }
    }

    fn write_header(&mut self) -> anyhow::Result<()> {
        if self.header_written {
            return Ok(());
        }
        let context = self
            .output
            .as_mut()
            .ok_or(anyhow::anyhow!("muxer is not open"))?;
        context.output.write_header()?;
        self.header_written = true;
        log::info!(
            "{} header written with {} streams",
            self.container.name,
            self.slots.len()
        );
        for write in std::mem::take(&mut self.pending) {
            match write {
                PendingWrite::Data(slot, buffer) => self.write(&slot, buffer)?,
                PendingWrite::End(slot) => self.end_input(&slot)?,
            }
        }
        Ok(())
    }
}

impl Muxer for FfmpegMuxer {
    fn open(&mut self, output: Box<dyn ByteSink>) -> anyhow::Result<()> {
        self.output = Some(OutputContext::open(&self.container.muxer, output)?);
        Ok(())
    }

    fn add_input(
        &mut self,
        slot: &SlotName,
        stream: &StreamDescriptor,
        target: &TargetParameters,
    ) -> anyhow::Result<()> {
        if self.header_written {
            anyhow::bail!("{} header already written", self.container.name);
        }
        let context = self
            .output
            .as_mut()
            .ok_or(anyhow::anyhow!("muxer is not open"))?;
        let caps = stream
            .caps()
            .ok_or(anyhow::anyhow!("{} has no caps", stream.id()))?;
        let global_header = context
            .output
            .format()
            .flags()
            .contains(ffmpeg_next::format::flag::Flags::GLOBAL_HEADER);
        let encoding = match target.kind {
            MediaKind::Video => {
                EncodingSlot::video(&mut context.output, caps, &target.encoder, global_header)?
            }
            MediaKind::Audio => {
                EncodingSlot::audio(&mut context.output, caps, &target.encoder, global_header)?
            }
            MediaKind::Other => anyhow::bail!("no encoder for {}", stream.id()),
        };
        log::debug!(
            "{}: {} encoder on output stream {}",
            slot,
            target.encoder.codec,
            encoding.stream_index
        );
        self.slots.insert(slot.clone(), encoding);
        Ok(())
    }

    fn seal(&mut self) -> anyhow::Result<()> {
        self.write_header()
    }

    fn write(&mut self, slot: &SlotName, buffer: Buffer) -> anyhow::Result<()> {
        if !self.header_written {
            self.pending.push(PendingWrite::Data(slot.clone(), buffer));
            return Ok(());
        }
        let frame = buffer
            .into_payload::<DecodedFrame>()
            .map_err(|_| anyhow::anyhow!("{}: buffer does not hold a decoded frame", slot))?;
        let context = self
            .output
            .as_mut()
            .ok_or(anyhow::anyhow!("muxer is not open"))?;
        let encoding = self
            .slots
            .get_mut(slot)
            .ok_or(anyhow::anyhow!("unknown slot {}", slot))?;
        encoding.write(frame, &mut context.output)
    }

    fn end_input(&mut self, slot: &SlotName) -> anyhow::Result<()> {
        if !self.header_written {
            self.pending.push(PendingWrite::End(slot.clone()));
            return Ok(());
        }
        let context = self
            .output
            .as_mut()
            .ok_or(anyhow::anyhow!("muxer is not open"))?;
        let encoding = self
            .slots
            .get_mut(slot)
            .ok_or(anyhow::anyhow!("unknown slot {}", slot))?;
        encoding.end(&mut context.output)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.write_header()?;
        let mut context = self
            .output
            .take()
            .ok_or(anyhow::anyhow!("muxer is not open"))?;
        for encoding in self.slots.values_mut() {
            encoding.end(&mut context.output)?;
        }
        context.output.write_trailer()?;
        context.finish()
    }
}
