//! FFmpeg-backed stages: decoding demuxer and encoding muxer.

mod demux;
mod io;
mod mux;

pub use demux::FfmpegDemuxer;
pub use mux::FfmpegMuxer;

use crate::{
    profile::ContainerFormat,
    stage::{Demuxer, Muxer, StageFactory},
};

/// Payload of the buffers flowing from [`FfmpegDemuxer`] to [`FfmpegMuxer`].
pub enum DecodedFrame {
    Video(ffmpeg_next::frame::Video),
    Audio(ffmpeg_next::frame::Audio),
}

impl DecodedFrame {
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            DecodedFrame::Video(frame) => frame.timestamp(),
            DecodedFrame::Audio(frame) => frame.timestamp(),
        }
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        match self {
            DecodedFrame::Video(frame) => frame.set_pts(pts),
            DecodedFrame::Audio(frame) => frame.set_pts(pts),
        }
    }
}

unsafe impl Send for DecodedFrame {}

pub struct FfmpegFactory;

impl FfmpegFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FfmpegFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for FfmpegFactory {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn make_demuxer(&self) -> anyhow::Result<Box<dyn Demuxer>> {
        Ok(Box::new(FfmpegDemuxer::new()))
    }

    fn make_muxer(&self, container: &ContainerFormat) -> anyhow::Result<Box<dyn Muxer>> {
        if !io::has_muxer(&container.muxer) {
            anyhow::bail!("ffmpeg has no muxer named {}", container.muxer);
        }
        Ok(Box::new(FfmpegMuxer::new(container.clone())))
    }
}
