/// Registers FFmpeg components. Call once at startup before running a job
/// with the FFmpeg stages.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

/// Nothing to register without the FFmpeg stages.
#[cfg(not(feature = "ffmpeg"))]
pub fn init() -> anyhow::Result<()> {
    Ok(())
}

pub mod bus;
pub mod config;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod file;
pub mod graph;
pub mod job;
pub mod lifecycle;
pub mod media;
pub mod pad;
pub mod probe;
pub mod profile;
pub mod queue;
pub mod router;
pub mod stage;

#[cfg(test)]
pub(crate) mod testing;

pub use config::BusConfig;
pub use error::{ErrorKind, RouteDrop, TranscodeError};
pub use job::{JobHandle, JobStopper, TranscodeJob, TranscodeListener};
pub use lifecycle::{LifecycleEvent, RunState};
pub use profile::EncodingProfile;
