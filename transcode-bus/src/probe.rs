use std::{
    io::{Read, Seek, SeekFrom},
    time::{Duration, Instant},
};

use crate::{
    bus::{Bus, BusMessage},
    stage::ByteSource,
};

/// Sits between the source reader and the demuxer, reporting how far into
/// the source the demuxer has read.
pub struct ProgressProbe {
    source: Box<dyn ByteSource>,
    bus: Bus,
    interval: Duration,
    position: u64,
    last_report: Option<(Instant, f64)>,
}

impl ProgressProbe {
    pub fn new(source: Box<dyn ByteSource>, bus: Bus, interval: Duration) -> Self {
        Self {
            source,
            bus,
            interval,
            position: 0,
            last_report: None,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self.source.size() {
            Some(0) | None => None,
            Some(size) => Some((self.position as f64 * 100.0 / size as f64).min(100.0)),
        }
    }

    fn report(&mut self, eof: bool) {
        let percent = match self.percent() {
            Some(_) if eof => 100.0,
            Some(percent) => percent,
            None => return,
        };
        let now = Instant::now();
        let due = match self.last_report {
            None => true,
            Some((_, last)) if eof => last < 100.0,
            Some((at, last)) => percent != last && now.duration_since(at) >= self.interval,
        };
        if due {
            log::trace!("progress {:.1}%", percent);
            self.last_report = Some((now, percent));
            self.bus.post(BusMessage::Progress { percent });
        }
    }
}

impl Read for ProgressProbe {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.source.read(buf).map_err(std::io::Error::other)?;
        self.position += n as u64;
        self.report(n == 0 && !buf.is_empty());
        Ok(n)
    }
}

impl Seek for ProgressProbe {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let position = self.source.seek(pos).map_err(std::io::Error::other)?;
        self.position = position;
        Ok(position)
    }
}

#[cfg(test)]
#[path = "probe_test.rs"]
mod probe_test;
