use std::{
    fmt::{Debug, Formatter},
    sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::media::{Buffer, StreamDescriptor};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub fn pad_channel(descriptor: StreamDescriptor, capacity: usize) -> (PadSender, StreamPad) {
    let (tx, rx) = std::sync::mpsc::sync_channel(capacity.max(1));
    (
        PadSender { tx },
        StreamPad {
            descriptor,
            receiver: rx,
        },
    )
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushResult {
    Ok,
    /// The downstream end was dropped: the stream is unrouted.
    NotLinked,
    /// The graph is shutting down.
    Flushing,
}

/// Demuxer-side end of a discovered stream.
pub struct PadSender {
    tx: SyncSender<Buffer>,
}

impl PadSender {
    /// Pushes one buffer, waiting while the pad is full. A pad nobody has
    /// linked yet holds up to its capacity before the demuxer stalls.
    pub fn push(&self, buffer: Buffer, cancel: &CancellationToken) -> PushResult {
        let mut buffer = buffer;
        loop {
            match self.tx.try_send(buffer) {
                Ok(()) => return PushResult::Ok,
                Err(TrySendError::Disconnected(_)) => return PushResult::NotLinked,
                Err(TrySendError::Full(b)) => {
                    if cancel.is_cancelled() {
                        return PushResult::Flushing;
                    }
                    buffer = b;
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }
}

/// Source pad of a discovered elementary stream, waiting to be linked.
pub struct StreamPad {
    descriptor: StreamDescriptor,
    receiver: Receiver<Buffer>,
}

pub enum PadPoll {
    Data(Buffer),
    Empty,
    Eos,
}

impl StreamPad {
    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn poll(&self) -> PadPoll {
        match self.receiver.recv_timeout(POLL_INTERVAL) {
            Ok(buffer) => PadPoll::Data(buffer),
            Err(RecvTimeoutError::Timeout) => PadPoll::Empty,
            Err(RecvTimeoutError::Disconnected) => PadPoll::Eos,
        }
    }
}

impl Debug for StreamPad {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPad")
            .field("stream", &self.descriptor.id())
            .field("caps", &self.descriptor.caps_string())
            .finish()
    }
}

#[cfg(test)]
#[path = "pad_test.rs"]
mod pad_test;
