use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{graph::GraphState, pad::StreamPad};

/// Notification posted by a stage of the graph.
#[derive(Debug)]
pub enum BusMessage {
    StateChanged { old: GraphState, new: GraphState },
    /// The demuxer found a stream; the pad must be linked or dropped.
    StreamDiscovered(StreamPad),
    /// Posted once, after every `StreamDiscovered`.
    NoMoreStreams,
    /// Read position of the source, 0..=100.
    Progress { percent: f64 },
    /// Every linked stream has been written and the output finalized.
    Eos,
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },
}

/// Posting end of the graph's bus. Delivery is in order to a single consumer.
#[derive(Clone)]
pub struct Bus {
    tx: UnboundedSender<BusMessage>,
}

impl Bus {
    pub fn new() -> (Bus, BusReceiver) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Bus { tx }, BusReceiver { rx })
    }

    /// Returns false once the receiver is closed.
    pub fn post(&self, message: BusMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn post_error(&self, source: &str, message: &str, err: &anyhow::Error) {
        log::error!("{}: {}: {:#}", source, message, err);
        self.post(BusMessage::Error {
            source: source.to_string(),
            message: message.to_string(),
            debug: Some(format!("{:#}", err)),
        });
    }
}

pub struct BusReceiver {
    rx: UnboundedReceiver<BusMessage>,
}

impl BusReceiver {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }

    /// Refuses further messages and drops the pending ones, unlinking any
    /// pad still waiting in the queue.
    pub fn close_and_drain(&mut self) -> usize {
        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;
