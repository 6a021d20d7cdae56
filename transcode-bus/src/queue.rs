use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    graph::{EncoderInputSlot, GraphState},
    pad::{PadPoll, StreamPad},
};

/// Buffering stage between a discovered stream and its encoder input.
///
/// The pad holds the buffered data; once playing, the queue forwards it to
/// the mux stage on its own worker so one slow stream cannot block the
/// demuxer from feeding the others.
pub struct Queue {
    name: String,
    upstream: Option<StreamPad>,
    downstream: Option<EncoderInputSlot>,
    handle: Option<JoinHandle<()>>,
}

impl Queue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            upstream: None,
            downstream: None,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link_upstream(&mut self, pad: StreamPad) -> anyhow::Result<()> {
        if self.upstream.is_some() || self.handle.is_some() {
            return Err(anyhow::anyhow!("{}: sink pad already linked", self.name));
        }
        self.upstream = Some(pad);
        Ok(())
    }

    pub fn link_downstream(&mut self, slot: EncoderInputSlot) -> anyhow::Result<()> {
        if self.downstream.is_some() || self.handle.is_some() {
            return Err(anyhow::anyhow!("{}: src pad already linked", self.name));
        }
        self.downstream = Some(slot);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Brings the queue to the state of the graph it was added to. Only a
    /// playing graph starts the forwarding worker.
    pub fn sync_state_with_parent(
        &mut self,
        state: GraphState,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if state != GraphState::Playing || self.handle.is_some() {
            return Ok(());
        }
        let pad = self
            .upstream
            .take()
            .ok_or(anyhow::anyhow!("{}: sink pad not linked", self.name))?;
        let slot = match self.downstream.take() {
            Some(slot) => slot,
            None => {
                self.upstream = Some(pad);
                return Err(anyhow::anyhow!("{}: src pad not linked", self.name));
            }
        };

        let name = self.name.clone();
        let cancel = cancel.clone();
        self.handle = Some(tokio::task::spawn_blocking(move || {
            let mut forwarded = 0u64;
            loop {
                if cancel.is_cancelled() {
                    log::debug!("{}: flushing after {} buffers", name, forwarded);
                    break;
                }
                match pad.poll() {
                    PadPoll::Data(buffer) => {
                        if !slot.push(buffer, &cancel) {
                            break;
                        }
                        forwarded += 1;
                    }
                    PadPoll::Empty => {}
                    PadPoll::Eos => {
                        log::debug!("{}: eos on {} after {} buffers", name, slot.name(), forwarded);
                        slot.end(&cancel);
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    pub(crate) fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}
