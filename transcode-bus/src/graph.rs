//! The stage graph: source → progress probe → demux/decode on one side,
//! encode/mux → sink on the other. The segment in between is filled in per
//! discovered stream by the router, through [`StageGraph::request_slot`] and
//! [`StageGraph::add_queue`].

use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Formatter},
    sync::{
        Arc,
        mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError},
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{Bus, BusMessage, BusReceiver},
    config::BusConfig,
    error::{RouteDrop, TranscodeError},
    media::{Buffer, MediaKind, StreamDescriptor, StreamId},
    pad::{PadSender, PushResult, pad_channel},
    probe::ProgressProbe,
    profile::{EncodingProfile, TargetParameters},
    queue::Queue,
    stage::{ByteSink, ByteSource, DemuxEvent, Demuxer, Muxer, SlotName, StageFactory},
};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraphState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl Display for GraphState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphState::Null => f.write_str("NULL"),
            GraphState::Ready => f.write_str("READY"),
            GraphState::Paused => f.write_str("PAUSED"),
            GraphState::Playing => f.write_str("PLAYING"),
        }
    }
}

pub(crate) enum MuxCommand {
    AddInput {
        descriptor: StreamDescriptor,
        target: TargetParameters,
        result: tokio::sync::oneshot::Sender<anyhow::Result<SlotName>>,
    },
    Data {
        slot: SlotName,
        buffer: Buffer,
    },
    EndOfSlot {
        slot: SlotName,
    },
    Seal,
}

/// An input of the mux stage, created on request for one stream.
pub struct EncoderInputSlot {
    name: SlotName,
    tx: SyncSender<MuxCommand>,
}

impl EncoderInputSlot {
    pub fn name(&self) -> &SlotName {
        &self.name
    }

    /// Returns false once the graph is flushing or the mux stage is gone.
    pub(crate) fn push(&self, buffer: Buffer, cancel: &CancellationToken) -> bool {
        send_blocking(
            &self.tx,
            MuxCommand::Data {
                slot: self.name.clone(),
                buffer,
            },
            cancel,
        )
    }

    pub(crate) fn end(&self, cancel: &CancellationToken) {
        send_blocking(
            &self.tx,
            MuxCommand::EndOfSlot {
                slot: self.name.clone(),
            },
            cancel,
        );
    }
}

fn send_blocking(
    tx: &SyncSender<MuxCommand>,
    command: MuxCommand,
    cancel: &CancellationToken,
) -> bool {
    let mut command = command;
    loop {
        match tx.try_send(command) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(c)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                command = c;
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

pub struct StageGraph {
    factory: Arc<dyn StageFactory>,
    config: BusConfig,
    source: Option<Box<dyn ByteSource>>,
    sink: Option<Box<dyn ByteSink>>,
    demuxer: Option<Box<dyn Demuxer>>,
    muxer: Option<Box<dyn Muxer>>,
    profile: Option<EncodingProfile>,
    bus: Bus,
    bus_rx: Option<BusReceiver>,
    state: GraphState,
    cancel: CancellationToken,
    mux_tx: Option<SyncSender<MuxCommand>>,
    workers: Vec<JoinHandle<()>>,
    queues: Vec<Queue>,
}

impl StageGraph {
    /// Instantiates the fixed stages. Nothing is opened and no data flows
    /// until the graph is set to playing.
    pub fn build(
        factory: Arc<dyn StageFactory>,
        source_location: &str,
        destination_location: &str,
        config: BusConfig,
    ) -> Result<Self, TranscodeError> {
        if source_location.is_empty() {
            return Err(TranscodeError::config("no source location supplied"));
        }
        if destination_location.is_empty() {
            return Err(TranscodeError::config("no destination location supplied"));
        }

        let source = factory
            .make_source(source_location)
            .map_err(|e| TranscodeError::config(format!("source: {:#}", e)))?;
        let sink = factory
            .make_sink(destination_location)
            .map_err(|e| TranscodeError::config(format!("destination: {:#}", e)))?;
        let demuxer = factory
            .make_demuxer()
            .map_err(|e| TranscodeError::config(format!("demuxer: {:#}", e)))?;
        log::debug!(
            "built {} graph: {} -> {}",
            factory.name(),
            source_location,
            destination_location
        );

        let (bus, bus_rx) = Bus::new();
        Ok(Self {
            factory,
            config,
            source: Some(source),
            sink: Some(sink),
            demuxer: Some(demuxer),
            muxer: None,
            profile: None,
            bus,
            bus_rx: Some(bus_rx),
            state: GraphState::Null,
            cancel: CancellationToken::new(),
            mux_tx: None,
            workers: Vec::new(),
            queues: Vec::new(),
        })
    }

    /// Selects the target of the mux stage and instantiates it.
    pub fn set_profile(&mut self, profile: EncodingProfile) -> Result<(), TranscodeError> {
        if self.state != GraphState::Null {
            return Err(TranscodeError::config(
                "the profile can only be set before the graph starts",
            ));
        }
        profile.validate()?;
        let muxer = self.factory.make_muxer(&profile.container).map_err(|e| {
            TranscodeError::config(format!(
                "unsupported container {}: {:#}",
                profile.container.name, e
            ))
        })?;
        self.muxer = Some(muxer);
        self.profile = Some(profile);
        Ok(())
    }

    pub fn profile(&self) -> Option<&EncodingProfile> {
        self.profile.as_ref()
    }

    /// Hands out the single consuming end of the bus.
    pub fn take_bus(&mut self) -> Option<BusReceiver> {
        self.bus_rx.take()
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Whether a shutdown still has something to release.
    pub fn holds_resources(&self) -> bool {
        self.state != GraphState::Null || !self.workers.is_empty() || !self.queues.is_empty()
    }

    /// Moves the graph up to `target` one state at a time.
    pub fn set_state(&mut self, target: GraphState) -> Result<(), TranscodeError> {
        if target < self.state {
            return Err(TranscodeError::config(format!(
                "cannot go from {} to {} without a shutdown",
                self.state, target
            )));
        }
        while self.state < target {
            let next = match self.state {
                GraphState::Null => {
                    self.open_stages()?;
                    GraphState::Ready
                }
                GraphState::Ready => {
                    self.prepare_mux()?;
                    GraphState::Paused
                }
                GraphState::Paused => {
                    self.spawn_workers()?;
                    GraphState::Playing
                }
                GraphState::Playing => break,
            };
            let old = self.state;
            self.state = next;
            log::debug!("graph state {} -> {}", old, next);
            self.bus.post(BusMessage::StateChanged { old, new: next });
        }
        for queue in self.queues.iter_mut() {
            queue
                .sync_state_with_parent(self.state, &self.cancel)
                .map_err(|e| start_failure("could not start queue", e))?;
        }
        Ok(())
    }

    fn open_stages(&mut self) -> Result<(), TranscodeError> {
        let source = self
            .source
            .as_mut()
            .ok_or(TranscodeError::config("graph has no source"))?;
        source
            .open()
            .map_err(|e| start_failure(&format!("could not open {}", source.location()), e))?;
        let sink = self
            .sink
            .as_mut()
            .ok_or(TranscodeError::config("graph has no sink"))?;
        sink.open()
            .map_err(|e| start_failure(&format!("could not open {}", sink.location()), e))?;
        Ok(())
    }

    fn prepare_mux(&mut self) -> Result<(), TranscodeError> {
        let muxer = self
            .muxer
            .as_mut()
            .ok_or(TranscodeError::config("no encoding profile set"))?;
        let sink = self
            .sink
            .take()
            .ok_or(TranscodeError::config("graph has no sink"))?;
        muxer
            .open(sink)
            .map_err(|e| start_failure("could not open the muxer", e))
    }

    fn spawn_workers(&mut self) -> Result<(), TranscodeError> {
        let source = self
            .source
            .take()
            .ok_or(TranscodeError::config("graph has no source"))?;
        let demuxer = self
            .demuxer
            .take()
            .ok_or(TranscodeError::config("graph has no demuxer"))?;
        let muxer = self
            .muxer
            .take()
            .ok_or(TranscodeError::config("no encoding profile set"))?;

        let (mux_tx, mux_rx) = std::sync::mpsc::sync_channel(self.config.mux_queue_capacity.max(1));
        self.mux_tx = Some(mux_tx);

        let probe = ProgressProbe::new(source, self.bus.clone(), self.config.progress_interval());
        let bus = self.bus.clone();
        let cancel = self.cancel.clone();
        let pad_capacity = self.config.pad_capacity;
        self.workers.push(tokio::task::spawn_blocking(move || {
            demux_loop(demuxer, probe, bus, cancel, pad_capacity)
        }));

        let bus = self.bus.clone();
        let cancel = self.cancel.clone();
        self.workers.push(tokio::task::spawn_blocking(move || {
            mux_loop(muxer, mux_rx, bus, cancel)
        }));
        Ok(())
    }

    async fn send_to_mux(&mut self, command: MuxCommand) -> anyhow::Result<()> {
        let tx = self
            .mux_tx
            .as_ref()
            .ok_or(anyhow::anyhow!("graph is not playing"))?;
        let mut command = command;
        loop {
            match tx.try_send(command) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => {
                    return Err(anyhow::anyhow!("mux stage has stopped"));
                }
                Err(TrySendError::Full(c)) => {
                    if self.cancel.is_cancelled() {
                        return Err(anyhow::anyhow!("graph is shutting down"));
                    }
                    command = c;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Asks the mux stage for a new input of `target.kind`. Requests are
    /// handled one at a time by the mux worker, in order.
    pub async fn request_slot(
        &mut self,
        descriptor: &StreamDescriptor,
        target: TargetParameters,
    ) -> anyhow::Result<EncoderInputSlot> {
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.send_to_mux(MuxCommand::AddInput {
            descriptor: descriptor.clone(),
            target,
            result: result_tx,
        })
        .await?;
        let name = result_rx
            .await
            .map_err(|_| anyhow::anyhow!("mux stage dropped the request"))??;
        let tx = self
            .mux_tx
            .as_ref()
            .ok_or(anyhow::anyhow!("graph is not playing"))?
            .clone();
        Ok(EncoderInputSlot { name, tx })
    }

    /// Adds a linked queue to the graph and starts it if the graph is running.
    pub fn add_queue(&mut self, mut queue: Queue) -> anyhow::Result<()> {
        queue.sync_state_with_parent(self.state, &self.cancel)?;
        self.queues.push(queue);
        Ok(())
    }

    /// Ends a slot that was granted but never linked, so the mux stage does
    /// not wait on it.
    pub async fn release_slot(&mut self, slot: SlotName) -> anyhow::Result<()> {
        self.send_to_mux(MuxCommand::EndOfSlot { slot }).await
    }

    /// No more inputs will be requested; the mux stage finishes the output
    /// once every slot has ended.
    pub async fn seal_inputs(&mut self) -> anyhow::Result<()> {
        self.send_to_mux(MuxCommand::Seal).await
    }

    /// Stops every worker and releases all stages. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        if !self.holds_resources() {
            return;
        }
        self.cancel.cancel();
        self.mux_tx = None;

        let mut handles: Vec<JoinHandle<()>> = self.workers.drain(..).collect();
        for queue in self.queues.iter_mut() {
            if let Some(handle) = queue.take_handle() {
                handles.push(handle);
            }
        }
        self.queues.clear();
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("graph worker failed: {:#?}", e);
            }
        }

        self.source = None;
        self.sink = None;
        self.demuxer = None;
        self.muxer = None;
        let old = self.state;
        self.state = GraphState::Null;
        log::debug!("graph state {} -> {}", old, self.state);
        self.bus.post(BusMessage::StateChanged {
            old,
            new: GraphState::Null,
        });
    }
}

fn start_failure(message: &str, err: anyhow::Error) -> TranscodeError {
    TranscodeError::StartFailure {
        message: message.to_string(),
        debug: Some(format!("{:#}", err)),
    }
}

fn demux_loop(
    mut demuxer: Box<dyn Demuxer>,
    probe: ProgressProbe,
    bus: Bus,
    cancel: CancellationToken,
    pad_capacity: usize,
) {
    if let Err(e) = demuxer.open(Box::new(probe)) {
        bus.post_error("demux", "could not read the input", &e);
        return;
    }

    let mut pads: HashMap<StreamId, PadSender> = HashMap::new();
    let mut no_more_streams = false;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match demuxer.next_event() {
            Ok(Some(DemuxEvent::StreamAdded(descriptor))) => {
                if no_more_streams {
                    log::warn!("{}", RouteDrop::LateStream(descriptor.id()));
                    continue;
                }
                log::debug!("new pad {}: {}", descriptor.id(), descriptor.caps_string());
                let id = descriptor.id();
                let (sender, pad) = pad_channel(descriptor, pad_capacity);
                pads.insert(id, sender);
                bus.post(BusMessage::StreamDiscovered(pad));
            }
            Ok(Some(DemuxEvent::NoMoreStreams)) => {
                if !no_more_streams {
                    no_more_streams = true;
                    bus.post(BusMessage::NoMoreStreams);
                }
            }
            Ok(Some(DemuxEvent::Data { stream, buffer })) => {
                let Some(pad) = pads.get(&stream) else {
                    continue;
                };
                match pad.push(buffer, &cancel) {
                    PushResult::Ok => {}
                    PushResult::NotLinked => {
                        log::debug!("{} is not linked, discarding its data", stream);
                        pads.remove(&stream);
                    }
                    PushResult::Flushing => break,
                }
            }
            Ok(None) => {
                if !no_more_streams {
                    bus.post(BusMessage::NoMoreStreams);
                }
                log::debug!("demux: end of input");
                break;
            }
            Err(e) => {
                bus.post_error("demux", "internal data stream error", &e);
                break;
            }
        }
    }
    // Dropping the senders ends every linked stream.
    drop(pads);
}

struct MuxState {
    muxer: Box<dyn Muxer>,
    next_index: HashMap<MediaKind, u32>,
    open_slots: HashSet<SlotName>,
    sealed: bool,
}

impl MuxState {
    fn add_input(
        &mut self,
        descriptor: &StreamDescriptor,
        target: &TargetParameters,
    ) -> anyhow::Result<SlotName> {
        if self.sealed {
            return Err(anyhow::anyhow!("inputs are sealed"));
        }
        if target.kind.slot_prefix().is_none() {
            return Err(anyhow::anyhow!("no encoder input for {} streams", target.kind));
        }
        let index = self.next_index.get(&target.kind).copied().unwrap_or(0);
        let presence = target.encoder.presence;
        if presence > 0 && index >= presence {
            return Err(anyhow::anyhow!(
                "all {} {} slots are taken",
                presence,
                target.kind
            ));
        }
        let slot = SlotName::new(target.kind, index);
        self.muxer.add_input(&slot, descriptor, target)?;
        self.next_index.insert(target.kind, index + 1);
        self.open_slots.insert(slot.clone());
        log::info!(
            "{} -> {} ({})",
            descriptor.id(),
            slot,
            target.encoder.codec
        );
        Ok(slot)
    }

    fn handle(&mut self, command: MuxCommand) -> anyhow::Result<()> {
        match command {
            MuxCommand::AddInput {
                descriptor,
                target,
                result,
            } => {
                let _ = result.send(self.add_input(&descriptor, &target));
            }
            MuxCommand::Data { slot, buffer } => {
                self.muxer
                    .write(&slot, buffer)
                    .map_err(|e| e.context(format!("failed to encode {}", slot)))?;
            }
            MuxCommand::EndOfSlot { slot } => {
                self.muxer.end_input(&slot)?;
                self.open_slots.remove(&slot);
            }
            MuxCommand::Seal => {
                self.sealed = true;
                self.muxer.seal()?;
            }
        }
        Ok(())
    }
}

fn mux_loop(
    muxer: Box<dyn Muxer>,
    rx: Receiver<MuxCommand>,
    bus: Bus,
    cancel: CancellationToken,
) {
    let mut state = MuxState {
        muxer,
        next_index: HashMap::new(),
        open_slots: HashSet::new(),
        sealed: false,
    };
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let command = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if let Err(e) = state.handle(command) {
            bus.post_error("mux", "encoding failed", &e);
            return;
        }
        if state.sealed && state.open_slots.is_empty() {
            match state.muxer.finish() {
                Ok(()) => {
                    log::debug!("mux: output finalized");
                    bus.post(BusMessage::Eos);
                }
                Err(e) => bus.post_error("mux", "could not finalize the output", &e),
            }
            return;
        }
    }
}

#[cfg(test)]
#[path = "graph_test.rs"]
mod graph_test;
