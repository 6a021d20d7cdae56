use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender},
    oneshot,
};

use crate::{
    bus::{BusMessage, BusReceiver},
    error::{ErrorKind, TranscodeError},
    graph::{GraphState, StageGraph},
    router::StreamRouter,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Started,
    Playing,
    Stopping,
    Finished,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished | RunState::Failed)
    }
}

/// What the caller of a job gets to see.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    Started,
    /// Fraction of the source consumed, in `[0, 1]`, never decreasing.
    Progress(f64),
    EndOfStream,
    Error {
        kind: ErrorKind,
        message: String,
        debug: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleEvent::EndOfStream | LifecycleEvent::Error { .. })
    }
}

pub(crate) enum Control {
    Stop { done: oneshot::Sender<()> },
}

/// Owns a graph for one run and turns its bus into [`LifecycleEvent`]s.
pub struct LifecycleController {
    graph: StageGraph,
    bus: BusReceiver,
    router: StreamRouter,
    state: RunState,
    events: UnboundedSender<LifecycleEvent>,
    last_progress: f64,
    terminated: bool,
}

impl LifecycleController {
    pub fn new(
        mut graph: StageGraph,
        events: UnboundedSender<LifecycleEvent>,
    ) -> Result<Self, TranscodeError> {
        let bus = graph
            .take_bus()
            .ok_or(TranscodeError::config("the graph bus is already taken"))?;
        Ok(Self {
            graph,
            bus,
            router: StreamRouter::new(),
            state: RunState::Idle,
            events,
            last_progress: 0.0,
            terminated: false,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn router(&self) -> &StreamRouter {
        &self.router
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Nothing is sent once a terminal event went out.
    fn emit(&mut self, event: LifecycleEvent) {
        if self.terminated {
            log::debug!("dropping {:?} after the end of the run", event);
            return;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        let _ = self.events.send(event);
    }

    async fn teardown(&mut self) {
        self.graph.shutdown().await;
        let pending = self.bus.close_and_drain();
        if pending > 0 {
            log::debug!("discarded {} pending bus messages", pending);
        }
    }

    async fn finish(&mut self) {
        self.teardown().await;
        self.state = RunState::Finished;
        log::info!("end of stream");
        self.emit(LifecycleEvent::EndOfStream);
    }

    async fn fail(&mut self, kind: ErrorKind, message: &str, debug: Option<String>) {
        self.teardown().await;
        self.state = RunState::Failed;
        log::error!("{}: {}", kind, message);
        self.emit(LifecycleEvent::Error {
            kind,
            message: message.to_string(),
            debug,
        });
    }

    /// Announces the run and asks the graph to start flowing. `Started` goes
    /// out before the outcome of the request is known.
    pub async fn start(&mut self) {
        if self.state != RunState::Idle {
            log::warn!("start ignored in state {:?}", self.state);
            return;
        }
        self.state = RunState::Started;
        self.emit(LifecycleEvent::Started);
        match self.graph.set_state(GraphState::Playing) {
            Ok(()) => self.state = RunState::Playing,
            Err(e) => {
                let debug = e.debug().map(str::to_string).or_else(|| Some(e.to_string()));
                self.fail(ErrorKind::StartFailure, "Failed to start", debug)
                    .await;
            }
        }
    }

    /// Tears the run down. A run that was still going ends with an
    /// `aborted` error; stopping an ended run only releases what is left.
    pub async fn stop(&mut self) {
        if self.state.is_terminal() {
            if self.graph.holds_resources() {
                self.teardown().await;
            }
            return;
        }
        let was_running = matches!(self.state, RunState::Started | RunState::Playing);
        self.state = RunState::Stopping;
        self.teardown().await;
        if was_running {
            self.state = RunState::Failed;
            log::warn!("aborted");
            self.emit(LifecycleEvent::Error {
                kind: ErrorKind::Aborted,
                message: "Aborted".to_string(),
                debug: None,
            });
        } else {
            self.state = RunState::Finished;
        }
    }

    pub async fn handle_message(&mut self, message: BusMessage) {
        if self.state != RunState::Playing {
            log::debug!("ignoring {:?} in state {:?}", message, self.state);
            return;
        }
        match message {
            BusMessage::StateChanged { old, new } => {
                log::debug!("graph went from {} to {}", old, new);
            }
            BusMessage::StreamDiscovered(pad) => {
                // Drops are logged by the router and never fail the run.
                let _ = self.router.on_stream_discovered(&mut self.graph, pad).await;
            }
            BusMessage::NoMoreStreams => {
                if self.router.route_count() == 0 {
                    let dropped = self
                        .router
                        .dropped()
                        .iter()
                        .map(|reason| reason.to_string())
                        .collect::<Vec<_>>();
                    let debug = (!dropped.is_empty()).then(|| dropped.join("; "));
                    self.fail(
                        ErrorKind::NoRoutableStreams,
                        &TranscodeError::NoRoutableStreams.to_string(),
                        debug,
                    )
                    .await;
                } else if let Err(e) = self.graph.seal_inputs().await {
                    // The mux stage only goes away after posting its own
                    // error or end of stream.
                    log::debug!("could not seal encoder inputs: {:#}", e);
                }
            }
            BusMessage::Progress { percent } => self.progress(percent),
            BusMessage::Eos => self.finish().await,
            BusMessage::Error {
                source,
                message,
                debug,
            } => {
                log::debug!("error from {}", source);
                self.fail(ErrorKind::Runtime, &message, debug).await;
            }
        }
    }

    fn progress(&mut self, percent: f64) {
        if percent.is_nan() {
            return;
        }
        let fraction = (percent / 100.0).clamp(0.0, 1.0);
        if fraction < self.last_progress {
            return;
        }
        self.last_progress = fraction;
        log::debug!("progress {:.1}%", fraction * 100.0);
        self.emit(LifecycleEvent::Progress(fraction));
    }

    /// Handles the next bus message. Returns false once the bus is closed.
    pub async fn process_next(&mut self) -> bool {
        match self.bus.recv().await {
            Some(message) => {
                self.handle_message(message).await;
                true
            }
            None => false,
        }
    }

    /// Starts the run and serves bus messages and stop requests until the
    /// run ends.
    pub(crate) async fn run(mut self, mut control: UnboundedReceiver<Control>) -> RunState {
        self.start().await;
        let mut control_open = true;
        while !self.state.is_terminal() {
            tokio::select! {
                message = self.bus.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        self.fail(ErrorKind::Runtime, "graph bus closed unexpectedly", None)
                            .await;
                    }
                },
                request = control.recv(), if control_open => match request {
                    Some(Control::Stop { done }) => {
                        self.stop().await;
                        let _ = done.send(());
                    }
                    None => control_open = false,
                },
            }
        }
        // Late stop requests have nothing left to do.
        control.close();
        while let Ok(Control::Stop { done }) = control.try_recv() {
            let _ = done.send(());
        }
        self.state
    }
}

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod lifecycle_test;
