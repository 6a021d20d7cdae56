use std::sync::Arc;

use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    config::BusConfig,
    error::TranscodeError,
    graph::StageGraph,
    lifecycle::{Control, LifecycleController, LifecycleEvent, RunState},
    profile::EncodingProfile,
    stage::{StageFactory, default_factory},
};

/// Callbacks for one run: `started` first, any number of `progress`, then
/// exactly one of `eos` or `error`.
pub trait TranscodeListener {
    fn started(&mut self) {}

    fn progress(&mut self, _fraction: f64) {}

    fn eos(&mut self) {}

    fn error(&mut self, _kind: &str, _message: &str, _debug: Option<&str>) {}
}

/// Transcodes one source file into one destination file.
pub struct TranscodeJob {
    source: String,
    destination: String,
    profile: EncodingProfile,
    config: BusConfig,
    factory: Arc<dyn StageFactory>,
}

impl TranscodeJob {
    pub fn new(source: &str, destination: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            profile: EncodingProfile::default(),
            config: BusConfig::default(),
            factory: default_factory(),
        }
    }

    pub fn with_profile(mut self, profile: EncodingProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn StageFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Builds the graph and starts the run in the background.
    ///
    /// Configuration problems are returned here and no event is ever sent
    /// for them. Must be called within a tokio runtime.
    pub fn start(self) -> Result<JobHandle, TranscodeError> {
        let mut graph =
            StageGraph::build(self.factory, &self.source, &self.destination, self.config)?;
        graph.set_profile(self.profile)?;

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let controller = LifecycleController::new(graph, events_tx)?;
        let (control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel();
        log::info!("transcoding {} -> {}", self.source, self.destination);
        let task = tokio::spawn(controller.run(control_rx));

        Ok(JobHandle {
            events: events_rx,
            stopper: JobStopper {
                control: control_tx,
            },
            task,
        })
    }
}

/// Requests the end of a running job. Cheap to clone and safe to use
/// after the job ended.
#[derive(Clone)]
pub struct JobStopper {
    control: UnboundedSender<Control>,
}

impl JobStopper {
    /// Stops the job and waits for its teardown.
    pub async fn stop(&self) {
        let (done, wait) = oneshot::channel();
        if self.control.send(Control::Stop { done }).is_err() {
            return;
        }
        let _ = wait.await;
    }
}

pub struct JobHandle {
    events: UnboundedReceiver<LifecycleEvent>,
    stopper: JobStopper,
    task: JoinHandle<RunState>,
}

impl JobHandle {
    /// Next event of the run, `None` after the terminal one.
    pub async fn next_event(&mut self) -> Option<LifecycleEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> (UnboundedReceiverStream<LifecycleEvent>, JobStopper) {
        (UnboundedReceiverStream::new(self.events), self.stopper)
    }

    pub fn stopper(&self) -> JobStopper {
        self.stopper.clone()
    }

    pub async fn stop(&self) {
        self.stopper.stop().await
    }

    /// Feeds every event to `listener` until the run ends.
    pub async fn run_with<L: TranscodeListener>(&mut self, listener: &mut L) -> RunState {
        while let Some(event) = self.next_event().await {
            match event {
                LifecycleEvent::Started => listener.started(),
                LifecycleEvent::Progress(fraction) => listener.progress(fraction),
                LifecycleEvent::EndOfStream => {
                    listener.eos();
                    return RunState::Finished;
                }
                LifecycleEvent::Error {
                    kind,
                    message,
                    debug,
                } => {
                    listener.error(kind.as_str(), &message, debug.as_deref());
                    return RunState::Failed;
                }
            }
        }
        RunState::Failed
    }

    /// Waits for the controller to finish and returns its final state.
    pub async fn wait(self) -> RunState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                log::error!("transcode task failed: {:#?}", e);
                RunState::Failed
            }
        }
    }
}

#[cfg(test)]
#[path = "job_test.rs"]
mod job_test;
