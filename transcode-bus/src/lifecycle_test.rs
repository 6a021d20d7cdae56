use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc::UnboundedReceiver;

use super::{LifecycleController, LifecycleEvent, RunState};
use crate::{
    bus::BusMessage,
    config::BusConfig,
    error::ErrorKind,
    graph::StageGraph,
    media::MediaKind,
    profile::EncodingProfile,
    testing::{Step, TestFactory, subtitle_caps, video_caps},
};

fn controller(
    factory: Arc<TestFactory>,
) -> anyhow::Result<(LifecycleController, UnboundedReceiver<LifecycleEvent>)> {
    let mut graph = StageGraph::build(factory, "in.mkv", "out.webm", BusConfig::default())?;
    graph.set_profile(EncodingProfile::webm())?;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    Ok((LifecycleController::new(graph, tx)?, rx))
}

async fn drive(controller: &mut LifecycleController) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !controller.state().is_terminal() {
            if !controller.process_next().await {
                break;
            }
        }
    })
    .await?;
    Ok(())
}

fn drain(rx: &mut UnboundedReceiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn endless_video() -> Vec<Step> {
    vec![
        Step::Stream(0, Some(video_caps())),
        Step::NoMoreStreams,
        Step::Endless(0),
    ]
}

#[tokio::test]
async fn test_run_routes_video_and_audio() -> anyhow::Result<()> {
    let factory = Arc::new(TestFactory::video_and_audio());
    let (mut controller, mut rx) = controller(factory.clone())?;

    controller.start().await;
    assert_eq!(controller.state(), RunState::Playing);
    drive(&mut controller).await?;
    assert_eq!(controller.state(), RunState::Finished);

    let routes = controller.router().routes();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0].kind, MediaKind::Video);
    assert_eq!(routes[1].kind, MediaKind::Audio);
    assert!(!controller.graph().holds_resources());

    let events = drain(&mut rx);
    assert_eq!(events.first(), Some(&LifecycleEvent::Started));
    assert_eq!(events.last(), Some(&LifecycleEvent::EndOfStream));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    assert_eq!(
        factory.sink.contents(),
        "audio_0 audio/x-vorbis 2\nvideo_0 video/x-vp8 3\n"
    );
    Ok(())
}

#[tokio::test]
async fn test_stop_before_start_emits_nothing() -> anyhow::Result<()> {
    let (mut controller, mut rx) = controller(Arc::new(TestFactory::video_and_audio()))?;

    controller.stop().await;
    assert_eq!(controller.state(), RunState::Finished);
    assert!(drain(&mut rx).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stop_while_playing_aborts_once() -> anyhow::Result<()> {
    let (mut controller, mut rx) = controller(Arc::new(TestFactory::new(endless_video())))?;

    controller.start().await;
    controller.stop().await;
    controller.stop().await;

    assert_eq!(controller.state(), RunState::Failed);
    assert!(!controller.graph().holds_resources());
    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], LifecycleEvent::Started);
    assert!(matches!(
        &events[1],
        LifecycleEvent::Error { kind: ErrorKind::Aborted, .. }
    ));
    Ok(())
}

#[tokio::test]
async fn test_stop_after_end_of_stream_is_silent() -> anyhow::Result<()> {
    let (mut controller, mut rx) = controller(Arc::new(TestFactory::video_and_audio()))?;

    controller.start().await;
    drive(&mut controller).await?;
    let events = drain(&mut rx);
    assert_eq!(events.last(), Some(&LifecycleEvent::EndOfStream));

    controller.stop().await;
    controller.handle_message(BusMessage::Eos).await;
    assert_eq!(controller.state(), RunState::Finished);
    assert!(drain(&mut rx).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_progress_is_clamped_and_monotonic() -> anyhow::Result<()> {
    let (mut controller, mut rx) = controller(Arc::new(TestFactory::new(endless_video())))?;

    controller.start().await;
    controller
        .handle_message(BusMessage::Progress { percent: 50.0 })
        .await;
    controller
        .handle_message(BusMessage::Progress { percent: 20.0 })
        .await;
    controller
        .handle_message(BusMessage::Progress { percent: 150.0 })
        .await;
    controller
        .handle_message(BusMessage::Progress { percent: f64::NAN })
        .await;
    controller.stop().await;

    let progress: Vec<f64> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            LifecycleEvent::Progress(fraction) => Some(fraction),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0.5, 1.0]);
    Ok(())
}

#[tokio::test]
async fn test_no_routable_streams_fails_the_run() -> anyhow::Result<()> {
    let factory = TestFactory::new(vec![
        Step::Stream(0, Some(subtitle_caps())),
        Step::NoMoreStreams,
        Step::Data(0, b"hello"),
    ]);
    let (mut controller, mut rx) = controller(Arc::new(factory))?;

    controller.start().await;
    drive(&mut controller).await?;
    assert_eq!(controller.state(), RunState::Failed);

    match drain(&mut rx).last() {
        Some(LifecycleEvent::Error { kind, debug, .. }) => {
            assert_eq!(*kind, ErrorKind::NoRoutableStreams);
            assert!(debug.as_deref().unwrap().contains("ignoring unknown stream"));
        }
        other => panic!("unexpected last event: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_empty_input_fails_the_run() -> anyhow::Result<()> {
    let (mut controller, mut rx) = controller(Arc::new(TestFactory::new(Vec::new())))?;

    controller.start().await;
    drive(&mut controller).await?;

    let events = drain(&mut rx);
    assert!(matches!(
        events.last(),
        Some(LifecycleEvent::Error { kind: ErrorKind::NoRoutableStreams, debug: None, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_start_failure() -> anyhow::Result<()> {
    let mut factory = TestFactory::video_and_audio();
    factory.fail_source_open = true;
    let (mut controller, mut rx) = controller(Arc::new(factory))?;

    controller.start().await;
    assert_eq!(controller.state(), RunState::Failed);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], LifecycleEvent::Started);
    match &events[1] {
        LifecycleEvent::Error {
            kind,
            message,
            debug,
        } => {
            assert_eq!(*kind, ErrorKind::StartFailure);
            assert_eq!(message, "Failed to start");
            assert!(debug.as_deref().unwrap().contains("refused to open"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_demux_error_fails_the_run() -> anyhow::Result<()> {
    let factory = TestFactory::new(vec![
        Step::Stream(0, Some(video_caps())),
        Step::NoMoreStreams,
        Step::Data(0, b"v0"),
        Step::Fail("decoder exploded"),
    ]);
    let (mut controller, mut rx) = controller(Arc::new(factory))?;

    controller.start().await;
    drive(&mut controller).await?;
    assert_eq!(controller.state(), RunState::Failed);

    let events = drain(&mut rx);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    match events.last() {
        Some(LifecycleEvent::Error { kind, debug, .. }) => {
            assert_eq!(*kind, ErrorKind::Runtime);
            assert!(debug.as_deref().unwrap().contains("decoder exploded"));
        }
        other => panic!("unexpected last event: {:?}", other),
    }
    Ok(())
}
