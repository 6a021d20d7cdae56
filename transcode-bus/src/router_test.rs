use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::StreamRouter;
use crate::{
    config::BusConfig,
    error::RouteDrop,
    graph::{GraphState, StageGraph},
    media::{Buffer, MediaKind, StreamDescriptor, StreamId},
    pad::{PushResult, pad_channel},
    profile::{ContainerFormat, EncoderParameters, EncodingProfile},
    testing::{TestFactory, audio_caps, subtitle_caps, video_caps},
};

fn playing_graph(factory: TestFactory, profile: EncodingProfile) -> anyhow::Result<StageGraph> {
    let mut graph = StageGraph::build(Arc::new(factory), "in.mkv", "out.webm", BusConfig::default())?;
    graph.set_profile(profile)?;
    graph.set_state(GraphState::Playing)?;
    Ok(graph)
}

fn audio_only() -> EncodingProfile {
    EncodingProfile::new(
        "ogg",
        ContainerFormat {
            name: "ogg".to_string(),
            caps: "application/ogg".to_string(),
            muxer: "ogg".to_string(),
        },
    )
    .with_stream(
        MediaKind::Audio,
        EncoderParameters::new("audio/x-vorbis", "libvorbis"),
    )
}

#[tokio::test]
async fn test_routes_video_and_audio() -> anyhow::Result<()> {
    let mut graph = playing_graph(TestFactory::new(Vec::new()), EncodingProfile::webm())?;
    let mut router = StreamRouter::new();

    let (_video_tx, pad) = pad_channel(StreamDescriptor::new(StreamId(0), Some(video_caps())), 4);
    let route = router.on_stream_discovered(&mut graph, pad).await.unwrap().clone();
    assert_eq!(route.kind, MediaKind::Video);
    assert_eq!(route.slot.to_string(), "video_0");
    assert_eq!(route.queue, "queue0");

    let (_audio_tx, pad) = pad_channel(StreamDescriptor::new(StreamId(1), Some(audio_caps())), 4);
    let route = router.on_stream_discovered(&mut graph, pad).await.unwrap().clone();
    assert_eq!(route.kind, MediaKind::Audio);
    assert_eq!(route.slot.to_string(), "audio_0");
    assert_eq!(route.queue, "queue1");
    assert_eq!(route.stream.id(), StreamId(1));

    assert_eq!(router.route_count(), 2);
    assert!(router.dropped().is_empty());
    graph.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_drops_streams_without_caps_or_of_unknown_kind() -> anyhow::Result<()> {
    let mut graph = playing_graph(TestFactory::new(Vec::new()), EncodingProfile::webm())?;
    let mut router = StreamRouter::new();
    let cancel = CancellationToken::new();

    let (no_caps_tx, pad) = pad_channel(StreamDescriptor::new(StreamId(5), None), 4);
    let drop = router.on_stream_discovered(&mut graph, pad).await.unwrap_err();
    assert_eq!(drop, RouteDrop::NoCaps(StreamId(5)));

    let (_subtitle_tx, pad) =
        pad_channel(StreamDescriptor::new(StreamId(6), Some(subtitle_caps())), 4);
    let drop = router.on_stream_discovered(&mut graph, pad).await.unwrap_err();
    assert_eq!(
        drop,
        RouteDrop::UnknownKind {
            stream: StreamId(6),
            caps: subtitle_caps().to_string(),
        }
    );

    // A dropped pad is unlinked: the demuxer discards its data.
    let buffer = Buffer::from_bytes(Bytes::from_static(b"meta"));
    assert_eq!(no_caps_tx.push(buffer, &cancel), PushResult::NotLinked);

    assert_eq!(router.route_count(), 0);
    assert_eq!(router.dropped().len(), 2);
    graph.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_kind_missing_from_profile_is_dropped() -> anyhow::Result<()> {
    let mut graph = playing_graph(TestFactory::new(Vec::new()), audio_only())?;
    let mut router = StreamRouter::new();

    let (_video_tx, pad) = pad_channel(StreamDescriptor::new(StreamId(0), Some(video_caps())), 4);
    let drop = router.on_stream_discovered(&mut graph, pad).await.unwrap_err();
    assert_eq!(
        drop,
        RouteDrop::NoProfileEntry {
            stream: StreamId(0),
            kind: MediaKind::Video,
        }
    );

    let (_audio_tx, pad) = pad_channel(StreamDescriptor::new(StreamId(1), Some(audio_caps())), 4);
    assert!(router.on_stream_discovered(&mut graph, pad).await.is_ok());
    assert_eq!(router.route_count(), 1);
    assert_eq!(router.routes()[0].slot.to_string(), "audio_0");
    graph.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_slot_rejected_by_muxer_is_dropped() -> anyhow::Result<()> {
    let mut factory = TestFactory::new(Vec::new());
    factory.reject = vec![MediaKind::Audio];
    let mut graph = playing_graph(factory, EncodingProfile::webm())?;
    let mut router = StreamRouter::new();

    let (_audio_tx, pad) = pad_channel(StreamDescriptor::new(StreamId(1), Some(audio_caps())), 4);
    match router.on_stream_discovered(&mut graph, pad).await {
        Err(RouteDrop::SlotRejected { stream, kind, reason }) => {
            assert_eq!(stream, StreamId(1));
            assert_eq!(kind, MediaKind::Audio);
            assert!(reason.contains("not accepted"));
        }
        other => panic!("unexpected routing result: {:?}", other),
    }

    let (_video_tx, pad) = pad_channel(StreamDescriptor::new(StreamId(0), Some(video_caps())), 4);
    let route = router.on_stream_discovered(&mut graph, pad).await.unwrap();
    assert_eq!(route.slot.to_string(), "video_0");
    graph.shutdown().await;
    Ok(())
}
