use tokio_util::sync::CancellationToken;

use super::{PadPoll, PushResult, pad_channel};
use crate::media::{Buffer, StreamDescriptor, StreamId};

fn descriptor() -> StreamDescriptor {
    StreamDescriptor::new(StreamId(0), None)
}

#[test]
fn test_pushed_buffers_are_polled_in_order() {
    let cancel = CancellationToken::new();
    let (sender, pad) = pad_channel(descriptor(), 4);
    assert_eq!(sender.push(Buffer::from_bytes("a").with_pts(Some(1)), &cancel), PushResult::Ok);
    assert_eq!(sender.push(Buffer::from_bytes("b").with_pts(Some(2)), &cancel), PushResult::Ok);

    match pad.poll() {
        PadPoll::Data(buffer) => assert_eq!(buffer.pts(), Some(1)),
        _ => panic!("expected data"),
    }
    match pad.poll() {
        PadPoll::Data(buffer) => assert_eq!(buffer.pts(), Some(2)),
        _ => panic!("expected data"),
    }
    assert!(matches!(pad.poll(), PadPoll::Empty));

    drop(sender);
    assert!(matches!(pad.poll(), PadPoll::Eos));
}

#[test]
fn test_dropped_pad_is_not_linked() {
    let cancel = CancellationToken::new();
    let (sender, pad) = pad_channel(descriptor(), 1);
    drop(pad);
    assert_eq!(sender.push(Buffer::from_bytes("a"), &cancel), PushResult::NotLinked);
}

#[test]
fn test_full_pad_gives_up_when_flushing() {
    let cancel = CancellationToken::new();
    let (sender, pad) = pad_channel(descriptor(), 1);
    assert_eq!(sender.push(Buffer::from_bytes("a"), &cancel), PushResult::Ok);

    cancel.cancel();
    assert_eq!(sender.push(Buffer::from_bytes("b"), &cancel), PushResult::Flushing);
    assert_eq!(pad.descriptor().id(), StreamId(0));
}
