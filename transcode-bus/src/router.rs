use crate::{
    error::RouteDrop,
    graph::{EncoderInputSlot, StageGraph},
    media::{MediaKind, StreamDescriptor},
    pad::StreamPad,
    queue::Queue,
    stage::SlotName,
};

/// A discovered stream linked through a queue to an encoder input.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub stream: StreamDescriptor,
    pub kind: MediaKind,
    pub slot: SlotName,
    pub queue: String,
}

/// Links each discovered stream to an encoder input of its kind, or drops it.
///
/// Decisions are final: a stream is never re-routed and a slot is never
/// released before the graph is torn down.
#[derive(Default)]
pub struct StreamRouter {
    routes: Vec<Route>,
    dropped: Vec<RouteDrop>,
    queue_count: u32,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on_stream_discovered(
        &mut self,
        graph: &mut StageGraph,
        pad: StreamPad,
    ) -> Result<&Route, RouteDrop> {
        let descriptor = pad.descriptor().clone();
        let stream = descriptor.id();
        let Some(caps) = descriptor.caps() else {
            return Err(self.drop_stream(RouteDrop::NoCaps(stream)));
        };

        let kind = MediaKind::classify(caps.media_type());
        if kind == MediaKind::Other {
            return Err(self.drop_stream(RouteDrop::UnknownKind {
                stream,
                caps: caps.to_string(),
            }));
        }

        let Some(target) = graph.profile().and_then(|profile| profile.for_kind(kind)) else {
            return Err(self.drop_stream(RouteDrop::NoProfileEntry { stream, kind }));
        };

        let slot = match graph.request_slot(&descriptor, target).await {
            Ok(slot) => slot,
            Err(e) => {
                return Err(self.drop_stream(RouteDrop::SlotRejected {
                    stream,
                    kind,
                    reason: format!("{:#}", e),
                }));
            }
        };
        let slot_name = slot.name().clone();

        let queue_name = format!("queue{}", self.queue_count);
        self.queue_count += 1;
        if let Err(e) = link_queue(graph, Queue::new(&queue_name), pad, slot) {
            if let Err(release) = graph.release_slot(slot_name.clone()).await {
                log::debug!("could not release {}: {:#}", slot_name, release);
            }
            return Err(self.drop_stream(RouteDrop::SlotRejected {
                stream,
                kind,
                reason: format!("{:#}", e),
            }));
        }

        log::info!("linked {} ({}) to {} via {}", stream, kind, slot_name, queue_name);
        let index = self.routes.len();
        self.routes.push(Route {
            stream: descriptor,
            kind,
            slot: slot_name,
            queue: queue_name,
        });
        Ok(&self.routes[index])
    }

    fn drop_stream(&mut self, reason: RouteDrop) -> RouteDrop {
        log::warn!("{}", reason);
        self.dropped.push(reason.clone());
        reason
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn dropped(&self) -> &[RouteDrop] {
        &self.dropped
    }
}

/// Inserts `queue` between the pad and the slot and brings it to the
/// graph's running state.
fn link_queue(
    graph: &mut StageGraph,
    mut queue: Queue,
    pad: StreamPad,
    slot: EncoderInputSlot,
) -> anyhow::Result<()> {
    queue.link_upstream(pad)?;
    queue.link_downstream(slot)?;
    graph.add_queue(queue)
}

#[cfg(test)]
#[path = "router_test.rs"]
mod router_test;
