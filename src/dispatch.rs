use crate::engine::Event;
use crate::registry::{self, NodeHandle};
use tokio::sync::mpsc;
use tracing::debug;

/// Delivers engine events to the application's handler off the processing
/// loop.
///
/// Events travel on two lanes, each drained by its own task: replication
/// (`on_append`, `on_commit`) and leadership (`gained_leadership`,
/// `lost_leadership`, `on_leader_change`). Each lane preserves the order the
/// engine produced; the lanes run independently of each other.
pub(crate) struct Dispatcher {
    replication: mpsc::UnboundedSender<Event>,
    leadership: mpsc::UnboundedSender<Event>,
}

impl Dispatcher {
    pub fn new(handle: NodeHandle) -> Self {
        let (replication, replication_rx) = mpsc::unbounded_channel();
        let (leadership, leadership_rx) = mpsc::unbounded_channel();

        tokio::spawn(lane(handle, "replication", replication_rx));
        tokio::spawn(lane(handle, "leadership", leadership_rx));

        Self {
            replication,
            leadership,
        }
    }

    pub fn dispatch(&self, event: Event) {
        let lane = match event {
            Event::Append { .. } | Event::Commit { .. } => &self.replication,
            _ => &self.leadership,
        };
        let _ = lane.send(event);
    }
}

async fn lane(handle: NodeHandle, name: &'static str, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        let Some(node) = registry::lookup(handle) else {
            debug!("node handle {} is gone, dropping {} event", handle, name);
            continue;
        };
        let handler = node.handler();

        match event {
            Event::Append { round, payload } => handler.on_append(&node, round, payload).await,
            Event::Commit { round } => handler.on_commit(&node, round).await,
            Event::GainedLeadership => handler.gained_leadership(&node).await,
            Event::LostLeadership => handler.lost_leadership(&node).await,
            Event::LeaderChange(leader) => handler.on_leader_change(&node, leader).await,
        }
    }
}
