//! Node discovery integration
//!
//! Discovery supplies candidate peers and join/leave notifications. The
//! protocols only use it to bootstrap; membership itself is decided by
//! probing and dissemination.

use crate::member::MemberId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::debug;

/// A discovered peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: MemberId,
    pub address: SocketAddr,
}

impl Node {
    pub fn new(id: impl Into<MemberId>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeDiscoveryEventType {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDiscoveryEvent {
    pub event_type: NodeDiscoveryEventType,
    pub node: Node,
}

/// Source of candidate peers
#[cfg_attr(test, mockall::automock)]
pub trait NodeDiscoveryService: Send + Sync {
    /// Current candidate list
    fn nodes(&self) -> Vec<Node>;

    /// Stream of join/leave notifications. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<NodeDiscoveryEvent>;
}

/// Discovery over a fixed, manually maintained node list
pub struct BootstrapDiscoveryService {
    nodes: DashMap<MemberId, Node>,
    events: broadcast::Sender<NodeDiscoveryEvent>,
}

impl BootstrapDiscoveryService {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        let (events, _) = broadcast::channel(1000);
        Self {
            nodes: nodes.into_iter().map(|node| (node.id.clone(), node)).collect(),
            events,
        }
    }

    /// Add a node and announce it
    pub fn add_node(&self, node: Node) {
        if self.nodes.insert(node.id.clone(), node.clone()).is_none() {
            debug!("Discovered node {} at {}", node.id, node.address);
            let _ = self.events.send(NodeDiscoveryEvent {
                event_type: NodeDiscoveryEventType::Join,
                node,
            });
        }
    }

    /// Remove a node and announce its departure
    pub fn remove_node(&self, id: &MemberId) -> Option<Node> {
        let (_, node) = self.nodes.remove(id)?;
        debug!("Node {} at {} left discovery", node.id, node.address);
        let _ = self.events.send(NodeDiscoveryEvent {
            event_type: NodeDiscoveryEventType::Leave,
            node: node.clone(),
        });
        Some(node)
    }
}

impl NodeDiscoveryService for BootstrapDiscoveryService {
    fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeDiscoveryEvent> {
        self.events.subscribe()
    }
}
