//! Cluster Membership
//!
//! This crate maintains an eventually consistent view of which members belong
//! to a group and whether they are reachable. Two interchangeable failure
//! detection strategies are provided: SWIM (probe, indirect probe, suspicion,
//! gossip) and heartbeat with a phi accrual detector.

pub mod codec;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod member;
pub mod scheduler;
pub mod swim;
pub mod testing;
pub mod transport;

#[cfg(test)]
pub mod proptest;

pub use config::{HeartbeatConfig, ProtocolConfig, SwimConfig};
pub use directory::{MemberDirectory, MemberRecord};
pub use discovery::{
    BootstrapDiscoveryService, Node, NodeDiscoveryEvent, NodeDiscoveryEventType,
    NodeDiscoveryService,
};
pub use error::{MembershipError, Result};
pub use event::{
    EventNotifier, ListenerId, MembershipEvent, MembershipEventListener, MembershipEventType,
};
pub use heartbeat::phi::PhiAccrualFailureDetector;
pub use heartbeat::HeartbeatMembershipProtocol;
pub use member::{Member, MemberId, MemberState, Properties};
pub use swim::SwimMembershipProtocol;
pub use transport::{
    BootstrapService, MessageHandler, MessagingService, UnicastListener, UnicastService,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Failure detection strategy behind a protocol instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Swim,
    Heartbeat,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolType::Swim => write!(f, "swim"),
            ProtocolType::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// Group membership protocol
///
/// A protocol instance is joined at most once at a time. `join` and `leave`
/// are idempotent, and queries never block on the network.
#[async_trait]
pub trait GroupMembershipProtocol: Send + Sync {
    fn protocol_type(&self) -> ProtocolType;

    /// Activate `member` as the local member and start the protocol
    async fn join(
        &self,
        bootstrap: Arc<dyn BootstrapService>,
        discovery: Arc<dyn NodeDiscoveryService>,
        member: Member,
    ) -> Result<()>;

    /// Stop all protocol activity and clear the membership view
    async fn leave(&self, member: &Member) -> Result<()>;

    /// All known members including the local one, ordered by id
    fn members(&self) -> Vec<Member>;

    fn member(&self, id: &MemberId) -> Option<Member>;

    fn local_member(&self) -> Option<Member>;

    /// Replace the local member's properties. The change is announced as
    /// metadata change with a new incarnation on the next protocol round.
    async fn update_local_properties(&self, properties: Properties) -> Result<()>;

    fn add_listener(&self, listener: Arc<dyn MembershipEventListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Build an unstarted protocol instance for `config`
pub fn create_protocol(config: &ProtocolConfig) -> Result<Arc<dyn GroupMembershipProtocol>> {
    match config {
        ProtocolConfig::Swim(swim) => Ok(Arc::new(SwimMembershipProtocol::new(swim.clone())?)),
        ProtocolConfig::Heartbeat(heartbeat) => Ok(Arc::new(HeartbeatMembershipProtocol::new(
            heartbeat.clone(),
        )?)),
    }
}
