//! Cluster member identity and replicated member records

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Member metadata map
pub type Properties = HashMap<String, String>;

/// Unique, stable identifier for a member of the cluster
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member ID from any string-like value
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    /// Create a new random member ID
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Liveness state of a member.
///
/// States are totally ordered `Alive < Suspect < Dead`; within a single
/// incarnation a member may only move forward along that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

impl MemberState {
    fn rank(self) -> u8 {
        match self {
            Self::Alive => 0,
            Self::Suspect => 1,
            Self::Dead => 2,
        }
    }

    /// Active members are still part of the cluster
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Dead)
    }

    /// Reachable members answered their last failure check
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Alive)
    }
}

impl PartialOrd for MemberState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemberState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Suspect => write!(f, "suspect"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Immutable snapshot of a member record.
///
/// This is what crosses every boundary: it is placed on the wire, queued for
/// gossip and handed to event listeners. The mutable record lives only inside
/// the [`MemberDirectory`](crate::directory::MemberDirectory).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique identifier for this member
    pub id: MemberId,

    /// Network address where this member can be reached
    pub address: SocketAddr,

    /// Placement metadata
    pub zone: Option<String>,
    pub rack: Option<String>,
    pub host: Option<String>,

    /// User metadata, compared by full equality
    pub properties: Properties,

    /// Build/version tag of the running process
    pub version: Option<String>,

    /// Creation time in milliseconds since UNIX epoch
    pub timestamp: u64,

    /// Liveness state
    pub state: MemberState,

    /// Incarnation number (SWIM) or term (heartbeat)
    pub incarnation: u64,
}

impl Member {
    /// Create a bare member for an address with an unknown incarnation
    pub fn new(id: impl Into<MemberId>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address,
            zone: None,
            rack: None,
            host: None,
            properties: Properties::new(),
            version: None,
            timestamp: 0,
            state: MemberState::Alive,
            incarnation: 0,
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_reachable(&self) -> bool {
        self.state.is_reachable()
    }

    /// Copy of this member with a different state
    pub fn with_state(&self, state: MemberState) -> Self {
        let mut member = self.clone();
        member.state = state;
        member
    }

    /// Compact summary for logging
    pub fn summary(&self) -> String {
        format!(
            "Member[id={}, address={}, state={}, incarnation={}]",
            self.id, self.address, self.state, self.incarnation
        )
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Current wall-clock time in milliseconds since UNIX epoch
pub(crate) fn current_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Initial incarnation for a freshly started local member.
///
/// Seeded from the wall clock (microseconds) so that a restarted process
/// reusing an id outranks every claim made by its previous incarnation.
pub(crate) fn initial_incarnation() -> u64 {
    chrono::Utc::now().timestamp_micros().max(1) as u64
}
