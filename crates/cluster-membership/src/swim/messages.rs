//! SWIM wire messages

use crate::member::Member;
use serde::{Deserialize, Serialize};

pub const MEMBERSHIP_SYNC: &str = "membership-sync";
pub const MEMBERSHIP_PROBE: &str = "membership-probe";
pub const MEMBERSHIP_PROBE_REQUEST: &str = "membership-probe-request";
pub const MEMBERSHIP_GOSSIP: &str = "membership-gossip";

/// Direct probe: the prober's own record and its view of the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeMessage {
    pub from: Member,
    pub target: Member,
}

/// Reply to an indirect probe request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeAck {
    pub acknowledged: bool,
}
