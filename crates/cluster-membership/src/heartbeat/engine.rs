//! Sequencing task for the heartbeat protocol

use super::phi::PhiAccrualFailureDetector;
use super::MEMBERSHIP_HEARTBEAT;
use crate::codec;
use crate::config::HeartbeatConfig;
use crate::directory::MemberDirectory;
use crate::discovery::{NodeDiscoveryEvent, NodeDiscoveryEventType, NodeDiscoveryService};
use crate::error::Result;
use crate::event::{EventNotifier, MembershipEvent, MembershipEventType};
use crate::member::{Member, MemberId, MemberState, Properties};
use crate::transport::MessagingService;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub(crate) enum HeartbeatCommand {
    Tick,
    HeartbeatCompleted {
        target: Member,
        result: Result<Vec<Member>>,
    },
    Heartbeat {
        from: Member,
        reply: oneshot::Sender<Vec<Member>>,
    },
    Discovery(NodeDiscoveryEvent),
    UpdateLocalProperties {
        properties: Properties,
        ack: oneshot::Sender<()>,
    },
    Leave {
        ack: oneshot::Sender<()>,
    },
}

/// Failure detection state for one peer
struct PeerHealth {
    detector: PhiAccrualFailureDetector,
    last_contact: Instant,
}

pub(crate) struct HeartbeatCore {
    local_id: MemberId,
    config: HeartbeatConfig,
    directory: Arc<MemberDirectory>,
    notifier: Arc<EventNotifier>,
    messaging: Arc<dyn MessagingService>,
    discovery: Arc<dyn NodeDiscoveryService>,
    commands: mpsc::UnboundedSender<HeartbeatCommand>,
    health: HashMap<MemberId, PeerHealth>,
    local_properties: Properties,
    rng: StdRng,
    in_flight: JoinSet<()>,
}

impl HeartbeatCore {
    pub(crate) fn new(
        local_id: MemberId,
        config: HeartbeatConfig,
        directory: Arc<MemberDirectory>,
        notifier: Arc<EventNotifier>,
        messaging: Arc<dyn MessagingService>,
        discovery: Arc<dyn NodeDiscoveryService>,
        commands: mpsc::UnboundedSender<HeartbeatCommand>,
    ) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let local_properties = directory
            .get(&local_id)
            .map(|local| local.properties)
            .unwrap_or_default();

        Self {
            local_id,
            config,
            directory,
            notifier,
            messaging,
            discovery,
            commands,
            health: HashMap::new(),
            local_properties,
            rng,
            in_flight: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HeartbeatCommand>) {
        loop {
            let command = tokio::select! {
                command = commands.recv() => command,
                Some(_) = self.in_flight.join_next(), if !self.in_flight.is_empty() => continue,
            };

            match command {
                Some(command) => {
                    if !self.handle(command) {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    pub(crate) fn handle(&mut self, command: HeartbeatCommand) -> bool {
        match command {
            HeartbeatCommand::Tick => self.send_heartbeats(),
            HeartbeatCommand::HeartbeatCompleted { target, result } => {
                self.heartbeat_completed(target, result)
            }
            HeartbeatCommand::Heartbeat { from, reply } => {
                let _ = reply.send(self.handle_heartbeat(from));
            }
            HeartbeatCommand::Discovery(event) => self.discovery_event(event),
            HeartbeatCommand::UpdateLocalProperties { properties, ack } => {
                self.directory
                    .update(&self.local_id, |record| record.set_properties(properties));
                let _ = ack.send(());
            }
            HeartbeatCommand::Leave { ack } => {
                self.in_flight.abort_all();
                self.health.clear();
                self.directory
                    .update(&self.local_id, |record| record.set_state(MemberState::Dead));
                self.directory.clear();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn post(&self, event_type: MembershipEventType, member: Member) {
        self.notifier.post(MembershipEvent::new(event_type, member));
    }

    fn new_health(config: &HeartbeatConfig) -> PeerHealth {
        PeerHealth {
            detector: PhiAccrualFailureDetector::new(
                config.phi_window_size,
                config.phi_min_samples,
                config.phi_min_std_deviation,
            ),
            last_contact: Instant::now(),
        }
    }

    /// Start detection for a member entering the directory
    fn track(&mut self, id: &MemberId) {
        self.health
            .insert(id.clone(), Self::new_health(&self.config));
    }

    fn health(&mut self, id: &MemberId) -> &mut PeerHealth {
        let config = &self.config;
        self.health
            .entry(id.clone())
            .or_insert_with(|| Self::new_health(config))
    }

    #[cfg(test)]
    fn detector(&self, id: &MemberId) -> Option<&PhiAccrualFailureDetector> {
        self.health.get(id).map(|health| &health.detector)
    }

    fn check_metadata(&mut self) {
        let local = match self.directory.get(&self.local_id) {
            Some(local) => local,
            None => return,
        };
        if local.properties == self.local_properties {
            return;
        }

        self.local_properties = local.properties.clone();
        let changed = self.directory.update(&self.local_id, |record| {
            record.set_incarnation(local.incarnation.saturating_add(1));
            record.copy()
        });
        if let Some(changed) = changed {
            debug!("{} - Local metadata changed {}", self.local_id, changed);
            self.post(MembershipEventType::MetadataChanged, changed);
        }
    }

    fn send_heartbeats(&mut self) {
        self.check_metadata();

        let local = match self.directory.get(&self.local_id) {
            Some(local) => local,
            None => return,
        };

        let mut targets: Vec<Member> = self
            .directory
            .get_all()
            .into_iter()
            .filter(|member| member.id != self.local_id)
            .collect();
        for node in self.discovery.nodes() {
            if node.id != self.local_id && !self.directory.contains(&node.id) {
                targets.push(Member::new(node.id, node.address));
            }
        }
        targets.shuffle(&mut self.rng);

        let payload = match codec::encode(&local) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} - Failed to encode heartbeat: {}", self.local_id, e);
                return;
            }
        };
        for target in targets {
            self.send_heartbeat(target, payload.clone());
        }
    }

    fn send_heartbeat(&mut self, target: Member, payload: Vec<u8>) {
        trace!("{} - Sending heartbeat to {}", self.local_id, target.id);
        let messaging = self.messaging.clone();
        let commands = self.commands.clone();
        let timeout = self.config.effective_heartbeat_timeout();
        self.in_flight.spawn(async move {
            let result = messaging
                .send_and_receive(target.address, MEMBERSHIP_HEARTBEAT, payload, timeout)
                .await
                .and_then(|reply| codec::decode::<Vec<Member>>(&reply));
            let _ = commands.send(HeartbeatCommand::HeartbeatCompleted { target, result });
        });
    }

    fn heartbeat_completed(&mut self, target: Member, result: Result<Vec<Member>>) {
        match result {
            Ok(members) => {
                let mut responder = None;
                for member in members {
                    if member.id == self.local_id {
                        continue;
                    }
                    let direct = member.address == target.address;
                    // A reply that introduces or replaces the responder
                    // starts its detector instead of sampling it
                    let tracked = self
                        .directory
                        .get(&member.id)
                        .map_or(false, |current| current.version == member.version);
                    if direct && tracked {
                        responder = Some(member.id.clone());
                    }
                    self.update_member(member, direct);
                }
                if let Some(id) = responder {
                    if let Some(health) = self.health.get_mut(&id) {
                        health.detector.report();
                    }
                }
            }
            Err(e) => {
                if e.is_transient() {
                    debug!(
                        "{} - Sending heartbeat to {} failed: {}",
                        self.local_id, target.id, e
                    );
                } else {
                    warn!(
                        "{} - Heartbeat exchange with {} failed: {}",
                        self.local_id, target.id, e
                    );
                }
                self.heartbeat_failed(&target.id);
            }
        }
    }

    pub(crate) fn heartbeat_failed(&mut self, id: &MemberId) {
        let member = match self.directory.get(id) {
            Some(member) => member,
            None => return,
        };

        if member.is_reachable() {
            let previous = self
                .directory
                .update(id, |record| {
                    record.set_state(MemberState::Suspect);
                    record.copy()
                });
            if let Some(unreachable) = previous {
                debug!("{} - Member unreachable {}", self.local_id, unreachable);
                self.post(MembershipEventType::ReachabilityChanged, unreachable);
            }
        }

        let threshold = self.config.phi_failure_threshold;
        let failure_timeout = self.config.failure_timeout;
        let health = self.health(id);
        let phi = health.detector.phi();
        let silent_for = Instant::now().saturating_duration_since(health.last_contact);

        if phi >= threshold || (phi == 0.0 && silent_for > failure_timeout) {
            if let Some(record) = self.directory.remove(id) {
                self.health.remove(id);
                let removed = record.copy().with_state(MemberState::Dead);
                debug!(
                    "{} - Member removed {} (phi {:.2})",
                    self.local_id, removed, phi
                );
                self.post(MembershipEventType::MemberRemoved, removed);
            }
        }
    }

    /// Reconcile a record received from a peer. `direct` is true when the
    /// record describes the peer that sent it.
    pub(crate) fn update_member(&mut self, member: Member, direct: bool) {
        let current = match self.directory.get(&member.id) {
            Some(current) => current,
            None => {
                let added = member.with_state(MemberState::Alive);
                self.directory.insert(added.clone(), &mut self.rng);
                self.track(&added.id);
                debug!("{} - Member added {}", self.local_id, added);
                self.post(MembershipEventType::MemberAdded, added);
                return;
            }
        };

        if member.incarnation < current.incarnation {
            trace!("{} - Ignoring stale record {}", self.local_id, member);
            return;
        }

        if member.version != current.version {
            if member.incarnation == current.incarnation {
                trace!(
                    "{} - Ignoring version change without a new term {}",
                    self.local_id,
                    member
                );
                return;
            }

            self.directory.remove(&current.id);
            self.health.remove(&current.id);
            debug!(
                "{} - Evicted member {} for new version {:?}",
                self.local_id, current, member.version
            );
            if current.is_reachable() {
                self.post(
                    MembershipEventType::ReachabilityChanged,
                    current.with_state(MemberState::Suspect),
                );
            }
            self.post(
                MembershipEventType::MemberRemoved,
                current.with_state(MemberState::Dead),
            );

            let replacement = member.with_state(MemberState::Alive);
            self.directory.insert(replacement.clone(), &mut self.rng);
            self.track(&replacement.id);
            self.post(MembershipEventType::MemberAdded, replacement);
            return;
        }

        let id = current.id.clone();
        if direct {
            self.health(&id).last_contact = Instant::now();
        }
        if member.incarnation > current.incarnation {
            self.directory
                .update(&id, |record| record.set_incarnation(member.incarnation));
        }

        if !current.is_reachable() && direct {
            let reachable = self.directory.update(&id, |record| {
                record.set_state(MemberState::Alive);
                record.copy()
            });
            if let Some(reachable) = reachable {
                debug!("{} - Member reachable {}", self.local_id, reachable);
                self.post(MembershipEventType::ReachabilityChanged, reachable);
            }
        }

        if member.incarnation > current.incarnation && member.properties != current.properties {
            let changed = self.directory.update(&id, |record| {
                record.set_properties(member.properties);
                record.copy()
            });
            if let Some(changed) = changed {
                debug!("{} - Member metadata changed {}", self.local_id, changed);
                self.post(MembershipEventType::MetadataChanged, changed);
            }
        }
    }

    fn handle_heartbeat(&mut self, from: Member) -> Vec<Member> {
        trace!("{} - Received heartbeat from {}", self.local_id, from.id);
        if from.id != self.local_id {
            self.update_member(from, true);
        }
        self.directory
            .get_all()
            .into_iter()
            .filter(Member::is_reachable)
            .collect()
    }

    fn discovery_event(&mut self, event: NodeDiscoveryEvent) {
        let node = event.node;
        if node.id == self.local_id {
            return;
        }

        match event.event_type {
            NodeDiscoveryEventType::Join => {
                if self.directory.contains(&node.id) {
                    return;
                }
                match self.directory.get(&self.local_id).map(|local| codec::encode(&local)) {
                    Some(Ok(payload)) => {
                        self.send_heartbeat(Member::new(node.id, node.address), payload)
                    }
                    Some(Err(e)) => warn!("{} - Failed to encode heartbeat: {}", self.local_id, e),
                    None => {}
                }
            }
            NodeDiscoveryEventType::Leave => {
                // Guard only: removal of live members is left to failure
                // detection, and dead records never stay in the directory
                if let Some(member) = self.directory.get(&node.id) {
                    if !member.is_active() {
                        self.directory.remove(&member.id);
                        self.health.remove(&member.id);
                        debug!("{} - Member left {}", self.local_id, member);
                        self.post(MembershipEventType::MemberRemoved, member);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::BootstrapDiscoveryService;
    use crate::testing::LocalNetwork;
    use crate::transport::BootstrapService;
    use std::net::SocketAddr;
    use std::time::Duration;

    struct Harness {
        core: HeartbeatCore,
        directory: Arc<MemberDirectory>,
        notifier: Arc<EventNotifier>,
        _network: Arc<LocalNetwork>,
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn harness(config: HeartbeatConfig) -> Harness {
        let network = LocalNetwork::new();
        let bootstrap = network.bootstrap(addr(9000));
        let directory = Arc::new(MemberDirectory::new());
        let notifier = Arc::new(EventNotifier::new());
        directory.set_local(Member::new("local", addr(9000)));

        let (tx, _rx) = mpsc::unbounded_channel();
        let core = HeartbeatCore::new(
            MemberId::new("local"),
            HeartbeatConfig {
                random_seed: Some(3),
                ..config
            },
            directory.clone(),
            notifier.clone(),
            bootstrap.messaging_service(),
            Arc::new(BootstrapDiscoveryService::new(Vec::new())),
            tx,
        );

        Harness {
            core,
            directory,
            notifier,
            _network: network,
        }
    }

    fn peer(id: &str, term: u64) -> Member {
        let mut member = Member::new(id, addr(9001)).with_version("1.0.0");
        member.incarnation = term;
        member
    }

    async fn next_types(
        receiver: &mut tokio::sync::broadcast::Receiver<MembershipEvent>,
        count: usize,
    ) -> Vec<MembershipEventType> {
        let mut types = Vec::new();
        for _ in 0..count {
            types.push(receiver.recv().await.unwrap().event_type);
        }
        types
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_marks_unreachable_then_removes_after_timeout() {
        let mut h = harness(HeartbeatConfig {
            failure_timeout: Duration::from_secs(5),
            ..HeartbeatConfig::default()
        });
        let mut events = h.notifier.subscribe();
        h.notifier.start();
        let id = MemberId::new("a");

        h.core.update_member(peer("a", 1), true);
        h.core.heartbeat_failed(&id);
        assert_eq!(h.directory.get(&id).unwrap().state, MemberState::Suspect);

        // Unreachable is reported once
        h.core.heartbeat_failed(&id);

        tokio::time::advance(Duration::from_secs(6)).await;
        h.core.heartbeat_failed(&id);
        assert!(!h.directory.contains(&id));

        assert_eq!(
            next_types(&mut events, 3).await,
            vec![
                MembershipEventType::MemberAdded,
                MembershipEventType::ReachabilityChanged,
                MembershipEventType::MemberRemoved,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_phi_threshold_removes_member() {
        let mut h = harness(HeartbeatConfig {
            phi_min_samples: 3,
            failure_timeout: Duration::from_secs(3600),
            ..HeartbeatConfig::default()
        });
        let id = MemberId::new("a");
        h.core.update_member(peer("a", 1), true);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            h.core.heartbeat_completed(peer("a", 1), Ok(vec![peer("a", 1)]));
        }

        tokio::time::advance(Duration::from_millis(1100)).await;
        h.core.heartbeat_failed(&id);
        assert!(h.directory.contains(&id), "phi should still be low");

        tokio::time::advance(Duration::from_secs(5)).await;
        h.core.heartbeat_failed(&id);
        assert!(!h.directory.contains(&id));
    }

    #[tokio::test]
    async fn test_direct_contact_restores_reachability() {
        let mut h = harness(HeartbeatConfig::default());
        let id = MemberId::new("a");
        h.core.update_member(peer("a", 1), true);
        h.core.heartbeat_failed(&id);

        // Indirect mention does not restore
        h.core.update_member(peer("a", 1), false);
        assert_eq!(h.directory.get(&id).unwrap().state, MemberState::Suspect);

        h.core.update_member(peer("a", 1), true);
        assert_eq!(h.directory.get(&id).unwrap().state, MemberState::Alive);
    }

    #[tokio::test]
    async fn test_term_and_metadata_rules() {
        let mut h = harness(HeartbeatConfig::default());
        let mut events = h.notifier.subscribe();
        h.notifier.start();
        let id = MemberId::new("a");

        h.core.update_member(peer("a", 2), true);
        // Stale term ignored even with new properties
        h.core.update_member(peer("a", 1).with_property("k", "v"), true);
        assert!(h.directory.get(&id).unwrap().properties.is_empty());

        h.core.update_member(peer("a", 3).with_property("k", "v"), false);
        let member = h.directory.get(&id).unwrap();
        assert_eq!(member.incarnation, 3);
        assert_eq!(member.properties.get("k").map(String::as_str), Some("v"));

        assert_eq!(
            next_types(&mut events, 2).await,
            vec![
                MembershipEventType::MemberAdded,
                MembershipEventType::MetadataChanged,
            ]
        );
    }

    #[tokio::test]
    async fn test_version_change_replaces() {
        let mut h = harness(HeartbeatConfig::default());
        let mut events = h.notifier.subscribe();
        h.notifier.start();

        h.core.update_member(peer("a", 1), true);
        h.core.update_member(peer("a", 2).with_version("2.0.0"), true);

        assert_eq!(
            h.directory.get(&MemberId::new("a")).unwrap().version.as_deref(),
            Some("2.0.0")
        );
        assert_eq!(
            next_types(&mut events, 4).await,
            vec![
                MembershipEventType::MemberAdded,
                MembershipEventType::ReachabilityChanged,
                MembershipEventType::MemberRemoved,
                MembershipEventType::MemberAdded,
            ]
        );
    }

    #[tokio::test]
    async fn test_older_term_never_replaces_newer_version() {
        let mut h = harness(HeartbeatConfig::default());
        let mut events = h.notifier.subscribe();
        h.notifier.start();
        let id = MemberId::new("a");

        h.core.update_member(peer("a", 5).with_version("2.0.0"), true);
        // Relayed record of the previous process
        h.core.update_member(peer("a", 1), false);
        // Same term, different version
        h.core.update_member(peer("a", 5), true);

        let member = h.directory.get(&id).unwrap();
        assert_eq!(member.version.as_deref(), Some("2.0.0"));
        assert_eq!(member.incarnation, 5);
        assert_eq!(member.state, MemberState::Alive);

        h.core.update_member(peer("a", 6).with_property("k", "v"), true);
        assert_eq!(
            next_types(&mut events, 4).await,
            vec![
                MembershipEventType::MemberAdded,
                MembershipEventType::ReachabilityChanged,
                MembershipEventType::MemberRemoved,
                MembershipEventType::MemberAdded,
            ]
        );
        assert_eq!(h.directory.get(&id).unwrap().version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_timeout_counts_from_last_contact() {
        let mut h = harness(HeartbeatConfig {
            failure_timeout: Duration::from_secs(5),
            ..HeartbeatConfig::default()
        });
        let id = MemberId::new("a");

        h.core.handle_heartbeat(peer("a", 1));
        tokio::time::advance(Duration::from_secs(4)).await;
        h.core.handle_heartbeat(peer("a", 1));
        tokio::time::advance(Duration::from_secs(4)).await;
        h.core.heartbeat_failed(&id);
        assert!(h.directory.contains(&id), "contact 4s ago is within the timeout");

        tokio::time::advance(Duration::from_secs(20)).await;
        h.core.heartbeat_failed(&id);
        assert!(!h.directory.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reply_samples_interval_since_insert() {
        let mut h = harness(HeartbeatConfig::default());
        let id = MemberId::new("a");

        // Introduced by the reply itself: nothing to measure yet
        h.core
            .heartbeat_completed(peer("a", 1), Ok(vec![peer("a", 1)]));
        assert_eq!(h.core.detector(&id).unwrap().samples(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        h.core
            .heartbeat_completed(peer("a", 1), Ok(vec![peer("a", 1)]));
        let detector = h.core.detector(&id).unwrap();
        assert_eq!(detector.samples(), 1);
        assert_eq!(detector.mean_interval(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_discovery_leave_keeps_live_member() {
        let mut h = harness(HeartbeatConfig::default());
        h.core.update_member(peer("a", 1), true);

        h.core.discovery_event(NodeDiscoveryEvent {
            event_type: NodeDiscoveryEventType::Leave,
            node: crate::discovery::Node::new("a", addr(9001)),
        });
        assert!(h.directory.contains(&MemberId::new("a")));
    }

    #[tokio::test]
    async fn test_heartbeat_reply_contains_reachable_members_only() {
        let mut h = harness(HeartbeatConfig::default());
        h.core.update_member(peer("a", 1), true);
        h.core.heartbeat_failed(&MemberId::new("a"));

        let mut b = peer("b", 1);
        b.address = addr(9002);
        let reply = h.core.handle_heartbeat(b);

        let ids: Vec<String> = reply.into_iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "local"]);
    }
}
