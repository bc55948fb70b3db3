//! Sequencing task for the SWIM protocol
//!
//! Every mutation of the member directory happens here, one command at a
//! time. Network I/O runs in spawned tasks which report back through the
//! command channel; those tasks are aborted on leave so late results are
//! never merged.

use super::messages::{
    ProbeAck, ProbeMessage, MEMBERSHIP_GOSSIP, MEMBERSHIP_PROBE, MEMBERSHIP_PROBE_REQUEST,
    MEMBERSHIP_SYNC,
};
use crate::codec;
use crate::config::SwimConfig;
use crate::directory::MemberDirectory;
use crate::discovery::{NodeDiscoveryEvent, NodeDiscoveryEventType, NodeDiscoveryService};
use crate::error::Result;
use crate::event::{EventNotifier, MembershipEvent, MembershipEventType};
use crate::member::{Member, MemberId, MemberState, Properties};
use crate::transport::{BootstrapService, MessagingService, UnicastService};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub(crate) enum SwimCommand {
    ProbeTick,
    GossipTick,
    SyncTick,
    SyncAll,
    ProbeCompleted {
        target: Member,
        result: Result<Member>,
    },
    IndirectProbeCompleted {
        suspect: Member,
        acknowledged: bool,
    },
    SyncCompleted {
        peer: Member,
        result: Result<Vec<Member>>,
    },
    Gossip(Vec<Member>),
    Probe {
        from: Member,
        target: Member,
        reply: oneshot::Sender<Option<Member>>,
    },
    ProbeRequest {
        suspect: Member,
        reply: oneshot::Sender<bool>,
    },
    Sync {
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

pub(crate) struct SwimCore {
    local_id: MemberId,
    config: SwimConfig,
    directory: Arc<MemberDirectory>,
    notifier: Arc<EventNotifier>,
    messaging: Arc<dyn MessagingService>,
    unicast: Arc<dyn UnicastService>,
    discovery: Arc<dyn NodeDiscoveryService>,
    commands: mpsc::UnboundedSender<SwimCommand>,
    /// Latest pending gossip update per member
    updates: HashMap<MemberId, Member>,
    /// Local properties as of the last metadata check
    local_properties: Properties,
    sync_members: Vec<Member>,
    probe_counter: usize,
    rng: StdRng,
    in_flight: JoinSet<()>,
}

impl SwimCore {
    /// Build the core for a local member already installed in `directory`
    pub(crate) fn new(
        local_id: MemberId,
        config: SwimConfig,
        directory: Arc<MemberDirectory>,
        notifier: Arc<EventNotifier>,
        bootstrap: &dyn BootstrapService,
        discovery: Arc<dyn NodeDiscoveryService>,
        commands: mpsc::UnboundedSender<SwimCommand>,
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
            messaging: bootstrap.messaging_service(),
            unicast: bootstrap.unicast_service(),
            discovery,
            commands,
            updates: HashMap::new(),
            local_properties,
            sync_members: Vec::new(),
            probe_counter: 0,
            rng,
            in_flight: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SwimCommand>) {
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

    /// Apply one command. Returns false once the member has left.
    pub(crate) fn handle(&mut self, command: SwimCommand) -> bool {
        match command {
            SwimCommand::ProbeTick => self.probe_next(),
            SwimCommand::GossipTick => self.gossip_tick(),
            SwimCommand::SyncTick => self.sync_next(),
            SwimCommand::SyncAll => self.sync_all(),
            SwimCommand::ProbeCompleted { target, result } => self.probe_completed(target, result),
            SwimCommand::IndirectProbeCompleted {
                suspect,
                acknowledged,
            } => {
                if acknowledged {
                    trace!("{} - Indirect probe of {} succeeded", self.local_id, suspect.id);
                } else {
                    self.fail_probes(suspect);
                }
            }
            SwimCommand::SyncCompleted { peer, result } => self.sync_completed(peer, result),
            SwimCommand::Gossip(updates) => {
                for update in updates {
                    self.update_state(update);
                }
            }
            SwimCommand::Probe {
                from,
                target,
                reply,
            } => {
                let _ = reply.send(self.handle_probe(from, target));
            }
            SwimCommand::ProbeRequest { suspect, reply } => self.handle_probe_request(suspect, reply),
            SwimCommand::Sync { from, reply } => {
                let _ = reply.send(self.handle_sync(from));
            }
            SwimCommand::Discovery(event) => self.discovery_event(event),
            SwimCommand::UpdateLocalProperties { properties, ack } => {
                self.directory
                    .update(&self.local_id, |record| record.set_properties(properties));
                let _ = ack.send(());
            }
            SwimCommand::Leave { ack } => {
                self.shutdown();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn local(&self) -> Option<Member> {
        self.directory.get(&self.local_id)
    }

    fn post(&self, event_type: MembershipEventType, member: Member) {
        self.notifier.post(MembershipEvent::new(event_type, member));
    }

    fn record_update(&mut self, member: Member) {
        self.updates.insert(member.id.clone(), member);
    }

    fn set_state(&self, id: &MemberId, state: MemberState) -> Option<Member> {
        self.directory.update(id, |record| {
            record.set_state(state);
            record.copy()
        })
    }

    /// Merge an externally observed record. Returns whether it was accepted.
    pub(crate) fn update_state(&mut self, member: Member) -> bool {
        if member.id == self.local_id {
            self.defend(&member);
            return false;
        }

        let current = match self.directory.get(&member.id) {
            Some(current) => current,
            None => {
                if member.state != MemberState::Alive {
                    trace!(
                        "{} - Ignoring {} record of unknown member {}",
                        self.local_id,
                        member.state,
                        member.id
                    );
                    return false;
                }
                self.directory.insert(member.clone(), &mut self.rng);
                debug!("{} - Member added {}", self.local_id, member);
                self.post(MembershipEventType::MemberAdded, member.clone());
                self.record_update(member);
                return true;
            }
        };

        if member.incarnation > current.incarnation {
            if member.version != current.version {
                self.replace(current, member);
            } else {
                self.adopt(current, member);
            }
            return true;
        }

        if member.incarnation == current.incarnation && member.state > current.state {
            match member.state {
                MemberState::Suspect => {
                    if let Some(suspect) = self.set_state(&member.id, MemberState::Suspect) {
                        debug!("{} - Member unreachable {}", self.local_id, suspect);
                        self.post(MembershipEventType::ReachabilityChanged, suspect.clone());
                        self.notify_suspect(&suspect);
                        self.record_update(suspect);
                    }
                }
                MemberState::Dead => self.remove_dead(current),
                MemberState::Alive => {}
            }
            return true;
        }

        trace!("{} - Ignoring stale update {}", self.local_id, member);
        false
    }

    /// Higher incarnation with a new version: the old identity is gone
    fn replace(&mut self, current: Member, member: Member) {
        self.directory.remove(&current.id);
        debug!(
            "{} - Evicted member {} for new version {:?}",
            self.local_id, current, member.version
        );
        self.post(
            MembershipEventType::MemberRemoved,
            current.with_state(MemberState::Dead),
        );

        if member.state == MemberState::Dead {
            self.record_update(member);
            return;
        }

        let replacement = member.with_state(MemberState::Alive);
        self.directory.insert(replacement.clone(), &mut self.rng);
        self.post(MembershipEventType::MemberAdded, replacement.clone());
        self.record_update(replacement);
    }

    /// Higher incarnation of the same version: take over its state
    fn adopt(&mut self, current: Member, member: Member) {
        let id = member.id.clone();
        let properties_changed = member.properties != current.properties;
        self.directory
            .update(&id, |record| record.set_incarnation(member.incarnation));

        match member.state {
            MemberState::Alive => {
                if current.state != MemberState::Alive {
                    if let Some(alive) = self.set_state(&id, MemberState::Alive) {
                        debug!("{} - Member reachable {}", self.local_id, alive);
                        self.post(MembershipEventType::ReachabilityChanged, alive);
                    }
                }
                if properties_changed {
                    self.change_metadata(&id, member.properties);
                }
            }
            MemberState::Suspect => {
                if properties_changed {
                    self.change_metadata(&id, member.properties);
                }
                if current.state == MemberState::Alive {
                    if let Some(suspect) = self.set_state(&id, MemberState::Suspect) {
                        debug!("{} - Member unreachable {}", self.local_id, suspect);
                        self.post(MembershipEventType::ReachabilityChanged, suspect.clone());
                        self.notify_suspect(&suspect);
                    }
                }
            }
            MemberState::Dead => {
                if let Some(latest) = self.directory.get(&id) {
                    self.remove_dead(latest);
                }
                return;
            }
        }

        if let Some(latest) = self.directory.get(&id) {
            self.record_update(latest);
        }
    }

    fn change_metadata(&mut self, id: &MemberId, properties: Properties) {
        let changed = self.directory.update(id, |record| {
            record.set_properties(properties);
            record.copy()
        });
        if let Some(member) = changed {
            debug!("{} - Member metadata changed {}", self.local_id, member);
            self.post(MembershipEventType::MetadataChanged, member);
        }
    }

    fn remove_dead(&mut self, current: Member) {
        let dead = current.with_state(MemberState::Dead);
        if current.state == MemberState::Alive {
            self.post(MembershipEventType::ReachabilityChanged, dead.clone());
        }
        self.directory.remove(&current.id);
        debug!("{} - Member removed {}", self.local_id, dead);
        self.post(MembershipEventType::MemberRemoved, dead.clone());
        self.record_update(dead);
    }

    /// Refute a claim that the local member is suspect, dead or stale
    pub(crate) fn defend(&mut self, claim: &Member) -> bool {
        let local = match self.local() {
            Some(local) => local,
            None => return false,
        };

        let incarnation = if claim.incarnation > local.incarnation {
            claim.incarnation.saturating_add(1)
        } else if claim.incarnation == local.incarnation && claim.state != MemberState::Alive {
            local.incarnation.saturating_add(1)
        } else {
            return false;
        };

        let refuted = self.directory.update(&self.local_id, |record| {
            record.set_incarnation(incarnation);
            record.copy()
        });

        match refuted {
            Some(refuted) => {
                debug!(
                    "{} - Refuting {} claim at incarnation {}, now {}",
                    self.local_id, claim.state, claim.incarnation, refuted.incarnation
                );
                self.record_update(refuted.clone());
                if self.config.broadcast_disputes {
                    self.broadcast(&refuted);
                }
                true
            }
            None => false,
        }
    }

    fn notify_suspect(&self, suspect: &Member) {
        if !self.config.notify_suspect {
            return;
        }
        match codec::encode(&vec![suspect.clone()]) {
            Ok(payload) => self
                .unicast
                .unicast(suspect.address, MEMBERSHIP_GOSSIP, payload),
            Err(e) => warn!("{} - Failed to encode suspect notice: {}", self.local_id, e),
        }
    }

    /// Push a single update to every known peer
    fn broadcast(&self, update: &Member) {
        let payload = match codec::encode(&vec![update.clone()]) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} - Failed to encode broadcast: {}", self.local_id, e);
                return;
            }
        };

        for member in self.directory.get_all() {
            if member.id != self.local_id {
                self.unicast
                    .unicast(member.address, MEMBERSHIP_GOSSIP, payload.clone());
            }
        }
    }

    fn gossip_tick(&mut self) {
        self.check_metadata();
        self.check_failures();

        if self.updates.is_empty() {
            return;
        }
        let updates: Vec<Member> = self.updates.drain().map(|(_, update)| update).collect();
        let peers = self.directory.random_members(
            self.config.gossip_fanout,
            &[&self.local_id],
            &mut self.rng,
        );
        if peers.is_empty() {
            return;
        }

        let payload = match codec::encode(&updates) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} - Failed to encode gossip: {}", self.local_id, e);
                return;
            }
        };
        for peer in peers {
            trace!(
                "{} - Gossiping {} updates to {}",
                self.local_id,
                updates.len(),
                peer.id
            );
            self.unicast
                .unicast(peer.address, MEMBERSHIP_GOSSIP, payload.clone());
        }
    }

    fn check_metadata(&mut self) {
        let local = match self.local() {
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
            self.post(MembershipEventType::MetadataChanged, changed.clone());
            self.record_update(changed);
        }
    }

    /// Declare dead every member suspected for longer than the failure timeout
    pub(crate) fn check_failures(&mut self) {
        let now = Instant::now();
        let expired: Vec<Member> = self
            .directory
            .records()
            .into_iter()
            .filter(|(member, updated)| {
                member.id != self.local_id
                    && member.state == MemberState::Suspect
                    && now.duration_since(*updated) > self.config.failure_timeout
            })
            .map(|(member, _)| member)
            .collect();

        for member in expired {
            self.remove_dead(member);
        }
    }

    fn probe_next(&mut self) {
        let mut targets: Vec<Member> = self
            .discovery
            .nodes()
            .into_iter()
            .filter(|node| node.id != self.local_id && !self.directory.contains(&node.id))
            .map(|node| Member::new(node.id, node.address))
            .collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets.extend(self.directory.pool());

        if targets.is_empty() {
            return;
        }
        self.probe_counter = self.probe_counter.wrapping_add(1);
        let target = targets[self.probe_counter % targets.len()].clone();
        self.probe(target);
    }

    pub(crate) fn probe(&mut self, target: Member) {
        let local = match self.local() {
            Some(local) => local,
            None => return,
        };
        let payload = match codec::encode(&ProbeMessage {
            from: local,
            target: target.clone(),
        }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} - Failed to encode probe: {}", self.local_id, e);
                return;
            }
        };

        trace!("{} - Probing {}", self.local_id, target);
        let messaging = self.messaging.clone();
        let commands = self.commands.clone();
        let timeout = self.config.probe_timeout;
        self.in_flight.spawn(async move {
            let result = messaging
                .send_and_receive(target.address, MEMBERSHIP_PROBE, payload, timeout)
                .await
                .and_then(|reply| codec::decode::<Member>(&reply));
            let _ = commands.send(SwimCommand::ProbeCompleted { target, result });
        });
    }

    fn probe_completed(&mut self, target: Member, result: Result<Member>) {
        match result {
            Ok(member) => {
                self.update_state(member);
            }
            Err(e) => {
                if e.is_transient() {
                    debug!("{} - Failed to probe {}: {}", self.local_id, target.id, e);
                } else {
                    warn!("{} - Probe of {} failed: {}", self.local_id, target.id, e);
                }
                // Only escalate if nobody changed the target's incarnation meanwhile
                if let Some(current) = self.directory.get(&target.id) {
                    if current.incarnation == target.incarnation {
                        self.request_probes(current);
                    }
                }
            }
        }
    }

    fn request_probes(&mut self, suspect: Member) {
        let helpers = self.directory.random_members(
            self.config.suspect_probes.saturating_sub(1),
            &[&self.local_id, &suspect.id],
            &mut self.rng,
        );
        if helpers.is_empty() {
            self.fail_probes(suspect);
            return;
        }

        let payload = match codec::encode(&suspect) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} - Failed to encode probe request: {}", self.local_id, e);
                return;
            }
        };

        debug!(
            "{} - Requesting probes of {} from {} members",
            self.local_id,
            suspect.id,
            helpers.len()
        );
        let messaging = self.messaging.clone();
        let commands = self.commands.clone();
        let timeout = self.config.effective_probe_request_timeout();
        self.in_flight.spawn(async move {
            let mut requests = JoinSet::new();
            for helper in helpers {
                let messaging = messaging.clone();
                let payload = payload.clone();
                requests.spawn(async move {
                    messaging
                        .send_and_receive(helper.address, MEMBERSHIP_PROBE_REQUEST, payload, timeout)
                        .await
                        .and_then(|reply| codec::decode::<ProbeAck>(&reply))
                        .map(|ack| ack.acknowledged)
                        .unwrap_or(false)
                });
            }

            let mut acknowledged = false;
            while let Some(result) = requests.join_next().await {
                if matches!(result, Ok(true)) {
                    acknowledged = true;
                    break;
                }
            }
            let _ = commands.send(SwimCommand::IndirectProbeCompleted {
                suspect,
                acknowledged,
            });
        });
    }

    fn fail_probes(&mut self, suspect: Member) {
        debug!("{} - Failed all probes of {}", self.local_id, suspect);
        let suspect = suspect.with_state(MemberState::Suspect);
        if self.update_state(suspect.clone()) && self.config.broadcast_updates {
            self.broadcast(&suspect);
        }
    }

    fn handle_probe(&mut self, from: Member, target: Member) -> Option<Member> {
        trace!("{} - Received probe from {}", self.local_id, from.id);
        if target.id == self.local_id {
            self.defend(&target);
        }
        self.update_state(from);
        self.local()
    }

    fn handle_probe_request(&mut self, suspect: Member, reply: oneshot::Sender<bool>) {
        let local = match self.local() {
            Some(local) => local,
            None => return,
        };
        let payload = match codec::encode(&ProbeMessage {
            from: local,
            target: suspect.clone(),
        }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} - Failed to encode probe: {}", self.local_id, e);
                let _ = reply.send(false);
                return;
            }
        };

        trace!("{} - Probing {} on request", self.local_id, suspect.id);
        let messaging = self.messaging.clone();
        let timeout = self.config.probe_timeout;
        self.in_flight.spawn(async move {
            let acknowledged = messaging
                .send_and_receive(suspect.address, MEMBERSHIP_PROBE, payload, timeout)
                .await
                .is_ok();
            let _ = reply.send(acknowledged);
        });
    }

    fn handle_sync(&mut self, from: Member) -> Vec<Member> {
        trace!("{} - Received sync from {}", self.local_id, from.id);
        self.update_state(from);
        self.directory.get_all()
    }

    fn sync_next(&mut self) {
        if self.sync_members.is_empty() {
            let mut candidates = self.directory.pool();
            for node in self.discovery.nodes() {
                if node.id != self.local_id && !candidates.iter().any(|m| m.id == node.id) {
                    candidates.push(Member::new(node.id, node.address));
                }
            }
            candidates.shuffle(&mut self.rng);
            self.sync_members = candidates;
        }

        if let Some(peer) = self.sync_members.pop() {
            self.sync(peer);
        }
    }

    fn sync_all(&mut self) {
        let peers: Vec<Member> = self
            .discovery
            .nodes()
            .into_iter()
            .filter(|node| node.id != self.local_id)
            .map(|node| Member::new(node.id, node.address))
            .collect();
        for peer in peers {
            self.sync(peer);
        }
    }

    fn sync(&mut self, peer: Member) {
        let local = match self.local() {
            Some(local) => local,
            None => return,
        };
        let payload = match codec::encode(&local) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("{} - Failed to encode sync: {}", self.local_id, e);
                return;
            }
        };

        trace!("{} - Synchronizing with {}", self.local_id, peer.id);
        let messaging = self.messaging.clone();
        let commands = self.commands.clone();
        let timeout = self.config.effective_sync_timeout();
        self.in_flight.spawn(async move {
            let result = messaging
                .send_and_receive(peer.address, MEMBERSHIP_SYNC, payload, timeout)
                .await
                .and_then(|reply| codec::decode::<Vec<Member>>(&reply));
            let _ = commands.send(SwimCommand::SyncCompleted { peer, result });
        });
    }

    fn sync_completed(&mut self, peer: Member, result: Result<Vec<Member>>) {
        match result {
            Ok(members) => {
                for member in members {
                    self.update_state(member);
                }
            }
            Err(e) if e.is_transient() => debug!(
                "{} - Failed to synchronize with {}: {}",
                self.local_id, peer.id, e
            ),
            Err(e) => warn!(
                "{} - Synchronization with {} failed: {}",
                self.local_id, peer.id, e
            ),
        }
    }

    fn discovery_event(&mut self, event: NodeDiscoveryEvent) {
        let node = event.node;
        if node.id == self.local_id {
            return;
        }

        match event.event_type {
            NodeDiscoveryEventType::Join => {
                if !self.directory.contains(&node.id) {
                    self.probe(Member::new(node.id, node.address));
                }
            }
            NodeDiscoveryEventType::Leave => {
                // Guard only: live members are left to failure detection and
                // dead records never stay in the directory
                if let Some(member) = self.directory.get(&node.id) {
                    if !member.is_active() {
                        self.directory.remove(&member.id);
                        debug!("{} - Member left {}", self.local_id, member);
                        self.post(MembershipEventType::MemberRemoved, member);
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.in_flight.abort_all();
        self.directory
            .update(&self.local_id, |record| record.set_state(MemberState::Dead));
        self.directory.clear();
        self.updates.clear();
        self.sync_members.clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_updates(&self) -> &HashMap<MemberId, Member> {
        &self.updates
    }
}
