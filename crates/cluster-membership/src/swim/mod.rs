//! SWIM membership protocol
//!
//! Members are probed round-robin; a failed direct probe is retried
//! indirectly through random helpers before the target is suspected. Suspects
//! that do not refute within the failure timeout are removed. State changes
//! spread by gossip and periodic anti-entropy sync.

pub(crate) mod engine;
pub mod messages;

use self::engine::{SwimCommand, SwimCore};
use self::messages::{
    ProbeAck, ProbeMessage, MEMBERSHIP_GOSSIP, MEMBERSHIP_PROBE, MEMBERSHIP_PROBE_REQUEST,
    MEMBERSHIP_SYNC,
};
use crate::codec;
use crate::config::SwimConfig;
use crate::directory::MemberDirectory;
use crate::discovery::NodeDiscoveryService;
use crate::error::{MembershipError, Result};
use crate::event::{
    EventNotifier, ListenerId, MembershipEvent, MembershipEventListener, MembershipEventType,
};
use crate::member::{current_millis, initial_incarnation, Member, MemberId, MemberState, Properties};
use crate::scheduler::TaskSet;
use crate::transport::{
    BootstrapService, MessageHandler, MessagingService, UnicastListener, UnicastService,
};
use crate::{GroupMembershipProtocol, ProtocolType};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// SWIM group membership protocol
pub struct SwimMembershipProtocol {
    config: SwimConfig,
    directory: Arc<MemberDirectory>,
    notifier: Arc<EventNotifier>,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_id: MemberId,
    commands: mpsc::UnboundedSender<SwimCommand>,
    core: JoinHandle<()>,
    tasks: TaskSet,
    messaging: Arc<dyn MessagingService>,
    unicast: Arc<dyn UnicastService>,
    gossip_listener: Arc<dyn UnicastListener>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.core.abort();
    }
}

impl SwimMembershipProtocol {
    pub fn new(config: SwimConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            directory: Arc::new(MemberDirectory::new()),
            notifier: Arc::new(EventNotifier::new()),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SwimConfig {
        &self.config
    }
}

#[async_trait]
impl GroupMembershipProtocol for SwimMembershipProtocol {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Swim
    }

    async fn join(
        &self,
        bootstrap: Arc<dyn BootstrapService>,
        discovery: Arc<dyn NodeDiscoveryService>,
        member: Member,
    ) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let mut local = member;
        local.state = MemberState::Alive;
        local.incarnation = initial_incarnation();
        local.timestamp = current_millis();
        let local_id = local.id.clone();

        self.notifier.start();
        self.directory.set_local(local.clone());
        info!("{} - Member activated: {}", local_id, local);
        self.notifier
            .post(MembershipEvent::new(MembershipEventType::MemberAdded, local));

        let (commands, receiver) = mpsc::unbounded_channel();
        let messaging = bootstrap.messaging_service();
        let unicast = bootstrap.unicast_service();

        for kind in [RequestKind::Probe, RequestKind::ProbeRequest, RequestKind::Sync] {
            messaging.register_handler(
                kind.message_type(),
                Arc::new(SwimRequestHandler {
                    kind,
                    commands: commands.clone(),
                }),
            );
        }
        let gossip_listener: Arc<dyn UnicastListener> = Arc::new(GossipListener {
            commands: commands.clone(),
        });
        unicast.add_listener(MEMBERSHIP_GOSSIP, gossip_listener.clone());

        let core = SwimCore::new(
            local_id.clone(),
            self.config.clone(),
            self.directory.clone(),
            self.notifier.clone(),
            bootstrap.as_ref(),
            discovery.clone(),
            commands.clone(),
        );
        let core = tokio::spawn(core.run(receiver));

        let mut tasks = TaskSet::new();
        tasks.spawn_forward(discovery.subscribe(), commands.clone(), SwimCommand::Discovery);
        tasks.spawn_periodic(self.config.gossip_interval, commands.clone(), || {
            SwimCommand::GossipTick
        });
        tasks.spawn_periodic(self.config.probe_interval, commands.clone(), || {
            SwimCommand::ProbeTick
        });
        tasks.spawn_periodic(self.config.sync_interval, commands.clone(), || {
            SwimCommand::SyncTick
        });

        // Eager sync with every discovery node
        commands.send(SwimCommand::SyncAll)?;

        *running = Some(Running {
            local_id: local_id.clone(),
            commands,
            core,
            tasks,
            messaging,
            unicast,
            gossip_listener,
        });
        info!("{} - Started", local_id);
        Ok(())
    }

    async fn leave(&self, member: &Member) -> Result<()> {
        let mut running = match self.running.lock().await.take() {
            Some(running) => running,
            None => return Ok(()),
        };
        if member.id != running.local_id {
            debug!(
                "{} - Leaving on behalf of {}",
                running.local_id, member.id
            );
        }

        running.tasks.abort_all();

        let (ack, done) = oneshot::channel();
        if running.commands.send(SwimCommand::Leave { ack }).is_ok() {
            let _ = done.await;
        }

        for kind in [RequestKind::Probe, RequestKind::ProbeRequest, RequestKind::Sync] {
            running.messaging.unregister_handler(kind.message_type());
        }
        running
            .unicast
            .remove_listener(MEMBERSHIP_GOSSIP, &running.gossip_listener);

        info!("{} - Stopped", running.local_id);
        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        self.directory.get_all()
    }

    fn member(&self, id: &MemberId) -> Option<Member> {
        self.directory.get(id)
    }

    fn local_member(&self) -> Option<Member> {
        self.directory.local()
    }

    async fn update_local_properties(&self, properties: Properties) -> Result<()> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(MembershipError::NotStarted)?;

        let (ack, done) = oneshot::channel();
        running
            .commands
            .send(SwimCommand::UpdateLocalProperties { properties, ack })?;
        done.await?;
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn MembershipEventListener>) -> ListenerId {
        self.notifier.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.notifier.remove_listener(id)
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.notifier.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Probe,
    ProbeRequest,
    Sync,
}

impl RequestKind {
    fn message_type(self) -> &'static str {
        match self {
            Self::Probe => MEMBERSHIP_PROBE,
            Self::ProbeRequest => MEMBERSHIP_PROBE_REQUEST,
            Self::Sync => MEMBERSHIP_SYNC,
        }
    }
}

/// Decodes requests and hands them to the sequencing task
struct SwimRequestHandler {
    kind: RequestKind,
    commands: mpsc::UnboundedSender<SwimCommand>,
}

#[async_trait]
impl MessageHandler for SwimRequestHandler {
    async fn handle(&self, _from: SocketAddr, payload: Vec<u8>) -> Result<Vec<u8>> {
        match self.kind {
            RequestKind::Probe => {
                let probe: ProbeMessage = codec::decode(&payload)?;
                let (reply, response) = oneshot::channel();
                self.commands.send(SwimCommand::Probe {
                    from: probe.from,
                    target: probe.target,
                    reply,
                })?;
                let local = response.await?.ok_or(MembershipError::NotStarted)?;
                codec::encode(&local)
            }
            RequestKind::ProbeRequest => {
                let suspect: Member = codec::decode(&payload)?;
                let (reply, response) = oneshot::channel();
                self.commands
                    .send(SwimCommand::ProbeRequest { suspect, reply })?;
                let acknowledged = response.await?;
                codec::encode(&ProbeAck { acknowledged })
            }
            RequestKind::Sync => {
                let from: Member = codec::decode(&payload)?;
                let (reply, response) = oneshot::channel();
                self.commands.send(SwimCommand::Sync { from, reply })?;
                codec::encode(&response.await?)
            }
        }
    }
}

struct GossipListener {
    commands: mpsc::UnboundedSender<SwimCommand>,
}

impl UnicastListener for GossipListener {
    fn on_message(&self, from: SocketAddr, payload: Vec<u8>) {
        match codec::decode::<Vec<Member>>(&payload) {
            Ok(updates) => {
                let _ = self.commands.send(SwimCommand::Gossip(updates));
            }
            Err(e) => warn!("Discarding malformed gossip from {}: {}", from, e),
        }
    }
}
