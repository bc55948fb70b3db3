//! Heartbeat membership protocol
//!
//! Every member heartbeats every other member on a fixed interval and gets
//! back the responder's view of reachable members. Silence is scored with a
//! phi accrual detector per peer.

pub(crate) mod engine;
pub mod phi;

use self::engine::{HeartbeatCommand, HeartbeatCore};
use crate::codec;
use crate::config::HeartbeatConfig;
use crate::directory::MemberDirectory;
use crate::discovery::NodeDiscoveryService;
use crate::error::{MembershipError, Result};
use crate::event::{
    EventNotifier, ListenerId, MembershipEvent, MembershipEventListener, MembershipEventType,
};
use crate::member::{current_millis, initial_incarnation, Member, MemberId, MemberState, Properties};
use crate::scheduler::TaskSet;
use crate::transport::{BootstrapService, MessageHandler, MessagingService};
use crate::{GroupMembershipProtocol, ProtocolType};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const MEMBERSHIP_HEARTBEAT: &str = "membership-heartbeat";

/// Heartbeat group membership protocol
pub struct HeartbeatMembershipProtocol {
    config: HeartbeatConfig,
    directory: Arc<MemberDirectory>,
    notifier: Arc<EventNotifier>,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_id: MemberId,
    commands: mpsc::UnboundedSender<HeartbeatCommand>,
    core: JoinHandle<()>,
    tasks: TaskSet,
    messaging: Arc<dyn MessagingService>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.core.abort();
    }
}

impl HeartbeatMembershipProtocol {
    pub fn new(config: HeartbeatConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            directory: Arc::new(MemberDirectory::new()),
            notifier: Arc::new(EventNotifier::new()),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }
}

#[async_trait]
impl GroupMembershipProtocol for HeartbeatMembershipProtocol {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Heartbeat
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
        messaging.register_handler(
            MEMBERSHIP_HEARTBEAT,
            Arc::new(HeartbeatHandler {
                commands: commands.clone(),
            }),
        );

        let core = HeartbeatCore::new(
            local_id.clone(),
            self.config.clone(),
            self.directory.clone(),
            self.notifier.clone(),
            messaging.clone(),
            discovery.clone(),
            commands.clone(),
        );
        let core = tokio::spawn(core.run(receiver));

        let mut tasks = TaskSet::new();
        tasks.spawn_forward(
            discovery.subscribe(),
            commands.clone(),
            HeartbeatCommand::Discovery,
        );
        tasks.spawn_periodic(self.config.heartbeat_interval, commands.clone(), || {
            HeartbeatCommand::Tick
        });

        // First round goes out immediately so bootstrap nodes learn about us
        commands.send(HeartbeatCommand::Tick)?;

        *running = Some(Running {
            local_id: local_id.clone(),
            commands,
            core,
            tasks,
            messaging,
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
            debug!("{} - Leaving on behalf of {}", running.local_id, member.id);
        }

        running.tasks.abort_all();

        let (ack, done) = oneshot::channel();
        if running.commands.send(HeartbeatCommand::Leave { ack }).is_ok() {
            let _ = done.await;
        }
        running.messaging.unregister_handler(MEMBERSHIP_HEARTBEAT);

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
            .send(HeartbeatCommand::UpdateLocalProperties { properties, ack })?;
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

struct HeartbeatHandler {
    commands: mpsc::UnboundedSender<HeartbeatCommand>,
}

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, _from: SocketAddr, payload: Vec<u8>) -> Result<Vec<u8>> {
        let from: Member = codec::decode(&payload)?;
        let (reply, response) = oneshot::channel();
        self.commands.send(HeartbeatCommand::Heartbeat { from, reply })?;
        codec::encode(&response.await?)
    }
}
