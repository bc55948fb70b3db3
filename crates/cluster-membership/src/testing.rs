//! In-process transport for exercising protocols without sockets
//!
//! Every endpoint registered on a [`LocalNetwork`] can reach every other one
//! unless a partition or disconnect says otherwise. Requests to unreachable
//! endpoints fail immediately with [`MembershipError::Unreachable`].

use crate::error::{MembershipError, Result};
use crate::transport::{
    same_listener, BootstrapService, MessageHandler, MessagingService, UnicastListener,
    UnicastService,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// Shared fabric connecting local endpoints
#[derive(Default)]
pub struct LocalNetwork {
    endpoints: DashMap<SocketAddr, Arc<LocalEndpoint>>,
    partitions: DashSet<(SocketAddr, SocketAddr)>,
    disconnected: DashSet<SocketAddr>,
    sent: DashMap<SocketAddr, u64>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (or replace) the endpoint at `address`
    pub fn bootstrap(self: &Arc<Self>, address: SocketAddr) -> Arc<LocalBootstrap> {
        let endpoint = Arc::new(LocalEndpoint {
            address,
            network: Arc::downgrade(self),
            handlers: DashMap::new(),
            listeners: DashMap::new(),
        });
        self.endpoints.insert(address, endpoint.clone());
        Arc::new(LocalBootstrap { endpoint })
    }

    /// Cut traffic between two endpoints in both directions
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    /// Isolate an endpoint from everyone, as if its process had crashed
    pub fn disconnect(&self, address: SocketAddr) {
        self.disconnected.insert(address);
    }

    pub fn reconnect(&self, address: SocketAddr) {
        self.disconnected.remove(&address);
    }

    /// Number of messages an endpoint has put on the network
    pub fn sent_count(&self, address: SocketAddr) -> u64 {
        self.sent.get(&address).map(|count| *count).unwrap_or(0)
    }

    fn can_reach(&self, from: SocketAddr, to: SocketAddr) -> bool {
        !self.disconnected.contains(&from)
            && !self.disconnected.contains(&to)
            && !self.partitions.contains(&(from, to))
    }

    fn route(&self, from: SocketAddr, to: SocketAddr) -> Result<Arc<LocalEndpoint>> {
        *self.sent.entry(from).or_insert(0) += 1;

        if !self.can_reach(from, to) {
            return Err(MembershipError::Unreachable(to));
        }

        self.endpoints
            .get(&to)
            .map(|endpoint| endpoint.value().clone())
            .ok_or(MembershipError::Unreachable(to))
    }
}

/// One addressable participant on a [`LocalNetwork`]
pub struct LocalEndpoint {
    address: SocketAddr,
    network: Weak<LocalNetwork>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    listeners: DashMap<String, Vec<Arc<dyn UnicastListener>>>,
}

impl LocalEndpoint {
    fn network(&self) -> Result<Arc<LocalNetwork>> {
        self.network
            .upgrade()
            .ok_or_else(|| MembershipError::network("local network dropped"))
    }
}

#[async_trait]
impl MessagingService for LocalEndpoint {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn send_and_receive(
        &self,
        to: SocketAddr,
        message_type: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        trace!("{} -> {} request {}", self.address, to, message_type);

        let target = self.network()?.route(self.address, to)?;
        let handler = target
            .handlers
            .get(message_type)
            .map(|handler| handler.value().clone())
            .ok_or_else(|| MembershipError::handler_not_found(message_type))?;

        tokio::time::timeout(timeout, handler.handle(self.address, payload)).await?
    }

    fn register_handler(&self, message_type: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(message_type.to_string(), handler);
    }

    fn unregister_handler(&self, message_type: &str) {
        self.handlers.remove(message_type);
    }
}

impl UnicastService for LocalEndpoint {
    fn unicast(&self, to: SocketAddr, message_type: &str, payload: Vec<u8>) {
        trace!("{} -> {} unicast {}", self.address, to, message_type);

        let target = match self.network().and_then(|network| network.route(self.address, to)) {
            Ok(target) => target,
            Err(_) => return,
        };

        let listeners = target
            .listeners
            .get(message_type)
            .map(|listeners| listeners.value().clone())
            .unwrap_or_default();

        for listener in listeners {
            listener.on_message(self.address, payload.clone());
        }
    }

    fn add_listener(&self, message_type: &str, listener: Arc<dyn UnicastListener>) {
        self.listeners
            .entry(message_type.to_string())
            .or_default()
            .push(listener);
    }

    fn remove_listener(&self, message_type: &str, listener: &Arc<dyn UnicastListener>) {
        if let Some(mut listeners) = self.listeners.get_mut(message_type) {
            listeners.retain(|registered| !same_listener(registered, listener));
        }
    }
}

/// [`BootstrapService`] backed by a [`LocalEndpoint`]
pub struct LocalBootstrap {
    endpoint: Arc<LocalEndpoint>,
}

impl LocalBootstrap {
    pub fn address(&self) -> SocketAddr {
        self.endpoint.address
    }
}

impl BootstrapService for LocalBootstrap {
    fn messaging_service(&self) -> Arc<dyn MessagingService> {
        self.endpoint.clone()
    }

    fn unicast_service(&self) -> Arc<dyn UnicastService> {
        self.endpoint.clone()
    }
}
