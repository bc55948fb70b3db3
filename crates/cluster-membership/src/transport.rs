//! Transport abstractions consumed by the membership protocols
//!
//! The protocols only need a request/response messaging facility and a
//! best-effort unicast facility. Framing, retries and connection handling
//! belong to the implementations.

use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Handles a request and produces the reply payload
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, from: SocketAddr, payload: Vec<u8>) -> Result<Vec<u8>>;
}

/// Receives fire-and-forget messages
pub trait UnicastListener: Send + Sync {
    fn on_message(&self, from: SocketAddr, payload: Vec<u8>);
}

/// Point-to-point request/response messaging
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Address this service is reachable at
    fn address(&self) -> SocketAddr;

    /// Send a request and wait at most `timeout` for the reply
    async fn send_and_receive(
        &self,
        to: SocketAddr,
        message_type: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    fn register_handler(&self, message_type: &str, handler: Arc<dyn MessageHandler>);

    fn unregister_handler(&self, message_type: &str);
}

/// Best-effort, unordered, fire-and-forget messaging
pub trait UnicastService: Send + Sync {
    fn unicast(&self, to: SocketAddr, message_type: &str, payload: Vec<u8>);

    fn add_listener(&self, message_type: &str, listener: Arc<dyn UnicastListener>);

    fn remove_listener(&self, message_type: &str, listener: &Arc<dyn UnicastListener>);
}

/// Bundle of transport services handed to a protocol at join
pub trait BootstrapService: Send + Sync {
    fn messaging_service(&self) -> Arc<dyn MessagingService>;

    fn unicast_service(&self) -> Arc<dyn UnicastService>;
}

/// Identity comparison for listener trait objects
pub(crate) fn same_listener(a: &Arc<dyn UnicastListener>, b: &Arc<dyn UnicastListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
