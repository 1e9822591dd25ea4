//! Seams to the peer overlay and to the message processors behind each topic.

use crate::error::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Outcome of validating an inbound gossip message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// Valid, forward to the mesh.
    Accept,
    /// Not forwarded, no penalty for the sender.
    Ignore,
    /// Invalid, penalise the sender.
    Reject,
}

/// Receives raw payloads for one subscribed topic.
pub trait TopicHandler: Send + Sync {
    fn handle_message(&self, payload: Vec<u8>) -> BoxFuture<'static, ValidationResult>;
}

/// Pub/sub capability of the discovery network.
///
/// Every call takes effect in call order: the returned future only reports
/// the outcome, so publishes to one topic reach the wire in the order they
/// were issued.
pub trait DiscoveryNetwork: Send + Sync + 'static {
    fn subscribe(&self, topic: &str, handler: Arc<dyn TopicHandler>) -> BoxFuture<'static, Result<()>>;

    fn unsubscribe(&self, topic: &str) -> BoxFuture<'static, Result<()>>;

    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'static, Result<()>>;
}

/// Validates and applies decoded messages of one class.
pub trait OperationProcessor<T>: Send + Sync {
    fn process(&self, message: T) -> BoxFuture<'static, ValidationResult>;
}
