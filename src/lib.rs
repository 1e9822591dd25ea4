// Library interface for the fork-scoped gossip controller
// The `gossipd` binary and the integration tests build on these modules.

pub mod config;
pub mod error;
pub mod types;
pub mod fork;
pub mod topics;
pub mod overlay;
pub mod debug;
pub mod metrics;
pub mod channel;
pub mod manager;
pub mod attestation;
pub mod controller;
pub mod network;

pub use channel::GossipContext;
pub use controller::{GossipForkSubscriptions, OperationProcessors};
pub use error::GossipError;
pub use fork::{ChainView, ForkSchedule, compute_fork_digest};
pub use manager::GossipManager;
pub use overlay::{DiscoveryNetwork, OperationProcessor, TopicHandler, ValidationResult};
pub use types::{Fork, ForkDigest, MessageClass, SubnetId, ValidatableAttestation};
