use crate::types::Epoch;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GossipError {
    /// Chain state needed to derive the fork digest is not available yet.
    #[error("chain state unavailable: {0}")]
    ChainUnavailable(String),

    #[error("no fork scheduled at epoch {0}")]
    UnknownFork(Epoch),

    #[error("subnet id {id} out of range (subnet count {count})")]
    InvalidSubnet { id: u64, count: u64 },

    #[error("gossip has not been started for this fork")]
    NotStarted,

    /// The topic's manager is stopped, fully or for optimistic sync.
    #[error("gossip topic {topic} is not subscribed")]
    TopicInactive { topic: String },

    #[error("failed to encode {context}: {reason}")]
    Encode { context: &'static str, reason: String },

    #[error("failed to decode message on {topic}: {reason}")]
    Decode { topic: String, reason: String },

    #[error("message of {size} bytes exceeds the {limit} byte gossip limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("transport error on {topic}: {reason}")]
    Transport { topic: String, reason: String },

    /// The overlay network task is gone.
    #[error("network shut down")]
    Shutdown,
}

impl GossipError {
    pub fn transport(topic: &str, reason: impl ToString) -> Self {
        GossipError::Transport { topic: topic.to_string(), reason: reason.to_string() }
    }
}

pub type Result<T, E = GossipError> = std::result::Result<T, E>;
