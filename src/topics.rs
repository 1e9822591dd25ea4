//! Gossip topic names: `/<prefix>/<fork-digest>/<name>/<encoding>`.

use crate::types::{ForkDigest, MessageClass, SubnetId};
use serde::Deserialize;
use std::fmt;

pub const DEFAULT_TOPIC_PREFIX: &str = "eth2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipEncoding {
    #[default]
    SszSnappy,
}

impl GossipEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            GossipEncoding::SszSnappy => "ssz_snappy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssz_snappy" => Some(GossipEncoding::SszSnappy),
            _ => None,
        }
    }
}

/// Which channel of a fork a topic addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Class(MessageClass),
    AttestationSubnet(SubnetId),
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKind::Class(class) => f.write_str(class.as_str()),
            TopicKind::AttestationSubnet(id) => write!(f, "{}_{}", MessageClass::Attestation, id),
        }
    }
}

/// Builds topic names for one fork digest.
#[derive(Debug, Clone)]
pub struct TopicNamer {
    prefix: String,
    fork_digest: ForkDigest,
    encoding: GossipEncoding,
}

impl TopicNamer {
    pub fn new(prefix: impl Into<String>, fork_digest: ForkDigest, encoding: GossipEncoding) -> Self {
        Self { prefix: prefix.into(), fork_digest, encoding }
    }

    pub fn fork_digest(&self) -> ForkDigest {
        self.fork_digest
    }

    pub fn topic(&self, kind: TopicKind) -> String {
        format!("/{}/{}/{}/{}", self.prefix, self.fork_digest, kind, self.encoding.name())
    }

    pub fn class_topic(&self, class: MessageClass) -> String {
        self.topic(TopicKind::Class(class))
    }

    pub fn subnet_topic(&self, subnet_id: SubnetId) -> String {
        self.topic(TopicKind::AttestationSubnet(subnet_id))
    }
}

/// Splits a topic name back into digest and kind. Returns `None` for topics
/// outside `prefix` or with an unknown name.
pub fn parse_topic(prefix: &str, topic: &str, subnet_count: u64) -> Option<(ForkDigest, TopicKind)> {
    let mut parts = topic.strip_prefix('/')?.split('/');
    if parts.next()? != prefix {
        return None;
    }
    let digest = parts.next()?.parse::<ForkDigest>().ok()?;
    let name = parts.next()?;
    GossipEncoding::from_name(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }

    let subnet_prefix = format!("{}_", MessageClass::Attestation);
    if let Some(index) = name.strip_prefix(&subnet_prefix) {
        let id = SubnetId::new(index.parse().ok()?, subnet_count).ok()?;
        return Some((digest, TopicKind::AttestationSubnet(id)));
    }
    let class = MessageClass::ALL
        .into_iter()
        .filter(|c| *c != MessageClass::Attestation)
        .find(|c| c.as_str() == name)?;
    Some((digest, TopicKind::Class(class)))
}
