//! libp2p gossipsub implementation of [`DiscoveryNetwork`].

use crate::{
    config,
    error::{GossipError, Result},
    overlay::{DiscoveryNetwork, TopicHandler, ValidationResult},
    topics::parse_topic,
};
use futures::future::{BoxFuture, FutureExt};
use libp2p::{
    core::muxing::StreamMuxerBox, futures::StreamExt, gossipsub, identity, quic, swarm::SwarmEvent,
    Multiaddr, PeerId, Swarm, Transport,
};
use libp2p::gossipsub::{
    AllowAllSubscriptionFilter, Behaviour as Gossipsub, Event as GossipsubEvent, IdentTopic,
    IdentityTransform, MessageAcceptance, MessageAuthenticity, MessageId, TopicHash,
};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Responder = oneshot::Sender<Result<()>>;

enum NetworkCommand {
    Subscribe { topic: String, handler: Arc<dyn TopicHandler>, respond: Responder },
    Unsubscribe { topic: String, respond: Responder },
    Publish { topic: String, data: Vec<u8>, respond: Responder },
}

struct Validated {
    message_id: MessageId,
    source: PeerId,
    result: ValidationResult,
}

/// Handle to the swarm task. Dropping every handle stops the task.
#[derive(Clone)]
pub struct GossipsubNetwork {
    local_peer_id: PeerId,
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
}

pub fn load_or_create_peer_identity<P: AsRef<Path>>(path: P) -> anyhow::Result<identity::Keypair> {
    let path = path.as_ref();
    if path.exists() {
        let key_data = fs::read(path)?;
        return Ok(identity::Keypair::from_protobuf_encoding(&key_data)?);
    }
    let keypair = identity::Keypair::generate_ed25519();
    fs::write(path, keypair.to_protobuf_encoding()?)?;
    Ok(keypair)
}

fn acceptance(result: ValidationResult) -> MessageAcceptance {
    match result {
        ValidationResult::Accept => MessageAcceptance::Accept,
        ValidationResult::Ignore => MessageAcceptance::Ignore,
        ValidationResult::Reject => MessageAcceptance::Reject,
    }
}

pub async fn spawn(
    net_cfg: config::Net,
    gossip_cfg: config::Gossip,
    id_keys: identity::Keypair,
) -> anyhow::Result<Arc<GossipsubNetwork>> {
    let peer_id = PeerId::from(id_keys.public());
    info!(%peer_id, "Local peer ID");

    let transport = quic::tokio::Transport::new(quic::Config::new(&id_keys))
        .map(|(peer_id, muxer), _| (peer_id, StreamMuxerBox::new(muxer)))
        .boxed();

    // Messages are only forwarded once the topic's processor has ruled on them.
    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(std::time::Duration::from_millis(700))
        .validation_mode(gossipsub::ValidationMode::Anonymous)
        .validate_messages()
        .max_transmit_size(gossip_cfg.max_message_size)
        .build()?;

    let gs: Gossipsub<IdentityTransform, AllowAllSubscriptionFilter> =
        Gossipsub::new(MessageAuthenticity::Anonymous, gossipsub_config).map_err(|e| anyhow::anyhow!(e))?;

    let mut swarm = Swarm::new(
        transport,
        gs,
        peer_id,
        libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(std::time::Duration::from_secs(60)),
    );

    let mut port = net_cfg.listen_port;
    loop {
        let listen_addr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", port);
        match swarm.listen_on(listen_addr.parse()?) {
            Ok(_) => break,
            Err(e) if port != 0 && e.to_string().contains("Address already in use") => {
                port += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for addr in &net_cfg.bootstrap {
        match swarm.dial(addr.parse::<Multiaddr>()?) {
            Ok(_) => debug!(%addr, "Bootstrap dial initiated"),
            Err(e) => warn!(%addr, error = %e, "Failed to dial bootstrap node"),
        }
    }

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<NetworkCommand>();
    let (validated_tx, mut validated_rx) = mpsc::unbounded_channel::<Validated>();
    let mut handlers: HashMap<TopicHash, Arc<dyn TopicHandler>> = HashMap::new();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => match event {
                    SwarmEvent::NewListenAddr { address, .. } => info!(%address, "Listening"),
                    SwarmEvent::ConnectionEstablished { peer_id, .. } => debug!(%peer_id, "Connected to peer"),
                    SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                        debug!(%peer_id, ?cause, "Disconnected from peer");
                    }
                    SwarmEvent::Behaviour(GossipsubEvent::Message { propagation_source, message_id, message }) => {
                        let Some(handler) = handlers.get(&message.topic) else {
                            let _ = swarm.behaviour_mut().report_message_validation_result(
                                &message_id,
                                &propagation_source,
                                MessageAcceptance::Ignore,
                            );
                            continue;
                        };
                        let kind = parse_topic(&gossip_cfg.topic_prefix, message.topic.as_str(), gossip_cfg.attestation_subnet_count);
                        debug!(topic = %message.topic, ?kind, from = %propagation_source, "Gossip message received");
                        let processing = handler.handle_message(message.data);
                        let validated_tx = validated_tx.clone();
                        tokio::spawn(async move {
                            let result = processing.await;
                            let _ = validated_tx.send(Validated { message_id, source: propagation_source, result });
                        });
                    }
                    _ => {}
                },
                Some(Validated { message_id, source, result }) = validated_rx.recv() => {
                    let _ = swarm
                        .behaviour_mut()
                        .report_message_validation_result(&message_id, &source, acceptance(result));
                }
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("Gossip network shutting down");
                        break;
                    };
                    match command {
                        NetworkCommand::Subscribe { topic, handler, respond } => {
                            let ident = IdentTopic::new(topic.clone());
                            let result = swarm
                                .behaviour_mut()
                                .subscribe(&ident)
                                .map(|_| {
                                    handlers.insert(ident.hash(), handler);
                                })
                                .map_err(|e| GossipError::transport(&topic, e));
                            let _ = respond.send(result);
                        }
                        NetworkCommand::Unsubscribe { topic, respond } => {
                            let ident = IdentTopic::new(topic.clone());
                            let result = swarm
                                .behaviour_mut()
                                .unsubscribe(&ident)
                                .map(|_| {
                                    handlers.remove(&ident.hash());
                                })
                                .map_err(|e| GossipError::transport(&topic, e));
                            let _ = respond.send(result);
                        }
                        NetworkCommand::Publish { topic, data, respond } => {
                            let result = swarm
                                .behaviour_mut()
                                .publish(IdentTopic::new(topic.clone()), data)
                                .map(|_| ())
                                .map_err(|e| GossipError::transport(&topic, e));
                            let _ = respond.send(result);
                        }
                    }
                }
            }
        }
    });

    Ok(Arc::new(GossipsubNetwork { local_peer_id: peer_id, command_tx }))
}

impl GossipsubNetwork {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn send(&self, command: NetworkCommand, rx: oneshot::Receiver<Result<()>>) -> BoxFuture<'static, Result<()>> {
        // a failed send drops the responder, which resolves `rx` with an error
        let _ = self.command_tx.send(command);
        async move { rx.await.unwrap_or(Err(GossipError::Shutdown)) }.boxed()
    }
}

impl DiscoveryNetwork for GossipsubNetwork {
    fn subscribe(&self, topic: &str, handler: Arc<dyn TopicHandler>) -> BoxFuture<'static, Result<()>> {
        let (respond, rx) = oneshot::channel();
        self.send(NetworkCommand::Subscribe { topic: topic.to_string(), handler, respond }, rx)
    }

    fn unsubscribe(&self, topic: &str) -> BoxFuture<'static, Result<()>> {
        let (respond, rx) = oneshot::channel();
        self.send(NetworkCommand::Unsubscribe { topic: topic.to_string(), respond }, rx)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        let (respond, rx) = oneshot::channel();
        self.send(NetworkCommand::Publish { topic: topic.to_string(), data: payload, respond }, rx)
    }
}
