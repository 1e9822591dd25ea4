//! One gossip topic: subscription reconciliation, inbound decoding and
//! outbound publishing.

use crate::config;
use crate::debug::DebugDataDumper;
use crate::error::{GossipError, Result};
use crate::metrics::GossipMetrics;
use crate::overlay::{DiscoveryNetwork, OperationProcessor, TopicHandler, ValidationResult};
use crate::types::{GossipPayload, MessageClass, SubnetId};
use futures::future::{self, BoxFuture, FutureExt};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// Everything a topic needs from the node, shared by all managers of a fork.
#[derive(Clone)]
pub struct GossipContext {
    pub runtime: Handle,
    pub network: Arc<dyn DiscoveryNetwork>,
    pub metrics: GossipMetrics,
    pub debug_dumper: Arc<dyn DebugDataDumper>,
    pub settings: config::Gossip,
}

#[derive(Debug, Clone, Copy)]
struct Desired {
    subscribed: bool,
    generation: u64,
}

/// A single topic whose subscription converges on the last requested state.
///
/// Requests only record the wanted state and schedule a reconcile task.
/// Reconcile tasks run one at a time and always apply the newest request,
/// so an unsubscribe issued while a subscribe is in flight wins.
pub struct GossipChannel {
    class: MessageClass,
    topic: String,
    handler: Arc<dyn TopicHandler>,
    ctx: GossipContext,
    desired: Mutex<Desired>,
    applied: AsyncMutex<bool>,
    subscribed: AtomicBool,
    settled: watch::Sender<u64>,
}

impl GossipChannel {
    pub fn new(
        class: MessageClass,
        topic: String,
        handler: Arc<dyn TopicHandler>,
        ctx: GossipContext,
    ) -> Arc<Self> {
        let (settled, _) = watch::channel(0);
        Arc::new(Self {
            class,
            topic,
            handler,
            ctx,
            desired: Mutex::new(Desired { subscribed: false, generation: 0 }),
            applied: AsyncMutex::new(false),
            subscribed: AtomicBool::new(false),
            settled,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe(self: &Arc<Self>) {
        self.request(true);
    }

    pub fn unsubscribe(self: &Arc<Self>) {
        self.request(false);
    }

    /// Last state the network confirmed.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub fn is_requested(&self) -> bool {
        self.desired.lock().unwrap_or_else(PoisonError::into_inner).subscribed
    }

    /// Resolves once every request made before the call has been applied.
    pub async fn settled(&self) {
        let target = self.desired.lock().unwrap_or_else(PoisonError::into_inner).generation;
        let mut rx = self.settled.subscribe();
        let _ = rx.wait_for(|applied| *applied >= target).await;
    }

    fn request(self: &Arc<Self>, subscribed: bool) {
        let generation = {
            let mut desired = self.desired.lock().unwrap_or_else(PoisonError::into_inner);
            desired.subscribed = subscribed;
            desired.generation += 1;
            desired.generation
        };
        let this = Arc::clone(self);
        debug!(topic = %self.topic, subscribed, generation, "Gossip subscription requested");
        self.ctx.runtime.spawn(async move { this.reconcile().await });
    }

    async fn reconcile(&self) {
        let mut applied = self.applied.lock().await;
        let want = *self.desired.lock().unwrap_or_else(PoisonError::into_inner);
        if want.subscribed != *applied {
            let result = if want.subscribed {
                self.ctx.network.subscribe(&self.topic, Arc::clone(&self.handler)).await
            } else {
                self.ctx.network.unsubscribe(&self.topic).await
            };
            match result {
                Ok(()) => {
                    *applied = want.subscribed;
                    self.subscribed.store(want.subscribed, Ordering::Release);
                    debug!(topic = %self.topic, subscribed = want.subscribed, "Gossip topic updated");
                }
                Err(e) => {
                    self.ctx.metrics.subscribe_failures.with_label_values(&[self.class.as_str()]).inc();
                    warn!(topic = %self.topic, subscribe = want.subscribed, error = %e, "Failed to update gossip subscription");
                }
            }
        }

        self.settled.send_if_modified(|done| {
            if want.generation > *done {
                *done = want.generation;
                true
            } else {
                false
            }
        });
    }

    /// Queues `payload` on the topic now and reports the outcome through the
    /// returned future. The publish completes even if the future is dropped.
    pub fn publish(&self, payload: Vec<u8>) -> BoxFuture<'static, Result<()>> {
        let limit = self.ctx.settings.max_message_size;
        if payload.len() > limit {
            self.ctx.metrics.publish_failures.with_label_values(&[self.class.as_str()]).inc();
            warn!(topic = %self.topic, size = payload.len(), limit, "Refusing to publish oversized gossip message");
            return future::ready(Err(GossipError::MessageTooLarge { size: payload.len(), limit })).boxed();
        }

        let outcome = self.ctx.network.publish(&self.topic, payload);
        let metrics = self.ctx.metrics.clone();
        let class = self.class;
        let topic = self.topic.clone();
        let task = self.ctx.runtime.spawn(async move {
            let result = outcome.await;
            match &result {
                Ok(()) => metrics.published.with_label_values(&[class.as_str()]).inc(),
                Err(e) => {
                    metrics.publish_failures.with_label_values(&[class.as_str()]).inc();
                    warn!(%topic, error = %e, "Failed to publish gossip message");
                }
            }
            result
        });
        async move { task.await.map_err(|_| GossipError::Shutdown).and_then(|result| result) }.boxed()
    }
}

/// Decodes payloads of one topic and hands them to the class processor.
pub struct PayloadHandler<T: GossipPayload> {
    topic: String,
    subnet_id: Option<SubnetId>,
    processor: Arc<dyn OperationProcessor<T::Operation>>,
    debug_dumper: Arc<dyn DebugDataDumper>,
    metrics: GossipMetrics,
    _payload: PhantomData<fn() -> T>,
}

impl<T: GossipPayload> PayloadHandler<T> {
    pub fn new(
        topic: String,
        subnet_id: Option<SubnetId>,
        processor: Arc<dyn OperationProcessor<T::Operation>>,
        ctx: &GossipContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic,
            subnet_id,
            processor,
            debug_dumper: Arc::clone(&ctx.debug_dumper),
            metrics: ctx.metrics.clone(),
            _payload: PhantomData,
        })
    }
}

fn record_inbound(metrics: &GossipMetrics, class: MessageClass, result: ValidationResult) {
    let label = match result {
        ValidationResult::Accept => "accept",
        ValidationResult::Ignore => "ignore",
        ValidationResult::Reject => "reject",
    };
    metrics.inbound.with_label_values(&[class.as_str(), label]).inc();
}

impl<T: GossipPayload> TopicHandler for PayloadHandler<T> {
    /// Returns immediately; decoding, processing and any dump happen when
    /// the overlay polls the future.
    fn handle_message(&self, payload: Vec<u8>) -> BoxFuture<'static, ValidationResult> {
        let topic = self.topic.clone();
        let subnet_id = self.subnet_id;
        let processor = Arc::clone(&self.processor);
        let dumper = Arc::clone(&self.debug_dumper);
        let metrics = self.metrics.clone();
        async move {
            let result = match T::decode(&topic, &payload) {
                Ok(message) => {
                    let result = processor.process(message.into_operation(subnet_id)).await;
                    if result == ValidationResult::Reject {
                        dumper.save_gossip_rejected(T::CLASS, &topic, &payload, "rejected by processor");
                    }
                    result
                }
                Err(e) => {
                    debug!(%topic, error = %e, "Rejecting undecodable gossip message");
                    dumper.save_gossip_rejected(T::CLASS, &topic, &payload, &e.to_string());
                    ValidationResult::Reject
                }
            };
            record_inbound(&metrics, T::CLASS, result);
            result
        }
        .boxed()
    }
}
