//! In-process event bus with a rate-limited ingress queue.
//!
//! Producers enqueue without blocking; a single worker drains the queue in
//! FIFO order and fans each message out to the subscribers of its kind.
//! Every subscriber owns a bounded buffer, so a slow reader only loses its
//! own messages once its buffer stays full past the publish timeout.

use super::message::{Message, MessageKind};
use crate::config::BusConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Topic-based publish/subscribe bus.
pub struct Broker {
    ingress: mpsc::UnboundedSender<Message>,
    registry: Arc<Registry>,
    stats: Arc<BrokerStats>,
    subscriber_buffer: usize,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Default)]
struct BrokerStats {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of the bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    /// Messages accepted by [`Broker::enqueue`].
    pub enqueued: u64,
    /// Per-subscriber deliveries.
    pub dispatched: u64,
    /// Per-subscriber deliveries abandoned on a full buffer, plus messages
    /// enqueued after the worker stopped.
    pub dropped: u64,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    topics: Mutex<HashMap<MessageKind, Vec<Subscriber>>>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Message>,
}

impl Registry {
    fn attach(&self, kind: MessageKind, buffer: usize) -> (u64, mpsc::Receiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer);
        self.topics
            .lock()
            .entry(kind)
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    fn detach(&self, kind: MessageKind, id: u64) {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(&kind) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                topics.remove(&kind);
            }
        }
    }

    fn senders(&self, kind: MessageKind) -> Vec<(u64, mpsc::Sender<Message>)> {
        self.topics
            .lock()
            .get(&kind)
            .map(|subs| subs.iter().map(|s| (s.id, s.tx.clone())).collect())
            .unwrap_or_default()
    }

    fn count(&self, kind: MessageKind) -> usize {
        self.topics.lock().get(&kind).map_or(0, Vec::len)
    }
}

/// Receiving end of a subscription. Dropping it detaches from the bus.
pub struct Subscription {
    id: u64,
    kind: MessageKind,
    rx: mpsc::Receiver<Message>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Topic of this subscription.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Next message, or `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Next buffered message without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Broker {
    /// Create the bus and spawn its ingress worker. The worker exits when
    /// `shutdown` is cancelled.
    pub fn start(config: &BusConfig, shutdown: CancellationToken) -> Arc<Self> {
        let (ingress, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::default());
        let stats = Arc::new(BrokerStats::default());

        let worker = IngressWorker {
            rx,
            registry: Arc::clone(&registry),
            stats: Arc::clone(&stats),
            limiter: RateLimiter::new(config),
            publish_timeout: config.publish_timeout(),
        };
        tokio::spawn(worker.run(shutdown));

        tracing::info!(
            buffer = config.subscriber_buffer,
            rate = config.rate_limit,
            burst = config.burst,
            "Event bus started"
        );

        Arc::new(Self {
            ingress,
            registry,
            stats,
            subscriber_buffer: config.subscriber_buffer,
        })
    }

    /// Append a message to the ingress queue. Never blocks.
    pub fn enqueue(&self, msg: Message) {
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.ingress.send(msg) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kind = %err.0.kind, "Event bus stopped, message discarded");
        }
    }

    /// Receive every message of `kind` published from now on.
    pub fn subscribe(&self, kind: MessageKind) -> Subscription {
        let (id, rx) = self.registry.attach(kind, self.subscriber_buffer);
        tracing::debug!(kind = %kind, subscriber = id, "Subscribed");
        Subscription {
            id,
            kind,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Detach a subscription and discard whatever it still buffers.
    pub fn unsubscribe(&self, mut subscription: Subscription) {
        self.registry.detach(subscription.kind, subscription.id);
        subscription.rx.close();
        while subscription.rx.try_recv().is_ok() {}
        tracing::debug!(
            kind = %subscription.kind,
            subscriber = subscription.id,
            "Unsubscribed"
        );
    }

    /// Number of live subscribers of `kind`.
    pub fn subscriber_count(&self, kind: MessageKind) -> usize {
        self.registry.count(kind)
    }

    /// Current counters.
    pub fn stats(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

struct IngressWorker {
    rx: mpsc::UnboundedReceiver<Message>,
    registry: Arc<Registry>,
    stats: Arc<BrokerStats>,
    limiter: RateLimiter,
    publish_timeout: Duration,
}

impl IngressWorker {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.limiter.acquire() => {}
            }

            self.publish(msg).await;
        }
        tracing::info!("Event bus worker stopped");
    }

    async fn publish(&self, msg: Message) {
        let kind = msg.kind;
        for (id, tx) in self.registry.senders(kind) {
            match tx.send_timeout(msg.clone(), self.publish_timeout).await {
                Ok(()) => {
                    self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        kind = %kind,
                        subscriber = id,
                        "Subscriber buffer full, message dropped"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => {
                    self.registry.detach(kind, id);
                }
            }
        }
    }
}

/// Token bucket guarding the ingress worker. While the bucket is empty the
/// worker backs off exponentially, starting again from the base delay after
/// the next successful acquisition.
struct RateLimiter {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
    base: Duration,
    max: Duration,
    throttled: u32,
}

impl RateLimiter {
    fn new(config: &BusConfig) -> Self {
        let (base, max) = config.backoff_bounds();
        let burst = f64::from(config.burst);
        Self {
            rate: config.rate_limit,
            burst,
            tokens: burst,
            last: Instant::now(),
            base,
            max,
            throttled: 0,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.throttled = 0;
            true
        } else {
            false
        }
    }

    fn next_backoff(&mut self) -> Duration {
        let exponent = self.throttled.min(31);
        self.throttled = self.throttled.saturating_add(1);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    async fn acquire(&mut self) {
        while !self.try_acquire(Instant::now()) {
            let delay = self.next_backoff();
            tracing::debug!(?delay, "Event bus throttled");
            tokio::time::sleep(delay).await;
        }
    }
}
