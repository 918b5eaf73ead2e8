use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::DlqConfig;
use crate::dlq::DlqStore;
use crate::telemetry::metric_inc;
use crate::types::DlqItem;

/// Exponential backoff between failed retries.
///
/// Each failure doubles the delay, clamped to `[floor, ceiling]`; a success
/// resets it to the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let floor = floor.max(Duration::from_millis(1));
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn from_config(config: &DlqConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_floor_ms),
            Duration::from_millis(config.backoff_ceiling_ms),
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Register a failure and return the delay to wait before requeueing.
    pub fn fail(&mut self) -> Duration {
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.ceiling)
            .clamp(self.floor, self.ceiling);
        self.current
    }

    /// Delay after `failures` consecutive failures: `min(floor * 2^failures, ceiling)`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.floor
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

/// Counters exposed by a running consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub parked: u64,
}

#[derive(Default)]
struct SharedState {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    parked: AtomicU64,
    backoff_ms: AtomicU64,
}

impl SharedState {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.processed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            parked: self.parked.load(Ordering::SeqCst),
        }
    }
}

/// Background retry loop draining a dead-letter queue into the event bus.
///
/// One consumer per queue. The loop only suspends on the queue pop and on
/// the backoff sleep, and both end promptly on shutdown.
pub struct DlqConsumer {
    config: DlqConfig,
    dlq: Arc<dyn DlqStore>,
    bus: Arc<dyn EventBus>,
    parked: Option<Arc<dyn DlqStore>>,
    backoff: Backoff,
    shared: Arc<SharedState>,
}

impl DlqConsumer {
    pub fn new(config: DlqConfig, dlq: Arc<dyn DlqStore>, bus: Arc<dyn EventBus>) -> Self {
        let backoff = Backoff::from_config(&config);
        let shared = Arc::new(SharedState::default());
        shared
            .backoff_ms
            .store(backoff.current().as_millis() as u64, Ordering::SeqCst);
        Self {
            config,
            dlq,
            bus,
            parked: None,
            backoff,
            shared,
        }
    }

    /// Where items go once they reach `max_attempts`.
    ///
    /// Without a park store, capped items are dropped with an error log.
    pub fn with_park_store(mut self, parked: Arc<dyn DlqStore>) -> Self {
        self.parked = Some(parked);
        self
    }

    /// Run the loop on the tokio runtime.
    pub fn spawn(self) -> ConsumerHandle {
        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let join = tokio::spawn(self.run(token.clone()));
        ConsumerHandle {
            token,
            shared,
            join,
        }
    }

    /// Consume until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        info!(topic = %self.config.topic, "dlq consumer started");

        loop {
            let popped = tokio::select! {
                _ = token.cancelled() => break,
                popped = self.dlq.pop(self.config.pop_timeout()) => popped,
            };

            match popped {
                Ok(Some(item)) => self.retry(item, &token).await,
                Ok(None) => self.idle(&token).await,
                Err(err) => {
                    warn!(error = %err, "dlq pop failed");
                    self.idle(&token).await;
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        info!("dlq consumer stopped");
    }

    async fn idle(&self, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = sleep(self.config.idle_delay()) => {}
        }
    }

    async fn retry(&mut self, mut item: DlqItem, token: &CancellationToken) {
        self.shared.processed.fetch_add(1, Ordering::SeqCst);
        let document = item.event.to_document();

        match self.bus.publish(&self.config.topic, &document).await {
            Ok(message_id) => {
                self.backoff.reset();
                self.store_backoff();
                self.shared.succeeded.fetch_add(1, Ordering::SeqCst);
                metric_inc("ingest.dlq.retry.success");
                info!(
                    event_id = %item.event.id,
                    attempts = item.attempts,
                    message_id = %message_id,
                    "dead-lettered event republished"
                );
            }
            Err(err) => {
                let delay = self.backoff.fail();
                self.store_backoff();
                self.shared.failed.fetch_add(1, Ordering::SeqCst);
                metric_inc("ingest.dlq.retry.failure");
                warn!(
                    event_id = %item.event.id,
                    attempts = item.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "republish failed, backing off"
                );

                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(event_id = %item.event.id, "backoff interrupted by shutdown");
                    }
                    _ = sleep(delay) => {}
                }

                item.record_failure(err.to_string());
                self.requeue(item).await;
            }
        }
    }

    async fn requeue(&self, item: DlqItem) {
        let capped = self
            .config
            .max_attempts
            .is_some_and(|max| item.attempts >= max);

        if !capped {
            if let Err(err) = self.dlq.push(&item).await {
                error!(event_id = %item.event.id, error = %err, "requeue failed, event dropped");
            }
            return;
        }

        self.shared.parked.fetch_add(1, Ordering::SeqCst);
        metric_inc("ingest.dlq.parked");
        match &self.parked {
            Some(parked) => {
                warn!(event_id = %item.event.id, attempts = item.attempts, "retry cap reached, parking event");
                if let Err(err) = parked.push(&item).await {
                    error!(event_id = %item.event.id, error = %err, "park failed, event dropped");
                }
            }
            None => {
                error!(event_id = %item.event.id, attempts = item.attempts, "retry cap reached, event dropped");
            }
        }
    }

    fn store_backoff(&self) {
        self.shared
            .backoff_ms
            .store(self.backoff.current().as_millis() as u64, Ordering::SeqCst);
    }
}

/// Handle to a spawned [`DlqConsumer`].
pub struct ConsumerHandle {
    token: CancellationToken,
    shared: Arc<SharedState>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> ConsumerStats {
        self.shared.snapshot()
    }

    /// The floor after a success, otherwise the delay used for the most
    /// recent failure.
    pub fn current_backoff(&self) -> Duration {
        Duration::from_millis(self.shared.backoff_ms.load(Ordering::SeqCst))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "dlq consumer task panicked");
        }
    }
}
