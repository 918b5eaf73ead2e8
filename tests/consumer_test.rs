use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use device_webhook_ingest::{
    Backoff, DlqConfig, DlqConsumer, DlqItem, DlqStore, Event, EventBus, InMemoryDlq,
    PublishError, StoreError,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Bus that follows a script of outcomes, then succeeds forever.
struct ScriptedBus {
    script: Mutex<VecDeque<bool>>,
    calls: Mutex<Vec<(Instant, String, bool)>>,
}

impl ScriptedBus {
    fn new(script: &[bool]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn calls(&self) -> Vec<(Instant, String, bool)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl EventBus for ScriptedBus {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<String, PublishError> {
        let ok = self.script.lock().await.pop_front().unwrap_or(true);
        let id = payload["id"].as_str().unwrap_or_default().to_string();
        self.calls.lock().await.push((Instant::now(), id, ok));
        if ok {
            Ok("msg".to_string())
        } else {
            Err(PublishError::Rejected {
                topic: topic.to_string(),
                reason: "scripted failure".to_string(),
            })
        }
    }
}

/// DLQ wrapper remembering the attempts of every pushed item.
struct RecordingDlq {
    inner: InMemoryDlq,
    pushed_attempts: Mutex<Vec<(String, u32)>>,
}

impl RecordingDlq {
    fn new() -> Self {
        Self {
            inner: InMemoryDlq::new(100),
            pushed_attempts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DlqStore for RecordingDlq {
    async fn push(&self, item: &DlqItem) -> Result<(), StoreError> {
        self.pushed_attempts
            .lock()
            .await
            .push((item.event.id.0.clone(), item.attempts));
        self.inner.push(item).await
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<DlqItem>, StoreError> {
        self.inner.pop(timeout).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }

    async fn snapshot(&self) -> Result<Vec<DlqItem>, StoreError> {
        self.inner.snapshot().await
    }
}

fn item(id: &str) -> DlqItem {
    DlqItem::new(Event::new(id, "DEVICE_EVENT", json!({ "eventId": id })), "initial failure")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[test]
fn backoff_doubles_from_floor_to_ceiling() {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
    assert_eq!(backoff.current(), Duration::from_secs(1));

    let delays: Vec<u64> = (0..7).map(|_| backoff.fail().as_secs()).collect();
    assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);

    backoff.reset();
    assert_eq!(backoff.current(), Duration::from_secs(1));
    assert_eq!(backoff.fail(), Duration::from_secs(2));
}

#[test]
fn delay_after_k_failures_matches_the_closed_form() {
    let config = DlqConfig::default();
    let mut backoff = Backoff::from_config(&config);

    for k in 1..12u32 {
        let expected = Duration::from_secs((1u64 << k).min(30));
        assert_eq!(backoff.fail(), expected, "after {k} failures");
        assert_eq!(backoff.delay_after(k), expected);
    }
    assert_eq!(backoff.delay_after(0), Duration::from_secs(1));
    assert_eq!(backoff.delay_after(200), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn retries_with_backoff_until_success_then_resets() {
    let dlq = Arc::new(RecordingDlq::new());
    let bus = Arc::new(ScriptedBus::new(&[false, false, true, false, true]));

    dlq.inner.push(&item("A")).await.unwrap();

    let handle = DlqConsumer::new(DlqConfig::default(), dlq.clone(), bus.clone()).spawn();

    wait_until(|| handle.stats().succeeded == 1).await;
    assert_eq!(handle.current_backoff(), Duration::from_secs(1));

    let requeued = dlq.pushed_attempts.lock().await.clone();
    assert_eq!(
        requeued,
        vec![("A".to_string(), 1), ("A".to_string(), 2)],
        "attempts reach 2 before the successful retry"
    );

    let calls = bus.calls().await;
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(2));
    assert_eq!(calls[2].0 - calls[1].0, Duration::from_secs(4));

    // An unrelated item after the success starts again from the floor.
    dlq.push(&item("B")).await.unwrap();
    wait_until(|| handle.stats().succeeded == 2).await;

    let calls = bus.calls().await;
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[3].1, "B");
    assert_eq!(calls[4].0 - calls[3].0, Duration::from_secs(2));

    let stats = handle.stats();
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.parked, 0);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn capped_items_are_parked() {
    let dlq = Arc::new(InMemoryDlq::new(10));
    let parked = Arc::new(InMemoryDlq::new(10));
    let bus = Arc::new(ScriptedBus::new(&[false; 10]));

    dlq.push(&item("doomed")).await.unwrap();

    let config = DlqConfig::default().with_max_attempts(3);
    let handle = DlqConsumer::new(config, dlq.clone(), bus.clone())
        .with_park_store(parked.clone())
        .spawn();

    wait_until(|| handle.stats().parked == 1).await;

    let parked_items = parked.snapshot().await.unwrap();
    assert_eq!(parked_items.len(), 1);
    assert_eq!(parked_items[0].attempts, 3);
    assert_eq!(dlq.len().await.unwrap(), 0);
    assert_eq!(bus.calls().await.len(), 3);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn republishes_to_the_configured_topic() {
    let dlq = Arc::new(InMemoryDlq::new(10));
    let bus = Arc::new(device_webhook_ingest::InMemoryEventBus::new());

    dlq.push(&item("A")).await.unwrap();
    let handle = DlqConsumer::new(
        DlqConfig::default().with_topic("retry.topic"),
        dlq.clone(),
        bus.clone(),
    )
    .spawn();

    wait_until(|| handle.stats().succeeded == 1).await;
    let published = bus.published_on("retry.topic").await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload["id"], "A");
    assert_eq!(published[0].payload["type"], "DEVICE_EVENT");

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_an_idle_pop() {
    let dlq = Arc::new(InMemoryDlq::new(10));
    let bus = Arc::new(ScriptedBus::new(&[]));
    let handle = DlqConsumer::new(DlqConfig::default(), dlq, bus).spawn();

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(!handle.is_finished());

    let started = Instant::now();
    handle.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_keeps_the_item() {
    let dlq = Arc::new(InMemoryDlq::new(10));
    let bus = Arc::new(ScriptedBus::new(&[false]));
    dlq.push(&item("A")).await.unwrap();

    let handle = DlqConsumer::new(DlqConfig::default(), dlq.clone(), bus.clone()).spawn();
    wait_until(|| handle.stats().failed == 1).await;

    handle.shutdown().await;

    let remaining = dlq.snapshot().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].attempts, 1);
}

/// DLQ whose first pops fail before it starts answering normally.
struct BrokenPops {
    inner: InMemoryDlq,
    failures_left: Mutex<u32>,
    pop_errors: Mutex<u32>,
}

#[async_trait]
impl DlqStore for BrokenPops {
    async fn push(&self, item: &DlqItem) -> Result<(), StoreError> {
        self.inner.push(item).await
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<DlqItem>, StoreError> {
        {
            let mut left = self.failures_left.lock().await;
            if *left > 0 {
                *left -= 1;
                *self.pop_errors.lock().await += 1;
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
        }
        self.inner.pop(timeout).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }

    async fn snapshot(&self) -> Result<Vec<DlqItem>, StoreError> {
        self.inner.snapshot().await
    }
}

#[tokio::test(start_paused = true)]
async fn pop_errors_idle_and_the_loop_keeps_going() {
    let dlq = Arc::new(BrokenPops {
        inner: InMemoryDlq::new(10),
        failures_left: Mutex::new(3),
        pop_errors: Mutex::new(0),
    });
    dlq.push(&item("A")).await.unwrap();
    let bus = Arc::new(ScriptedBus::new(&[]));

    let config = DlqConfig::default();
    let idle = config.idle_delay();
    let started = Instant::now();
    let handle = DlqConsumer::new(config, dlq.clone(), bus.clone()).spawn();

    wait_until(|| handle.stats().succeeded == 1).await;

    assert_eq!(*dlq.pop_errors.lock().await, 3);
    let calls = bus.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "A");
    // One idle pause per failed pop before the item is reached.
    assert!(calls[0].0 - started >= idle * 3);
    assert_eq!(handle.stats().failed, 0);
    assert!(!handle.is_finished());

    handle.shutdown().await;
}
