//! Worker engine tests against the in-memory transport.

use async_trait::async_trait;
use queue_processor::{
    BatchProcessor, EngineState, ItemProcessor, MemoryTransport, PerItem, QueueConfig,
    QueueError, QueueItem, QueueWorker, Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::unique_name;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct FakeData {
    data: Uuid,
}

impl FakeData {
    fn new() -> Self {
        Self {
            data: Uuid::new_v4(),
        }
    }
}

fn test_config() -> QueueConfig {
    QueueConfig::new(unique_name("worker_test")).with_poll_interval_ms(10)
}

fn new_worker<P>(
    processor: P,
    config: QueueConfig,
) -> (Arc<MemoryTransport>, Arc<QueueWorker<FakeData, P>>)
where
    P: BatchProcessor<FakeData> + 'static,
{
    let transport = Arc::new(MemoryTransport::new());
    let worker = Arc::new(QueueWorker::new(transport.clone(), processor, config));
    (transport, worker)
}

fn spawn_run<P>(
    worker: &Arc<QueueWorker<FakeData, P>>,
) -> (watch::Sender<bool>, JoinHandle<Result<(), QueueError>>)
where
    P: BatchProcessor<FakeData> + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = worker.clone();
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });
    (shutdown_tx, handle)
}

async fn stop(
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), QueueError>>,
) -> Result<(), QueueError> {
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("worker did not stop in time")
        .expect("worker task panicked")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_until_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Records every payload it sees and succeeds.
#[derive(Default)]
struct Collector {
    received: Arc<Mutex<Vec<FakeData>>>,
}

#[async_trait]
impl ItemProcessor<FakeData> for Collector {
    async fn process(&self, item: &mut QueueItem<FakeData>) -> Result<(), QueueError> {
        self.received.lock().unwrap().push(item.data);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Collector"
    }
}

/// Records the retry count of each attempt and fails according to `fail`.
struct Scripted {
    attempts: Arc<Mutex<Vec<u32>>>,
    fail: fn(&mut QueueItem<FakeData>) -> Result<(), QueueError>,
}

impl Scripted {
    fn new(fail: fn(&mut QueueItem<FakeData>) -> Result<(), QueueError>) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(Vec::new())),
            fail,
        }
    }
}

#[async_trait]
impl ItemProcessor<FakeData> for Scripted {
    async fn process(&self, item: &mut QueueItem<FakeData>) -> Result<(), QueueError> {
        self.attempts.lock().unwrap().push(item.retry_count);
        (self.fail)(item)
    }

    fn name(&self) -> &'static str {
        "Scripted"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_item_is_processed() {
    let processor = Collector::default();
    let received = processor.received.clone();
    let (_, worker) = new_worker(PerItem(processor), test_config());

    let item = FakeData::new();
    worker.push(QueueItem::new(item)).await.unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| received.lock().unwrap().len() == 1).await;
    stop(shutdown_tx, handle).await.unwrap();

    assert_eq!(*received.lock().unwrap(), vec![item]);
    assert_eq!(worker.queue_size().await.unwrap(), 0);
    assert_eq!(worker.state(), EngineState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_of_many_items() {
    let processor = Collector::default();
    let received = processor.received.clone();
    let (_, worker) = new_worker(PerItem(processor), test_config());

    let pushed: HashSet<FakeData> = (0..20).map(|_| FakeData::new()).collect();
    worker
        .push_batch(pushed.iter().copied().map(QueueItem::new))
        .await
        .unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| received.lock().unwrap().len() == 20).await;
    stop(shutdown_tx, handle).await.unwrap();

    let received: HashSet<FakeData> = received.lock().unwrap().iter().copied().collect();
    assert_eq!(received, pushed);

    let stats = worker.stats();
    assert_eq!(stats.dequeued, 20);
    assert_eq!(stats.processed, 20);
    assert_eq!(stats.errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_processor_receives_batches() {
    struct BatchRecorder {
        sizes: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl BatchProcessor<FakeData> for BatchRecorder {
        async fn process_batch(
            &self,
            items: &mut [QueueItem<FakeData>],
        ) -> Result<(), QueueError> {
            self.sizes.lock().unwrap().push(items.len());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "BatchRecorder"
        }
    }

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let (_, worker) = new_worker(
        BatchRecorder {
            sizes: sizes.clone(),
        },
        test_config().with_batch_size(5),
    );

    worker
        .push_batch((0..12).map(|_| QueueItem::new(FakeData::new())))
        .await
        .unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| sizes.lock().unwrap().iter().sum::<usize>() == 12).await;
    stop(shutdown_tx, handle).await.unwrap();

    let sizes = sizes.lock().unwrap();
    assert!(sizes.iter().all(|&size| size <= 5));
    assert_eq!(sizes[0], 5);
    assert_eq!(worker.stats().processed, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_items_lost_across_restarts() {
    struct Tracker {
        pending: Arc<Mutex<HashSet<Uuid>>>,
    }

    #[async_trait]
    impl ItemProcessor<FakeData> for Tracker {
        async fn process(&self, item: &mut QueueItem<FakeData>) -> Result<(), QueueError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.pending.lock().unwrap().remove(&item.data.data);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Tracker"
        }
    }

    let pending = Arc::new(Mutex::new(HashSet::new()));
    let (_, worker) = new_worker(
        PerItem(Tracker {
            pending: pending.clone(),
        }),
        test_config().with_max_in_flight(8),
    );

    for _ in 0..5 {
        let pushing = Arc::new(AtomicBool::new(true));
        let pusher = {
            let pushing = pushing.clone();
            let pending = pending.clone();
            let producer = worker.producer().clone();
            tokio::spawn(async move {
                while pushing.load(Ordering::SeqCst) {
                    let item = FakeData::new();
                    pending.lock().unwrap().insert(item.data);
                    producer.send(item).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let (shutdown_tx, handle) = spawn_run(&worker);
        tokio::time::sleep(Duration::from_millis(100)).await;

        pushing.store(false, Ordering::SeqCst);
        pusher.await.unwrap();
        stop(shutdown_tx, handle).await.unwrap();

        let outstanding = pending.lock().unwrap().len() as u64;
        assert_eq!(worker.queue_size().await.unwrap(), outstanding);
        assert_eq!(worker.stats().in_flight, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_item_is_retried_with_incremented_count() {
    let processor = Scripted::new(|item| {
        if item.retry_count == 0 {
            item.mark_failed();
        }
        Ok(())
    });
    let attempts = processor.attempts.clone();
    let (_, worker) = new_worker(PerItem(processor), test_config());

    worker.push(QueueItem::new(FakeData::new())).await.unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| attempts.lock().unwrap().len() == 2).await;
    stop(shutdown_tx, handle).await.unwrap();

    assert_eq!(*attempts.lock().unwrap(), vec![0, 1]);
    let stats = worker.stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.consecutive_errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_always_failing_item_is_dropped_after_max_retries() {
    let processor = Scripted::new(|item| {
        item.mark_failed();
        Ok(())
    });
    let attempts = processor.attempts.clone();
    let (_, worker) = new_worker(PerItem(processor), test_config().with_max_retries(3));

    worker.push(QueueItem::new(FakeData::new())).await.unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| worker.stats().errors == 4).await;
    // Give a fifth delivery the chance to show up if the item were not dropped.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop(shutdown_tx, handle).await.unwrap();

    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(worker.queue_size().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_error_threshold_aborts_run() {
    let processor = Scripted::new(|item| {
        item.mark_failed();
        Ok(())
    });
    let attempts = processor.attempts.clone();
    let (_, worker) = new_worker(
        PerItem(processor),
        test_config().with_error_threshold(10).with_max_retries(3),
    );

    worker
        .push_batch((0..4).map(|_| QueueItem::new(FakeData::new())))
        .await
        .unwrap();

    let (_shutdown_tx, handle) = spawn_run(&worker);
    let result = tokio::time::timeout(TEST_TIMEOUT, handle)
        .await
        .expect("worker did not abort in time")
        .expect("worker task panicked");

    match result {
        Err(QueueError::ErrorThresholdExceeded {
            consecutive_errors,
            threshold,
        }) => {
            assert_eq!(threshold, 10);
            assert!(consecutive_errors > 10);
        }
        other => panic!("expected threshold error, got {other:?}"),
    }

    assert!(attempts.lock().unwrap().len() >= 10);
    assert!(worker.queue_size().await.unwrap() > 0);
    assert_eq!(worker.stats().in_flight, 0);
    assert_eq!(worker.state(), EngineState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stats_balance_after_mixed_outcomes() {
    let processor = Scripted::new(|item| {
        if item.data.data.as_bytes()[0] % 2 == 0 && item.retry_count == 0 {
            return Err(QueueError::processing("even uuid"));
        }
        Ok(())
    });
    let (_, worker) = new_worker(PerItem(processor), test_config());

    worker
        .push_batch((0..30).map(|_| QueueItem::new(FakeData::new())))
        .await
        .unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| worker.stats().processed == 30).await;
    stop(shutdown_tx, handle).await.unwrap();

    let stats = worker.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dequeued, stats.processed + stats.errors + stats.in_flight);
    assert_eq!(stats.dequeued, 30 + stats.errors);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_error_hook_sees_errors_and_flags() {
    let processor = Scripted::new(|item| match item.retry_count {
        0 => Err(QueueError::processing("first attempt")),
        1 => {
            item.mark_failed();
            Ok(())
        }
        _ => Ok(()),
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = seen.clone();
    let transport = Arc::new(MemoryTransport::new());
    let worker = Arc::new(
        QueueWorker::new(transport, PerItem(processor), test_config()).with_error_hook(
            move |error, item| {
                hook_seen
                    .lock()
                    .unwrap()
                    .push((error.map(|e| e.to_string()), item.retry_count));
            },
        ),
    );

    worker.push(QueueItem::new(FakeData::new())).await.unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| worker.stats().processed == 1).await;
    stop(shutdown_tx, handle).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Some("Processing error: first attempt".to_string()), 0),
            (None, 1),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_processor_is_retried() {
    let processor = Scripted::new(|item| {
        if item.retry_count == 0 {
            panic!("processor exploded");
        }
        Ok(())
    });
    let attempts = processor.attempts.clone();

    let panicked = Arc::new(AtomicU32::new(0));
    let hook_panicked = panicked.clone();
    let transport = Arc::new(MemoryTransport::new());
    let worker = Arc::new(
        QueueWorker::new(transport, PerItem(processor), test_config()).with_error_hook(
            move |error, _| {
                if matches!(error, Some(QueueError::Panicked(_))) {
                    hook_panicked.fetch_add(1, Ordering::SeqCst);
                }
            },
        ),
    );

    worker.push(QueueItem::new(FakeData::new())).await.unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| worker.stats().processed == 1).await;
    stop(shutdown_tx, handle).await.unwrap();

    assert_eq!(*attempts.lock().unwrap(), vec![0, 1]);
    assert_eq!(panicked.load(Ordering::SeqCst), 1);
    assert_eq!(worker.stats().errors, 1);
}

/// Memory transport whose first pops fail.
struct FlakyTransport {
    inner: MemoryTransport,
    failing_pops: AtomicU32,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn push(&self, queue: &str, entries: Vec<Vec<u8>>) -> Result<(), QueueError> {
        self.inner.push(queue, entries).await
    }

    async fn pop(&self, queue: &str, max_count: usize) -> Result<Vec<Vec<u8>>, QueueError> {
        let remaining = self.failing_pops.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_pops.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::transport("connection reset"));
        }
        self.inner.pop(queue, max_count).await
    }

    async fn len(&self, queue: &str) -> Result<u64, QueueError> {
        self.inner.len(queue).await
    }

    async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        self.inner.clear(queue).await
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), QueueError> {
        self.inner.publish(channel, message).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transport_errors_are_survived() {
    let processor = Collector::default();
    let received = processor.received.clone();
    let transport = Arc::new(FlakyTransport {
        inner: MemoryTransport::new(),
        failing_pops: AtomicU32::new(3),
    });
    let worker = Arc::new(QueueWorker::new(
        transport,
        PerItem(processor),
        test_config(),
    ));

    worker.push(QueueItem::new(FakeData::new())).await.unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| received.lock().unwrap().len() == 1).await;
    stop(shutdown_tx, handle).await.unwrap();

    let stats = worker.stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.consecutive_errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_entry_does_not_block_queue() {
    let processor = Collector::default();
    let received = processor.received.clone();
    let config = test_config();
    let queue_key = config.queue_key();
    let (transport, worker) = new_worker(PerItem(processor), config);

    transport
        .push(&queue_key, vec![b"{not json".to_vec()])
        .await
        .unwrap();
    let item = FakeData::new();
    worker.push(QueueItem::new(item)).await.unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until(|| received.lock().unwrap().len() == 1).await;
    stop(shutdown_tx, handle).await.unwrap();

    assert_eq!(*received.lock().unwrap(), vec![item]);
    assert_eq!(worker.queue_size().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_run_is_rejected_while_running() {
    let (_, worker) = new_worker(PerItem(Collector::default()), test_config());
    let mut state = worker.subscribe_state();

    let (shutdown_tx, handle) = spawn_run(&worker);
    tokio::time::timeout(TEST_TIMEOUT, state.wait_for(|s| *s == EngineState::Running))
        .await
        .unwrap()
        .unwrap();

    let (_other_tx, other_rx) = watch::channel(false);
    let second = worker.run(other_rx).await;
    assert!(matches!(second, Err(QueueError::AlreadyRunning)));

    stop(shutdown_tx, handle).await.unwrap();
    assert_eq!(worker.state(), EngineState::Stopped);

    // A stopped worker can run again.
    let (shutdown_tx, handle) = spawn_run(&worker);
    stop(shutdown_tx, handle).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_management() {
    let (_, worker) = new_worker(PerItem(Collector::default()), test_config());
    assert_eq!(worker.state(), EngineState::Idle);

    worker
        .push_batch((0..3).map(|_| QueueItem::new(FakeData::new()).with_tags(["kind:test"])))
        .await
        .unwrap();
    assert_eq!(worker.queue_size().await.unwrap(), 3);

    worker.clear_queue().await.unwrap();
    assert_eq!(worker.queue_size().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_limits_in_flight() {
    struct Slow {
        concurrent: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ItemProcessor<FakeData> for Slow {
        async fn process(&self, _item: &mut QueueItem<FakeData>) -> Result<(), QueueError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Slow"
        }
    }

    let peak = Arc::new(AtomicU32::new(0));
    let (_, worker) = new_worker(
        PerItem(Slow {
            concurrent: Arc::new(AtomicU32::new(0)),
            peak: peak.clone(),
        }),
        test_config().with_max_in_flight(2),
    );

    worker
        .push_batch((0..10).map(|_| QueueItem::new(FakeData::new())))
        .await
        .unwrap();

    let (shutdown_tx, handle) = spawn_run(&worker);
    wait_until_async(|| {
        let worker = worker.clone();
        async move { worker.stats().processed == 10 }
    })
    .await;
    stop(shutdown_tx, handle).await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_workers_share_queue_without_duplicates() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(MemoryTransport::new());
    let config = test_config().with_batch_size(3);

    let workers: Vec<_> = (0..2)
        .map(|_| {
            Arc::new(QueueWorker::new(
                transport.clone(),
                PerItem(Collector {
                    received: received.clone(),
                }),
                config.clone(),
            ))
        })
        .collect();

    let pushed: HashSet<FakeData> = (0..200).map(|_| FakeData::new()).collect();
    workers[0]
        .push_batch(pushed.iter().copied().map(QueueItem::new))
        .await
        .unwrap();

    let runs: Vec<_> = workers.iter().map(spawn_run).collect();
    wait_until(|| received.lock().unwrap().len() >= pushed.len()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for (shutdown_tx, handle) in runs {
        stop(shutdown_tx, handle).await.unwrap();
    }

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), pushed.len());
    let unique: HashSet<FakeData> = received.into_iter().collect();
    assert_eq!(unique, pushed);

    let dequeued: u64 = workers.iter().map(|w| w.stats().dequeued).sum();
    assert_eq!(dequeued, pushed.len() as u64);
    assert_eq!(transport.len(&config.queue_key()).await.unwrap(), 0);
}
