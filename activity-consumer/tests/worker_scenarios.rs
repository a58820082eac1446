use std::sync::Arc;
use std::time::Duration;

use activity_consumer::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use activity_consumer::error::WorkerError;
use activity_consumer::health::HealthRegistry;
use activity_consumer::retry::RetryPolicy;
use activity_consumer::test_utils::{
    eventually, test_partition, FlakyCheckpointStore, MemoryBroker, ScriptedProcessor, Step,
};
use activity_consumer::types::WorkerState;
use activity_consumer::worker::{Worker, WorkerConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> WorkerConfig {
    WorkerConfig {
        member_id: "worker-test".to_string(),
        max_batch_size: 100,
        fetch_timeout: Duration::from_millis(20),
        max_attempts: 3,
        record_retry: RetryPolicy::immediate(),
        broker_retry: RetryPolicy::immediate(),
        startup_max_retries: 2,
        commit_max_retries: 2,
        rebalance_drain_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    }
}

struct Running {
    shutdown: CancellationToken,
    state: watch::Receiver<WorkerState>,
    handle: JoinHandle<Result<(), WorkerError>>,
}

impl Running {
    async fn stop(self) -> (Result<(), WorkerError>, WorkerState) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("worker did not stop in time")
            .expect("worker task panicked");
        let state = *self.state.borrow();
        (result, state)
    }
}

fn start(
    broker: &Arc<MemoryBroker>,
    store: Arc<dyn CheckpointStore>,
    processor: &Arc<ScriptedProcessor>,
) -> Running {
    start_worker(Worker::new(
        test_config(),
        broker.clone(),
        store,
        processor.clone(),
    ))
}

fn start_worker(worker: Worker) -> Running {
    let shutdown = CancellationToken::new();
    let state = worker.subscribe();
    let handle = tokio::spawn(worker.run(shutdown.clone()));
    Running {
        shutdown,
        state,
        handle,
    }
}

#[tokio::test]
async fn test_successful_batch_is_committed_and_not_refetched_after_restart() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let p0 = test_partition(0);

    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [5, 6, 7]);
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&p0) == Some(7), WAIT).await);
    let (result, state) = running.stop().await;

    assert!(result.is_ok());
    assert_eq!(state, WorkerState::Stopped);
    assert_eq!(processor.processed(0), vec![5, 6, 7]);

    // Same log, one more record, same checkpoints
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [5, 6, 7, 8]);
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&p0) == Some(8), WAIT).await);
    let (result, _) = running.stop().await;

    assert!(result.is_ok());
    assert_eq!(broker.fetched_offsets(0), vec![8]);
    assert_eq!(processor.processed(0), vec![8]);
}

#[tokio::test]
async fn test_transient_failures_are_retried_before_committing() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [5, 6, 7]);
    let processor = Arc::new(ScriptedProcessor::new());
    processor.script(0, 6, vec![Step::Transient, Step::Transient]);

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(7), WAIT).await);
    running.stop().await.0.unwrap();

    assert_eq!(processor.invocations(0, 6), 3);
    assert_eq!(processor.invocations(0, 7), 1);
    assert_eq!(processor.processed(0), vec![5, 6, 7]);
}

#[tokio::test]
async fn test_poison_record_is_skipped_and_processing_continues() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [5, 6, 7]);
    let processor = Arc::new(ScriptedProcessor::new());
    processor.always_fail(0, 6);

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(7), WAIT).await);
    running.stop().await.0.unwrap();

    assert_eq!(processor.invocations(0, 6), 3);
    assert_eq!(processor.processed(0), vec![5, 7]);
}

#[tokio::test]
async fn test_permanent_failure_is_skipped_without_retry() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [0, 1]);
    let processor = Arc::new(ScriptedProcessor::new());
    processor.script(0, 0, vec![Step::Permanent]);

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(1), WAIT).await);
    running.stop().await.0.unwrap();

    assert_eq!(processor.invocations(0, 0), 1);
    assert_eq!(processor.processed(0), vec![1]);
}

#[tokio::test]
async fn test_empty_fetches_keep_the_worker_running() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| *running.state.borrow() == WorkerState::Running, WAIT).await);

    // Several fetch timeouts go by without records
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!running.handle.is_finished());
    assert_eq!(*running.state.borrow(), WorkerState::Running);
    assert_eq!(store.get(&test_partition(0)), None);

    broker.produce(0, [0, 1]);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(1), WAIT).await);
    running.stop().await.0.unwrap();
}

#[tokio::test]
async fn test_partitions_progress_independently() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(3));
    broker.produce(0, [0, 1, 2]);
    broker.produce(2, [10, 11]);
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(
        eventually(
            || store.get(&test_partition(0)) == Some(2) && store.get(&test_partition(2)) == Some(11),
            WAIT
        )
        .await
    );
    running.stop().await.0.unwrap();

    assert_eq!(store.get(&test_partition(1)), None);
    assert_eq!(processor.processed(0), vec![0, 1, 2]);
    assert_eq!(processor.processed(2), vec![10, 11]);
}

#[tokio::test]
async fn test_redelivered_records_are_not_dispatched_again() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [5, 6, 7]);
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(7), WAIT).await);

    broker.rewind(0, 5);
    assert!(eventually(|| broker.fetched_offsets(0).len() == 6, WAIT).await);
    broker.produce(0, [8]);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(8), WAIT).await);
    running.stop().await.0.unwrap();

    assert_eq!(processor.invocations(0, 5), 1);
    assert_eq!(processor.invocations(0, 7), 1);
    assert_eq!(processor.processed(0), vec![5, 6, 7, 8]);
}

#[tokio::test]
async fn test_fetch_failures_are_retried_while_running() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [0]);
    broker.fail_fetches(4);
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(0), WAIT).await);
    let (result, _) = running.stop().await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn test_revocation_drains_and_commits_before_acknowledging() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(2));
    broker.produce(0, 0..10);
    let processor = Arc::new(ScriptedProcessor::with_delay(Duration::from_millis(10)));

    let running = start(&broker, store.clone(), &processor);
    // The whole batch was fetched at once, and is now being processed
    assert!(eventually(|| processor.invocations(0, 0) == 1, WAIT).await);
    assert!(store.get(&test_partition(0)).map_or(true, |offset| offset < 9));

    let acked = broker.revoke(&[0]);
    tokio::time::timeout(WAIT, acked)
        .await
        .expect("revocation was not acknowledged")
        .expect("worker dropped the acknowledgement");

    assert_eq!(store.get(&test_partition(0)), Some(9));
    assert_eq!(processor.processed(0), (0..10).collect::<Vec<_>>());
    assert!(!broker.is_started(0));
    assert!(eventually(|| *running.state.borrow() == WorkerState::Running, WAIT).await);

    // The remaining partition keeps going
    broker.produce(1, [0, 1]);
    assert!(eventually(|| store.get(&test_partition(1)) == Some(1), WAIT).await);

    // Records arriving after the revocation are left for the next owner
    broker.produce(0, [10]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processor.invocations(0, 10), 0);

    running.stop().await.0.unwrap();
}

#[tokio::test]
async fn test_reassigned_partition_resumes_after_checkpoint() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [0, 1]);
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(1), WAIT).await);

    let acked = broker.revoke(&[0]);
    tokio::time::timeout(WAIT, acked).await.unwrap().unwrap();
    broker.produce(0, [2, 3]);
    broker.assign(&[0]);

    assert!(eventually(|| store.get(&test_partition(0)) == Some(3), WAIT).await);
    running.stop().await.0.unwrap();

    assert_eq!(broker.fetched_offsets(0), vec![0, 1, 2, 3]);
    assert_eq!(processor.processed(0), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_reassignment_waits_for_a_worker_that_missed_the_drain_deadline() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, 0..3);
    let processor = Arc::new(ScriptedProcessor::with_delay(Duration::from_millis(300)));

    let config = WorkerConfig {
        rebalance_drain_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let running = start_worker(Worker::new(
        config,
        broker.clone(),
        store.clone(),
        processor.clone(),
    ));
    assert!(eventually(|| processor.invocations(0, 0) == 1, WAIT).await);

    // Acknowledged while offset 0 is still being processed
    let acked = broker.revoke(&[0]);
    tokio::time::timeout(WAIT, acked).await.unwrap().unwrap();
    assert_eq!(processor.processed(0), Vec::<i64>::new());
    broker.assign(&[0]);

    assert!(eventually(|| store.get(&test_partition(0)) == Some(2), WAIT).await);
    running.stop().await.0.unwrap();

    assert_eq!(processor.max_in_flight(0), 1);
    // The old worker finished offset 0 but never committed it, so it came again
    assert_eq!(processor.invocations(0, 0), 2);
    assert_eq!(processor.processed(0), vec![0, 0, 1, 2]);
    assert_eq!(store.get(&test_partition(0)), Some(2));
}

#[tokio::test]
async fn test_shutdown_commits_progress_and_leaves_the_group() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, 0..5);
    let processor = Arc::new(ScriptedProcessor::with_delay(Duration::from_millis(20)));

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| processor.invocations(0, 1) == 1, WAIT).await);
    let (result, state) = running.stop().await;

    assert!(result.is_ok());
    assert_eq!(state, WorkerState::Stopped);
    assert!(broker.has_left());

    // Stopped at a record boundary: everything processed is committed, nothing more
    let processed = processor.processed(0);
    assert!(!processed.is_empty());
    assert!(processed.len() < 5);
    assert_eq!(store.get(&test_partition(0)), processed.last().copied());
}

#[tokio::test]
async fn test_startup_fails_after_exhausting_connect_retries() {
    let broker = Arc::new(MemoryBroker::new(1));
    broker.fail_connects(u32::MAX);
    let processor = Arc::new(ScriptedProcessor::new());

    let worker = Worker::new(
        test_config(),
        broker.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        processor.clone(),
    );
    let state = worker.subscribe();

    let result = worker.run(CancellationToken::new()).await;

    assert!(matches!(result, Err(WorkerError::Startup { attempts: 3, .. })));
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(*state.borrow(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_startup_recovers_from_transient_connect_failures() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let broker = Arc::new(MemoryBroker::new(1));
    broker.fail_connects(2);
    broker.produce(0, [0]);
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.get(&test_partition(0)) == Some(0), WAIT).await);
    running.stop().await.0.unwrap();

    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn test_unreadable_checkpoints_are_fatal() {
    let store = Arc::new(FlakyCheckpointStore::new());
    store.fail_loads(u32::MAX);
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [0]);
    let processor = Arc::new(ScriptedProcessor::new());

    let worker = Worker::new(test_config(), broker.clone(), store, processor.clone());
    let result = tokio::time::timeout(WAIT, worker.run(CancellationToken::new()))
        .await
        .unwrap();

    assert!(matches!(result, Err(WorkerError::CheckpointLoad { .. })));
    assert_eq!(processor.invocations(0, 0), 0);
    assert!(broker.has_left());
}

#[tokio::test]
async fn test_failed_commit_is_persisted_by_a_later_commit() {
    let store = Arc::new(FlakyCheckpointStore::new());
    store.fail_next(3);
    let broker = Arc::new(MemoryBroker::new(1));
    broker.produce(0, [0, 1]);
    let processor = Arc::new(ScriptedProcessor::new());

    let running = start(&broker, store.clone(), &processor);
    assert!(eventually(|| store.store_attempts() >= 3, WAIT).await);
    assert!(eventually(|| processor.processed(0) == vec![0, 1], WAIT).await);

    broker.produce(0, [2]);
    assert!(eventually(|| store.inner().get(&test_partition(0)) == Some(2), WAIT).await);
    running.stop().await.0.unwrap();

    assert!(store.store_attempts() >= 4);
    // Nothing was processed twice because of the failed commit
    assert_eq!(processor.invocations(0, 0), 1);
    assert_eq!(processor.invocations(0, 1), 1);
}

#[tokio::test]
async fn test_worker_reports_liveness_while_running() {
    let liveness = HealthRegistry::new("liveness");
    let broker = Arc::new(MemoryBroker::new(1));
    let processor = Arc::new(ScriptedProcessor::new());

    let worker = Worker::new(
        test_config(),
        broker.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        processor.clone(),
    )
    .with_liveness(liveness.register("worker", Duration::from_millis(200)));
    assert!(!liveness.get_status().healthy);

    let running = start_worker(worker);
    assert!(eventually(|| liveness.get_status().healthy, WAIT).await);
    running.stop().await.0.unwrap();
}
