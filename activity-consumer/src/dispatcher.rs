use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ProcessingError;
use crate::metrics_consts::{
    CALLBACK_ATTEMPTS, CALLBACK_DURATION, POISON_RECORDS, RECORDS_DISPATCHED,
};
use crate::retry::RetryPolicy;
use crate::types::{Outcome, Record};

/// The processing callback supplied by the embedding application.
///
/// Implementations own payload decoding. Report `ProcessingError::Transient` when
/// the same record could succeed later, `ProcessingError::Permanent` otherwise.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &Record) -> Result<(), ProcessingError>;
}

/// Terminal result of dispatching one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub outcome: Outcome,
    pub attempts: u32,
}

/// Applies the processing callback to records, one at a time. Holds no state of
/// its own between records.
#[derive(Clone)]
pub struct Dispatcher {
    processor: Arc<dyn RecordProcessor>,
    max_attempts: u32,
    retry_policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        processor: Arc<dyn RecordProcessor>,
        max_attempts: u32,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            processor,
            max_attempts: max_attempts.max(1),
            retry_policy,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Invoke the callback once and classify the result.
    pub async fn process(&self, record: &Record) -> Outcome {
        let start = Instant::now();
        let result = self.processor.process(record).await;
        metrics::histogram!(CALLBACK_DURATION).record(start.elapsed().as_secs_f64());
        metrics::counter!(CALLBACK_ATTEMPTS).increment(1);

        match result {
            Ok(()) => Outcome::Success,
            Err(ProcessingError::Transient(e)) => {
                debug!(
                    topic = record.topic(),
                    partition = record.partition_number(),
                    offset = record.offset(),
                    error = ?e,
                    "Transient processing error"
                );
                Outcome::Retry
            }
            Err(ProcessingError::Permanent(e)) => {
                warn!(
                    topic = record.topic(),
                    partition = record.partition_number(),
                    offset = record.offset(),
                    error = ?e,
                    "Permanent processing error, skipping record"
                );
                Outcome::Skip
            }
        }
    }

    /// Process a record until it reaches Success or Skip.
    ///
    /// A record that keeps asking for a retry is invoked at most `max_attempts`
    /// times and is then skipped as a poison record.
    pub async fn dispatch(&self, record: &Record) -> Dispatched {
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;

            match self.process(record).await {
                Outcome::Retry if attempts < self.max_attempts => {
                    let wait = self.retry_policy.retry_interval(attempts);
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                Outcome::Retry => {
                    warn!(
                        topic = record.topic(),
                        partition = record.partition_number(),
                        offset = record.offset(),
                        attempts = attempts,
                        "Poison record: still failing after max attempts, skipping"
                    );
                    metrics::counter!(POISON_RECORDS).increment(1);
                    break Outcome::Skip;
                }
                terminal => break terminal,
            }
        };

        metrics::counter!(RECORDS_DISPATCHED, "outcome" => outcome.as_str()).increment(1);

        Dispatched { outcome, attempts }
    }
}
