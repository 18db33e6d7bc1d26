use crate::application::pending_ledger::{PendingLedger, Settlement};
use crate::application::repeating_task::{spawn_repeating, RepeatingTaskHandle};
use crate::domain::models::{NewOperation, PendingOperation};
use crate::infrastructure::durable_store::DurableStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::time_entries_client::{RemoteExecutor, RemoteResponse};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const CONFIRMATION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReport {
    /// Another drain was still settling.
    Skipped,
    Completed {
        attempted: usize,
        succeeded: usize,
        failed: usize,
        exhausted: usize,
    },
}

/// A queued operation the remote accepted during a drain.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub operation: PendingOperation,
    pub response: RemoteResponse,
    pub settlement: Settlement,
}

/// Resets the scheduler to `Idle` when the drain ends, including by panic.
struct DrainGuard<'a> {
    state: &'a Mutex<SchedulerState>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SchedulerState::Idle;
    }
}

pub struct RetryScheduler<E, S>
where
    E: RemoteExecutor + 'static,
    S: DurableStore + 'static,
{
    executor: Arc<E>,
    ledger: Arc<PendingLedger<S>>,
    state: Mutex<SchedulerState>,
    max_retries: u32,
    retry_period: Duration,
    confirmations: broadcast::Sender<Confirmation>,
}

impl<E, S> RetryScheduler<E, S>
where
    E: RemoteExecutor + 'static,
    S: DurableStore + 'static,
{
    pub fn new(
        executor: Arc<E>,
        ledger: Arc<PendingLedger<S>>,
        max_retries: u32,
        retry_period: Duration,
    ) -> Self {
        let (confirmations, _) = broadcast::channel(CONFIRMATION_CAPACITY);
        Self {
            executor,
            ledger,
            state: Mutex::new(SchedulerState::Idle),
            max_retries,
            retry_period,
            confirmations,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn subscribe_confirmations(&self) -> broadcast::Receiver<Confirmation> {
        self.confirmations.subscribe()
    }

    fn begin_drain(&self) -> Option<DrainGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SchedulerState::Draining {
            return None;
        }
        *state = SchedulerState::Draining;
        Some(DrainGuard { state: &self.state })
    }

    /// Attempts every pending operation below the retry cap once.
    ///
    /// Attempts run concurrently and the ledger is updated as each one settles.
    /// The call returns after the whole batch has settled.
    pub async fn drain_once(&self) -> DrainReport {
        let Some(_guard) = self.begin_drain() else {
            debug!("drain already in progress; skipping");
            return DrainReport::Skipped;
        };

        let eligible = self.ledger.checkout(self.max_retries);
        let attempted = eligible.len();
        if attempted == 0 {
            return DrainReport::Completed {
                attempted: 0,
                succeeded: 0,
                failed: 0,
                exhausted: 0,
            };
        }
        debug!(attempted, "draining pending operations");

        let mut attempts = JoinSet::new();
        for operation in eligible {
            let executor = Arc::clone(&self.executor);
            attempts.spawn(async move {
                let result = executor.execute(&NewOperation::from(&operation)).await;
                (operation, result)
            });
        }

        let mut succeeded = 0;
        let mut failed = 0;
        let mut exhausted = 0;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((operation, Ok(response))) => {
                    succeeded += 1;
                    self.confirm(operation, response);
                }
                Ok((operation, Err(error))) => {
                    failed += 1;
                    if self.record_failure(&operation, &error) {
                        exhausted += 1;
                    }
                }
                Err(error) => {
                    failed += 1;
                    error!(%error, "pending operation attempt aborted");
                }
            }
        }

        self.ledger.release_deliveries();

        info!(attempted, succeeded, failed, exhausted, "drain completed");
        DrainReport::Completed {
            attempted,
            succeeded,
            failed,
            exhausted,
        }
    }

    fn confirm(&self, operation: PendingOperation, response: RemoteResponse) {
        let settlement = self.ledger.settle(&operation, &response);
        info!(
            operation_id = %operation.id,
            method = operation.method.as_http_method(),
            endpoint = %operation.target.endpoint(),
            retry_count = operation.retry_count,
            "pending operation confirmed"
        );
        // No receivers just means nobody is tracking provisional state.
        let _ = self.confirmations.send(Confirmation {
            operation,
            response,
            settlement,
        });
    }

    /// Returns true when this failure used up the last retry.
    fn record_failure(&self, operation: &PendingOperation, failure: &InfraError) -> bool {
        let retry_count = self
            .ledger
            .increment_retry(&operation.id)
            .into_iter()
            .find(|pending| pending.id == operation.id)
            .map(|pending| pending.retry_count);

        let Some(retry_count) = retry_count else {
            debug!(operation_id = %operation.id, "failed operation already left the ledger");
            return false;
        };

        if retry_count >= self.max_retries {
            error!(
                operation_id = %operation.id,
                endpoint = %operation.target.endpoint(),
                retry_count,
                error = %failure,
                "pending operation exhausted its retries"
            );
            true
        } else {
            warn!(
                operation_id = %operation.id,
                endpoint = %operation.target.endpoint(),
                retry_count,
                error = %failure,
                "pending operation attempt failed"
            );
            false
        }
    }

    /// Drains on every period. A tick that lands while a drain is still
    /// settling is skipped; an in-flight drain outlives `stop`.
    pub fn start(self: &Arc<Self>) -> RepeatingTaskHandle {
        let scheduler = Arc::clone(self);
        info!(
            period_secs = self.retry_period.as_secs(),
            max_retries = self.max_retries,
            "starting retry scheduler"
        );
        spawn_repeating("retry-scheduler", self.retry_period, move || {
            if scheduler.state() == SchedulerState::Draining {
                debug!("previous drain still settling; tick skipped");
                return;
            }
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler.drain_once().await;
            });
        })
    }
}
