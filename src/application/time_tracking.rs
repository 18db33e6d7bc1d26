use crate::application::pending_ledger::{PendingLedger, Withdrawal};
use crate::application::retry_scheduler::Confirmation;
use crate::application::session_tracker::SessionTracker;
use crate::application::{system_clock, NowProvider};
use crate::domain::models::{
    ActiveSession, MutationOutcome, NewOperation, OperationMethod, PendingOperation, Task,
    TaskSyncStatus, TimedInterval,
};
use crate::infrastructure::durable_store::DurableStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::time_entries_client::{RemoteExecutor, RemoteResponse};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

const LOCAL_ID_PREFIX: &str = "local-";

fn local_interval_id(operation_id: &str) -> String {
    format!("{LOCAL_ID_PREFIX}{operation_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInterval {
    pub task_id: String,
    pub interval: TimedInterval,
}

/// Work that has to wait until a queued create tells us the remote id.
#[derive(Debug, Clone)]
enum DeferredAction {
    Update(TimedInterval),
    Delete,
}

#[derive(Debug, Default)]
struct IntervalRegistry {
    running: Vec<RunningInterval>,
    /// Local interval id to the id of the queued create that will produce it.
    provisional: HashMap<String, String>,
    /// Local interval id to the remote id it was confirmed as.
    confirmed: HashMap<String, String>,
    /// Create operation id to the follow-up owed once it is confirmed.
    deferred: HashMap<String, DeferredAction>,
}

impl IntervalRegistry {
    fn resolve(&self, interval_id: &str) -> String {
        self.confirmed
            .get(interval_id)
            .cloned()
            .unwrap_or_else(|| interval_id.to_string())
    }

    fn upsert_running(&mut self, task_id: &str, interval: &TimedInterval) {
        match self
            .running
            .iter_mut()
            .find(|entry| entry.interval.id == interval.id)
        {
            Some(entry) => {
                entry.task_id = task_id.to_string();
                entry.interval = interval.clone();
            }
            None => self.running.push(RunningInterval {
                task_id: task_id.to_string(),
                interval: interval.clone(),
            }),
        }
    }

    fn remove_running(&mut self, interval_id: &str) {
        self.running.retain(|entry| entry.interval.id != interval_id);
    }

    /// Mirrors an edited interval: a stopped one leaves the registry, a
    /// running one is refreshed only if it was already known.
    fn refresh(&mut self, interval: &TimedInterval) {
        if !interval.is_running() {
            self.remove_running(&interval.id);
            return;
        }
        if let Some(entry) = self
            .running
            .iter_mut()
            .find(|entry| entry.interval.id == interval.id)
        {
            entry.interval = interval.clone();
        }
    }

    fn rename_running(&mut self, local_id: &str, confirmed: &TimedInterval) {
        for entry in self.running.iter_mut() {
            if entry.interval.id == local_id {
                entry.interval = confirmed.clone();
            }
        }
    }
}

/// Entry point for every time-entry mutation.
///
/// Each mutation is tried against the remote once. When the remote cannot be
/// reached or rejects the call, the mutation is queued in the pending ledger
/// and the caller receives a `MutationOutcome::Queued` carrying the locally
/// applied value. Validation failures are returned and never queued.
///
/// At most one interval runs process-wide: starting one stops every running
/// interval the service knows about, across all tasks.
pub struct TimeEntryService<E, S>
where
    E: RemoteExecutor,
    S: DurableStore,
{
    executor: Arc<E>,
    ledger: Arc<PendingLedger<S>>,
    tracker: Arc<SessionTracker>,
    max_retries: u32,
    registry: Mutex<IntervalRegistry>,
    /// Serializes mutation sequences so a pre-stop and its create never interleave.
    mutations: AsyncMutex<()>,
    now_provider: NowProvider,
}

impl<E, S> TimeEntryService<E, S>
where
    E: RemoteExecutor,
    S: DurableStore,
{
    pub fn new(
        executor: Arc<E>,
        ledger: Arc<PendingLedger<S>>,
        tracker: Arc<SessionTracker>,
        max_retries: u32,
    ) -> Self {
        Self {
            executor,
            ledger,
            tracker,
            max_retries,
            registry: Mutex::new(IntervalRegistry::default()),
            mutations: AsyncMutex::new(()),
            now_provider: system_clock(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub async fn start_interval(
        &self,
        task: &Task,
        description: &str,
    ) -> Result<MutationOutcome<TimedInterval>, InfraError> {
        validate_task_id(&task.id)?;
        let _serial = self.mutations.lock().await;
        self.observe_task(task);
        self.stop_all_running().await;

        let interval = TimedInterval::running((self.now_provider)(), description);
        self.create_entry(task, interval).await
    }

    /// Stops `interval` at the current time. The session is cleared even when
    /// the remote update has to be queued.
    pub async fn stop_interval(
        &self,
        task_id: &str,
        interval: &TimedInterval,
    ) -> Result<MutationOutcome<TimedInterval>, InfraError> {
        let _serial = self.mutations.lock().await;
        self.stop_running(task_id, interval).await
    }

    pub async fn update_interval(
        &self,
        task_id: &str,
        interval: TimedInterval,
    ) -> Result<MutationOutcome<TimedInterval>, InfraError> {
        let _serial = self.mutations.lock().await;
        self.amend(task_id, interval).await
    }

    /// Deletes an interval. The record leaves local state immediately.
    pub async fn delete_interval(
        &self,
        task_id: &str,
        interval_id: &str,
    ) -> Result<MutationOutcome<()>, InfraError> {
        validate_task_id(task_id)?;
        if interval_id.trim().is_empty() {
            return Err(InfraError::Validation("interval id must not be empty".to_string()));
        }
        let _serial = self.mutations.lock().await;

        let remote_id = {
            let mut registry = self.lock_registry();
            registry.remove_running(interval_id);
            if let Some(operation_id) = registry.provisional.remove(interval_id) {
                match self.ledger.withdraw(&operation_id) {
                    // Settled already; the record is deleted once its confirmation lands.
                    Withdrawal::Absent => {
                        registry
                            .deferred
                            .insert(operation_id.clone(), DeferredAction::Delete);
                    }
                    Withdrawal::Removed(_) | Withdrawal::InFlight => {
                        registry.deferred.remove(&operation_id);
                    }
                }
                drop(registry);
                self.tracker.clear_if(interval_id);
                info!(task_id, interval_id, operation_id = %operation_id, "dropped provisional interval");
                return Ok(MutationOutcome::Confirmed(()));
            }
            let remote_id = registry.resolve(interval_id);
            registry.remove_running(&remote_id);
            registry.confirmed.remove(interval_id);
            remote_id
        };
        self.tracker.clear_if(interval_id);
        self.tracker.clear_if(&remote_id);
        self.discard_updates_for(task_id, &remote_id);

        let operation = NewOperation::delete(task_id, remote_id);
        let response = self.attempt(&operation).await?;
        let outcome = match response {
            Some(_) => MutationOutcome::Confirmed(()),
            None => {
                let queued = self.ledger.append(operation);
                MutationOutcome::Queued {
                    value: (),
                    operation_id: queued.id,
                }
            }
        };
        self.prune_aliases();
        Ok(outcome)
    }

    /// Manual entry. Without `end` the interval is left running and the
    /// global single-running rule applies.
    pub async fn add_interval(
        &self,
        task: &Task,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        description: &str,
    ) -> Result<MutationOutcome<TimedInterval>, InfraError> {
        validate_task_id(&task.id)?;
        let Some(begin) = begin else {
            return Err(InfraError::Validation(
                "begin timestamp is required for a manual interval".to_string(),
            ));
        };
        let interval = TimedInterval::running(begin, description);
        let interval = match end {
            Some(end) if end < begin => {
                return Err(InfraError::Validation(
                    "end timestamp must not be before begin timestamp".to_string(),
                ));
            }
            Some(end) => interval.stopped_at(end),
            None => interval,
        };

        let _serial = self.mutations.lock().await;
        if interval.is_running() {
            self.observe_task(task);
            self.stop_all_running().await;
        }
        self.create_entry(task, interval).await
    }

    /// Records the running intervals of a task read from the remote, so that
    /// a later start can stop them.
    pub fn observe_task(&self, task: &Task) {
        let mut registry = self.lock_registry();
        for interval in task.times.iter().filter(|interval| !interval.id.is_empty()) {
            if interval.is_running() {
                registry.upsert_running(&task.id, interval);
            } else {
                registry.remove_running(&interval.id);
            }
        }
        self.prune_aliases_locked(&mut registry);
    }

    pub fn running_intervals(&self) -> Vec<RunningInterval> {
        self.lock_registry().running.clone()
    }

    /// Completed durations plus the live elapsed time of the running interval.
    pub fn total_elapsed_seconds(&self, task: &Task) -> i64 {
        let now = (self.now_provider)();
        let session = self
            .tracker
            .snapshot()
            .filter(|session| session.task.id == task.id);

        let mut total = 0;
        let mut session_counted = false;
        for interval in &task.times {
            if !interval.is_running() {
                total += interval.duration_seconds;
                continue;
            }
            match session.as_ref() {
                Some(session) if session.interval.id == interval.id => {
                    total += session.elapsed_seconds;
                    session_counted = true;
                }
                _ => total += interval.elapsed_seconds_at(now),
            }
        }
        if let Some(session) = session.as_ref().filter(|_| !session_counted) {
            total += session.elapsed_seconds;
        }
        total
    }

    pub fn pending_for_task(&self, task_id: &str) -> Vec<PendingOperation> {
        self.ledger.list_for_task(task_id)
    }

    pub fn sync_status(&self, task_id: &str) -> TaskSyncStatus {
        let pending = self.ledger.list_for_task(task_id);
        let exhausted = pending
            .iter()
            .filter(|operation| operation.is_exhausted(self.max_retries))
            .cloned()
            .collect();
        TaskSyncStatus {
            task_id: task_id.to_string(),
            pending,
            exhausted,
        }
    }

    pub fn exhausted_operations(&self) -> Vec<PendingOperation> {
        self.ledger.exhausted(self.max_retries)
    }

    /// Discards a pending operation. A discarded create takes its provisional
    /// interval with it.
    pub fn clear_operation(&self, operation_id: &str) -> Option<PendingOperation> {
        let mut registry = self.lock_registry();
        let cleared = self.ledger.clear(operation_id)?;
        if cleared.method == OperationMethod::Create {
            let local_id = local_interval_id(&cleared.id);
            registry.provisional.remove(&local_id);
            registry.deferred.remove(&cleared.id);
            registry.remove_running(&local_id);
            drop(registry);
            self.tracker.clear_if(&local_id);
        }
        Some(cleared)
    }

    pub fn active_session(&self) -> Option<ActiveSession> {
        self.tracker.snapshot()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<Option<ActiveSession>> {
        self.tracker.subscribe()
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<Vec<PendingOperation>> {
        self.ledger.subscribe()
    }

    /// Folds a create confirmed by the retry scheduler into local state and
    /// issues any follow-up that was waiting for the remote id.
    pub async fn apply_confirmation(&self, confirmation: &Confirmation) {
        if confirmation.operation.method != OperationMethod::Create {
            return;
        }
        let operation_id = confirmation.operation.id.as_str();
        let task_id = confirmation.operation.target.task_id.clone();
        let local_id = local_interval_id(operation_id);
        let _serial = self.mutations.lock().await;

        let created = match &confirmation.response {
            RemoteResponse::Interval(created) => created,
            RemoteResponse::Unidentified => {
                self.forget_provisional(&local_id, operation_id);
                return;
            }
            RemoteResponse::Deleted => return,
        };

        let (was_provisional, deferred) = {
            let mut registry = self.lock_registry();
            let was_provisional = registry.provisional.remove(&local_id).is_some();
            if was_provisional {
                registry
                    .confirmed
                    .insert(local_id.clone(), created.id.clone());
                registry.rename_running(&local_id, created);
            }
            (was_provisional, registry.deferred.remove(operation_id))
        };
        if !was_provisional && deferred.is_none() {
            return;
        }

        if self.tracker.confirm_interval(&local_id, created.clone()) {
            info!(local_id = %local_id, interval_id = %created.id, "provisional session confirmed");
        }
        match deferred {
            Some(DeferredAction::Update(mut interval)) => {
                interval.id = created.id.clone();
                self.replay(NewOperation::update(task_id, interval)).await;
            }
            Some(DeferredAction::Delete) => {
                self.replay(NewOperation::delete(task_id, created.id.clone()))
                    .await;
            }
            None => {}
        }
        self.prune_aliases();
    }

    /// The remote created a record without naming it. The next read of the
    /// task picks it up.
    fn forget_provisional(&self, local_id: &str, operation_id: &str) {
        let mut registry = self.lock_registry();
        let was_provisional = registry.provisional.remove(local_id).is_some();
        registry.deferred.remove(operation_id);
        registry.remove_running(local_id);
        drop(registry);
        self.tracker.clear_if(local_id);
        if was_provisional {
            warn!(local_id, operation_id, "queued create was accepted without an id");
        }
    }

    /// Internal pre-stop: an entry that cannot be stopped is dropped from the
    /// registry so that it never blocks a start.
    async fn stop_all_running(&self) {
        let running = self.running_intervals();
        for entry in running {
            debug!(
                task_id = %entry.task_id,
                interval_id = %entry.interval.id,
                "stopping running interval before start"
            );
            if let Err(error) = self.stop_running(&entry.task_id, &entry.interval).await {
                warn!(
                    task_id = %entry.task_id,
                    interval_id = %entry.interval.id,
                    %error,
                    "dropping running interval that could not be stopped"
                );
                self.lock_registry().remove_running(&entry.interval.id);
                self.tracker.clear_if(&entry.interval.id);
            }
        }
    }

    async fn stop_running(
        &self,
        task_id: &str,
        interval: &TimedInterval,
    ) -> Result<MutationOutcome<TimedInterval>, InfraError> {
        if !interval.is_running() {
            return Err(InfraError::Validation(format!(
                "interval {} is not running",
                interval.id
            )));
        }
        let stopped = interval.stopped_at((self.now_provider)());
        self.amend(task_id, stopped).await
    }

    async fn create_entry(
        &self,
        task: &Task,
        interval: TimedInterval,
    ) -> Result<MutationOutcome<TimedInterval>, InfraError> {
        let operation = NewOperation::create(task.id.clone(), interval.clone());
        let response = self.attempt(&operation).await?;
        // Held until the session reflects the entry so a drain cannot confirm
        // the create before its provisional id is registered.
        let mut registry = self.lock_registry();
        let outcome = match response {
            Some(response) => MutationOutcome::Confirmed(expect_interval(response, &operation)?),
            None => {
                let queued = self.ledger.append(operation);
                let mut provisional = interval;
                provisional.id = local_interval_id(&queued.id);
                registry
                    .provisional
                    .insert(provisional.id.clone(), queued.id.clone());
                MutationOutcome::Queued {
                    value: provisional,
                    operation_id: queued.id,
                }
            }
        };

        let created = outcome.value();
        if created.is_running() {
            registry.upsert_running(&task.id, created);
            self.tracker
                .set_active(task, created.clone(), outcome.is_queued());
        }
        drop(registry);
        Ok(outcome)
    }

    async fn amend(
        &self,
        task_id: &str,
        interval: TimedInterval,
    ) -> Result<MutationOutcome<TimedInterval>, InfraError> {
        validate_task_id(task_id)?;
        interval.validate().map_err(InfraError::Validation)?;

        let operation = {
            let mut registry = self.lock_registry();
            if let Some(operation_id) = registry.provisional.get(&interval.id).cloned() {
                let mut payload = interval.clone();
                payload.id.clear();
                if !self.ledger.replace_payload(&operation_id, payload) {
                    registry
                        .deferred
                        .insert(operation_id.clone(), DeferredAction::Update(interval.clone()));
                }
                registry.refresh(&interval);
                drop(registry);
                self.reflect_in_session(&interval);
                debug!(task_id, interval_id = %interval.id, operation_id = %operation_id, "amended provisional interval");
                return Ok(MutationOutcome::Queued {
                    value: interval,
                    operation_id,
                });
            }

            let mut remote = interval.clone();
            remote.id = registry.resolve(&interval.id);
            let operation = NewOperation::update(task_id, remote);
            operation.validate().map_err(InfraError::Validation)?;
            if let Some(payload) = operation.payload.as_ref() {
                registry.refresh(payload);
            }
            operation
        };
        if let Some(payload) = operation.payload.as_ref() {
            self.reflect_in_session(payload);
        }

        let response = self.attempt(&operation).await?;
        let outcome = match response {
            Some(response) => MutationOutcome::Confirmed(expect_interval(response, &operation)?),
            None => {
                let queued = self.ledger.append(operation);
                let value = queued.payload.clone().unwrap_or(interval);
                MutationOutcome::Queued {
                    value,
                    operation_id: queued.id,
                }
            }
        };
        self.prune_aliases();
        Ok(outcome)
    }

    fn reflect_in_session(&self, interval: &TimedInterval) {
        if !interval.is_running() {
            self.tracker.clear_if(&interval.id);
            return;
        }
        let Some(session) = self.tracker.snapshot() else {
            return;
        };
        if session.interval.id == interval.id {
            self.tracker
                .set_active(&session.task, interval.clone(), session.provisional);
        }
    }

    /// Pending updates would fail against a deleted record.
    fn discard_updates_for(&self, task_id: &str, interval_id: &str) {
        for operation in self.ledger.list_for_task(task_id) {
            if operation.method == OperationMethod::Update
                && operation.target.interval_id.as_deref() == Some(interval_id)
            {
                self.ledger.remove(&operation.id);
                debug!(operation_id = %operation.id, interval_id, "discarded update for deleted interval");
            }
        }
    }

    /// One remote call. `Ok(None)` means the call failed remotely and the
    /// caller should queue the operation.
    async fn attempt(&self, operation: &NewOperation) -> Result<Option<RemoteResponse>, InfraError> {
        operation.validate().map_err(InfraError::Validation)?;
        match self.executor.execute(operation).await {
            Ok(response) => Ok(Some(response)),
            Err(error) if error.is_remote_failure() => {
                warn!(
                    method = operation.method.as_http_method(),
                    endpoint = %operation.target.endpoint(),
                    %error,
                    "remote call failed; queuing operation"
                );
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn replay(&self, operation: NewOperation) {
        match self.attempt(&operation).await {
            Ok(Some(_)) => info!(
                method = operation.method.as_http_method(),
                endpoint = %operation.target.endpoint(),
                "deferred operation applied"
            ),
            Ok(None) => {
                self.ledger.append(operation);
            }
            Err(error) => warn!(%error, "deferred operation rejected"),
        }
    }

    fn prune_aliases(&self) {
        let mut registry = self.lock_registry();
        self.prune_aliases_locked(&mut registry);
    }

    /// An alias lives while its remote interval is still running or still
    /// has pending work against it.
    fn prune_aliases_locked(&self, registry: &mut IntervalRegistry) {
        if registry.confirmed.is_empty() {
            return;
        }
        let pending = self.ledger.snapshot();
        let running = &registry.running;
        registry.confirmed.retain(|_, remote_id| {
            running.iter().any(|entry| entry.interval.id == *remote_id)
                || pending
                    .iter()
                    .any(|operation| operation.target.interval_id.as_deref() == Some(remote_id.as_str()))
        });
    }

    fn lock_registry(&self) -> MutexGuard<'_, IntervalRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_task_id(task_id: &str) -> Result<(), InfraError> {
    if task_id.trim().is_empty() {
        return Err(InfraError::Validation("task id must not be empty".to_string()));
    }
    Ok(())
}

fn expect_interval(
    response: RemoteResponse,
    operation: &NewOperation,
) -> Result<TimedInterval, InfraError> {
    match response {
        RemoteResponse::Interval(interval) => Ok(interval),
        RemoteResponse::Deleted | RemoteResponse::Unidentified => {
            Err(InfraError::InvalidResponse(format!(
                "{} {} was accepted without a usable time entry",
                operation.method.as_http_method(),
                operation.target.endpoint()
            )))
        }
    }
}
