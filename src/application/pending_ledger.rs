use crate::application::{system_clock, NowProvider};
use crate::domain::models::{NewOperation, OperationMethod, PendingOperation, TargetPath, TimedInterval};
use crate::infrastructure::durable_store::DurableStore;
use crate::infrastructure::time_entries_client::RemoteResponse;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

/// What happened to an operation after the remote accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Removed,
    /// The payload was amended while the create was in flight; the operation
    /// now updates the created record instead.
    Rewritten(PendingOperation),
    /// The operation had already left the ledger.
    Absent,
}

/// Result of withdrawing an operation the caller no longer wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Withdrawal {
    Removed(PendingOperation),
    /// A drain is delivering it; the outcome is resolved when it settles.
    InFlight,
    Absent,
}

#[derive(Debug, Default)]
struct Deliveries {
    in_flight: HashSet<String>,
    withdrawn: HashSet<String>,
}

/// Ordered record of every mutation the remote has not confirmed yet.
///
/// The in-memory sequence is authoritative. Every change is written through
/// to the durable store on a best-effort basis and then published to
/// subscribers; a failed write is logged and never surfaces to callers.
pub struct PendingLedger<S>
where
    S: DurableStore,
{
    store: Arc<S>,
    storage_key: String,
    operations: Mutex<Vec<PendingOperation>>,
    deliveries: Mutex<Deliveries>,
    publisher: watch::Sender<Vec<PendingOperation>>,
    now_provider: NowProvider,
}

impl<S> PendingLedger<S>
where
    S: DurableStore,
{
    /// Restores the last persisted sequence. Missing or unreadable data yields
    /// an empty ledger.
    pub fn load(store: Arc<S>, storage_key: impl Into<String>) -> Self {
        let storage_key = storage_key.into();
        let operations = read_persisted(store.as_ref(), &storage_key);
        if !operations.is_empty() {
            info!(
                storage_key = %storage_key,
                pending = operations.len(),
                "restored pending operations"
            );
        }
        let (publisher, _) = watch::channel(operations.clone());

        Self {
            store,
            storage_key,
            operations: Mutex::new(operations),
            deliveries: Mutex::new(Deliveries::default()),
            publisher,
            now_provider: system_clock(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn append(&self, operation: NewOperation) -> PendingOperation {
        let pending = PendingOperation {
            id: next_id("req"),
            method: operation.method,
            target: operation.target,
            payload: operation.payload,
            enqueued_at: (self.now_provider)(),
            retry_count: 0,
        };

        let mut operations = self.lock_operations();
        operations.push(pending.clone());
        self.persist_and_publish(&operations);
        drop(operations);

        info!(
            operation_id = %pending.id,
            method = pending.method.as_http_method(),
            endpoint = %pending.target.endpoint(),
            "queued pending operation"
        );
        pending
    }

    pub fn remove(&self, operation_id: &str) -> Option<PendingOperation> {
        let mut operations = self.lock_operations();
        let index = operations
            .iter()
            .position(|operation| operation.id == operation_id)?;
        let removed = operations.remove(index);
        self.persist_and_publish(&operations);
        Some(removed)
    }

    /// Explicit removal requested by a caller, typically for an exhausted operation.
    pub fn clear(&self, operation_id: &str) -> Option<PendingOperation> {
        let removed = self.remove(operation_id);
        if let Some(operation) = removed.as_ref() {
            info!(
                operation_id = %operation.id,
                retry_count = operation.retry_count,
                "cleared pending operation"
            );
        }
        removed
    }

    pub fn clear_all(&self) -> usize {
        let mut operations = self.lock_operations();
        let cleared = operations.len();
        operations.clear();
        self.persist_and_publish(&operations);
        info!(cleared, "cleared all pending operations");
        cleared
    }

    /// A withdrawn operation that fails is dropped instead of counted.
    pub fn increment_retry(&self, operation_id: &str) -> Vec<PendingOperation> {
        let mut operations = self.lock_operations();
        let withdrawn = self.finish_delivery(operation_id);
        if withdrawn {
            operations.retain(|operation| operation.id != operation_id);
            self.persist_and_publish(&operations);
            debug!(operation_id, "dropped withdrawn operation after failed delivery");
            return operations.clone();
        }
        let mut changed = false;
        for operation in operations.iter_mut() {
            if operation.id == operation_id {
                operation.retry_count = operation.retry_count.saturating_add(1);
                changed = true;
            }
        }
        if changed {
            self.persist_and_publish(&operations);
        }
        operations.clone()
    }

    /// Resolves an operation the remote has just accepted.
    ///
    /// `sent` is the copy that was delivered. If the stored copy differs and a
    /// create produced a remote id, the delivered state is stale, so the entry
    /// is rewritten into an update of the created record.
    ///
    /// A create withdrawn while in flight becomes a delete of the record it
    /// produced.
    pub fn settle(&self, sent: &PendingOperation, response: &RemoteResponse) -> Settlement {
        let mut operations = self.lock_operations();
        let withdrawn = self.finish_delivery(&sent.id);
        let Some(index) = operations
            .iter()
            .position(|operation| operation.id == sent.id)
        else {
            return Settlement::Absent;
        };

        if withdrawn {
            let created_id = match (sent.method, response) {
                (OperationMethod::Create, RemoteResponse::Interval(created))
                    if !created.id.trim().is_empty() =>
                {
                    Some(created.id.clone())
                }
                _ => None,
            };
            let Some(created_id) = created_id else {
                operations.remove(index);
                self.persist_and_publish(&operations);
                return Settlement::Removed;
            };
            let current = &mut operations[index];
            current.method = OperationMethod::Delete;
            current.target = TargetPath::time(current.target.task_id.clone(), created_id);
            current.payload = None;
            current.retry_count = 0;
            let rewritten = current.clone();
            self.persist_and_publish(&operations);
            info!(
                operation_id = %rewritten.id,
                endpoint = %rewritten.target.endpoint(),
                "rewrote withdrawn create into delete"
            );
            return Settlement::Rewritten(rewritten);
        }

        let amended_remote_id = match (sent.method, response) {
            (OperationMethod::Create, RemoteResponse::Interval(created))
                if operations[index].payload != sent.payload && !created.id.trim().is_empty() =>
            {
                Some(created.id.clone())
            }
            _ => None,
        };

        let Some(remote_id) = amended_remote_id else {
            operations.remove(index);
            self.persist_and_publish(&operations);
            return Settlement::Removed;
        };

        let current = &mut operations[index];
        let mut payload = current.payload.take();
        if let Some(payload) = payload.as_mut() {
            payload.id = remote_id.clone();
        }
        current.method = OperationMethod::Update;
        current.target = TargetPath::time(current.target.task_id.clone(), remote_id);
        current.payload = payload;
        current.retry_count = 0;
        let rewritten = current.clone();
        self.persist_and_publish(&operations);
        info!(
            operation_id = %rewritten.id,
            endpoint = %rewritten.target.endpoint(),
            "rewrote amended create into update"
        );
        Settlement::Rewritten(rewritten)
    }

    /// Rewrites the body of an operation that has not been delivered yet.
    ///
    /// Returns false when the operation is no longer pending.
    pub fn replace_payload(&self, operation_id: &str, payload: TimedInterval) -> bool {
        let mut operations = self.lock_operations();
        let Some(operation) = operations
            .iter_mut()
            .find(|operation| operation.id == operation_id)
        else {
            return false;
        };
        operation.payload = Some(payload);
        self.persist_and_publish(&operations);
        debug!(operation_id, "amended pending operation payload");
        true
    }

    /// Hands out every operation below the retry cap for delivery and marks
    /// each one in flight until it settles or fails.
    pub fn checkout(&self, max_retries: u32) -> Vec<PendingOperation> {
        let operations = self.lock_operations();
        let mut deliveries = self.lock_deliveries();
        let eligible: Vec<PendingOperation> = operations
            .iter()
            .filter(|operation| !operation.is_exhausted(max_retries))
            .filter(|operation| !deliveries.withdrawn.contains(&operation.id))
            .cloned()
            .collect();
        deliveries
            .in_flight
            .extend(eligible.iter().map(|operation| operation.id.clone()));
        eligible
    }

    /// Ends every delivery still marked in flight, such as one whose attempt
    /// panicked. Withdrawn operations among them are dropped.
    pub fn release_deliveries(&self) {
        let mut operations = self.lock_operations();
        let mut deliveries = self.lock_deliveries();
        let released: Vec<String> = deliveries.in_flight.drain().collect();
        let before = operations.len();
        operations.retain(|operation| {
            !(released.contains(&operation.id) && deliveries.withdrawn.contains(&operation.id))
        });
        for operation_id in &released {
            deliveries.withdrawn.remove(operation_id);
        }
        if operations.len() != before {
            self.persist_and_publish(&operations);
        }
    }

    /// Removes an operation unless a drain is delivering it, in which case it
    /// is marked so that settling resolves it.
    pub fn withdraw(&self, operation_id: &str) -> Withdrawal {
        let mut operations = self.lock_operations();
        let Some(index) = operations
            .iter()
            .position(|operation| operation.id == operation_id)
        else {
            return Withdrawal::Absent;
        };
        let mut deliveries = self.lock_deliveries();
        if deliveries.in_flight.contains(operation_id) {
            deliveries.withdrawn.insert(operation_id.to_string());
            debug!(operation_id, "withdrew operation in flight");
            return Withdrawal::InFlight;
        }
        drop(deliveries);
        let removed = operations.remove(index);
        self.persist_and_publish(&operations);
        Withdrawal::Removed(removed)
    }

    pub fn get(&self, operation_id: &str) -> Option<PendingOperation> {
        self.lock_operations()
            .iter()
            .find(|operation| operation.id == operation_id)
            .cloned()
    }

    pub fn list_for_task(&self, task_id: &str) -> Vec<PendingOperation> {
        self.lock_operations()
            .iter()
            .filter(|operation| operation.target.belongs_to(task_id))
            .cloned()
            .collect()
    }

    pub fn exhausted(&self, max_retries: u32) -> Vec<PendingOperation> {
        self.lock_operations()
            .iter()
            .filter(|operation| operation.is_exhausted(max_retries))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PendingOperation> {
        self.lock_operations().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_operations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_operations().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PendingOperation>> {
        self.publisher.subscribe()
    }

    fn lock_operations(&self) -> MutexGuard<'_, Vec<PendingOperation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_deliveries(&self) -> MutexGuard<'_, Deliveries> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when the finished delivery had been withdrawn.
    fn finish_delivery(&self, operation_id: &str) -> bool {
        let mut deliveries = self.lock_deliveries();
        deliveries.in_flight.remove(operation_id);
        deliveries.withdrawn.remove(operation_id)
    }

    fn persist_and_publish(&self, operations: &[PendingOperation]) {
        match serde_json::to_string(operations) {
            Ok(blob) => {
                if let Err(error) = self.store.set(&self.storage_key, &blob) {
                    warn!(%error, storage_key = %self.storage_key, "failed to persist pending operations");
                }
            }
            Err(error) => {
                warn!(%error, "failed to serialize pending operations");
            }
        }
        self.publisher.send_replace(operations.to_vec());
    }
}

fn read_persisted<S>(store: &S, storage_key: &str) -> Vec<PendingOperation>
where
    S: DurableStore + ?Sized,
{
    let raw = match store.get(storage_key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(error) => {
            warn!(%error, storage_key, "failed to read pending operations; starting empty");
            return Vec::new();
        }
    };

    let parsed: Vec<PendingOperation> = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(%error, storage_key, "persisted pending operations are malformed; starting empty");
            return Vec::new();
        }
    };

    parsed
        .into_iter()
        .filter(|operation| match operation.validate() {
            Ok(()) => true,
            Err(reason) => {
                warn!(operation_id = %operation.id, %reason, "dropping invalid persisted operation");
                false
            }
        })
        .collect()
}
