use crate::application::pending_ledger::PendingLedger;
use crate::application::repeating_task::RepeatingTaskHandle;
use crate::application::retry_scheduler::RetryScheduler;
use crate::application::session_tracker::SessionTracker;
use crate::application::time_tracking::TimeEntryService;
use crate::infrastructure::config::QueueConfig;
use crate::infrastructure::credential_store::{resolve_api_token, CredentialStore};
use crate::infrastructure::durable_store::DurableStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::time_entries_client::{RemoteExecutor, ReqwestRemoteExecutor};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builds the HTTP executor from config and the resolved access token.
pub fn connect_remote<C, F>(
    config: &QueueConfig,
    credentials: &C,
    lookup: F,
) -> Result<ReqwestRemoteExecutor, InfraError>
where
    C: CredentialStore + ?Sized,
    F: Fn(&str) -> Option<String>,
{
    let token = resolve_api_token(credentials, lookup)?;
    ReqwestRemoteExecutor::new(config.api_base_url.clone(), token, config.request_timeout)
}

/// The running sync machinery: ledger, scheduler, session ticker and the
/// mutation service, plus the task that feeds scheduler confirmations back
/// into the service.
pub struct SyncRuntime<E, S>
where
    E: RemoteExecutor + 'static,
    S: DurableStore + 'static,
{
    service: Arc<TimeEntryService<E, S>>,
    scheduler: Arc<RetryScheduler<E, S>>,
    ledger: Arc<PendingLedger<S>>,
    repeating: Vec<RepeatingTaskHandle>,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

impl<E, S> SyncRuntime<E, S>
where
    E: RemoteExecutor + 'static,
    S: DurableStore + 'static,
{
    /// Must be called from within a tokio runtime.
    pub fn start(executor: Arc<E>, store: Arc<S>, config: &QueueConfig) -> Self {
        let ledger = Arc::new(PendingLedger::load(store, config.storage_key.clone()));
        let tracker = Arc::new(SessionTracker::new());
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::clone(&executor),
            Arc::clone(&ledger),
            config.max_retries,
            config.retry_period,
        ));
        let service = Arc::new(TimeEntryService::new(
            executor,
            Arc::clone(&ledger),
            Arc::clone(&tracker),
            config.max_retries,
        ));

        let cancel = CancellationToken::new();
        let forwarder = spawn_confirmation_forwarder(
            Arc::clone(&scheduler),
            Arc::clone(&service),
            cancel.clone(),
        );
        let repeating = vec![scheduler.start(), tracker.start_ticker(config.tick_period)];

        info!(
            pending = ledger.len(),
            exhausted = ledger.exhausted(config.max_retries).len(),
            "sync runtime started"
        );
        Self {
            service,
            scheduler,
            ledger,
            repeating,
            cancel,
            forwarder: Some(forwarder),
        }
    }

    pub fn service(&self) -> &Arc<TimeEntryService<E, S>> {
        &self.service
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler<E, S>> {
        &self.scheduler
    }

    pub fn ledger(&self) -> &Arc<PendingLedger<S>> {
        &self.ledger
    }

    pub async fn shutdown(mut self) {
        for handle in self.repeating.drain(..) {
            handle.stop().await;
        }
        self.cancel.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(error) = forwarder.await {
                warn!(%error, "confirmation forwarder ended abnormally");
            }
        }
        info!(pending = self.ledger.len(), "sync runtime stopped");
    }
}

impl<E, S> Drop for SyncRuntime<E, S>
where
    E: RemoteExecutor + 'static,
    S: DurableStore + 'static,
{
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_confirmation_forwarder<E, S>(
    scheduler: Arc<RetryScheduler<E, S>>,
    service: Arc<TimeEntryService<E, S>>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    E: RemoteExecutor + 'static,
    S: DurableStore + 'static,
{
    let mut confirmations = scheduler.subscribe_confirmations();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = confirmations.recv() => match received {
                    Ok(confirmation) => service.apply_confirmation(&confirmation).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "confirmation forwarder lagged behind the scheduler");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
