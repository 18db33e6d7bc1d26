use chrono::{DateTime, Utc};
use std::sync::Arc;

pub mod bootstrap;
pub mod pending_ledger;
pub mod repeating_task;
pub mod retry_scheduler;
pub mod runtime;
pub mod session_tracker;
pub mod time_tracking;

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub(crate) fn system_clock() -> NowProvider {
    Arc::new(Utc::now)
}
