use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Owner of a background task that fires a callback on a fixed period.
///
/// The first tick happens one period after spawning and missed ticks are
/// skipped. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct RepeatingTaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl RepeatingTaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .join
                .as_ref()
                .is_some_and(|join| !join.is_finished())
    }

    /// Requests cancellation without waiting for the task to exit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the task and waits until it has exited.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(error) = join.await {
                warn!(task = self.name, %error, "repeating task ended abnormally");
            }
        }
    }
}

impl Drop for RepeatingTaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn spawn_repeating<F>(name: &'static str, period: Duration, mut on_tick: F) -> RepeatingTaskHandle
where
    F: FnMut() + Send + 'static,
{
    let period = period.max(MIN_PERIOD);
    let cancel = CancellationToken::new();
    let cancelled = cancel.clone();

    let join = tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(task = name, period_ms = period.as_millis() as u64, "repeating task started");
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticks.tick() => on_tick(),
            }
        }
        debug!(task = name, "repeating task stopped");
    });

    RepeatingTaskHandle {
        name,
        cancel,
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_repeating("test", Duration::from_secs(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_repeating("test", Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(handle.is_running());
        handle.stop().await;
        let after_stop = ticks.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
        assert_eq!(after_stop, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_repeating("test", Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
