use crate::application::repeating_task::{spawn_repeating, RepeatingTaskHandle};
use crate::application::{system_clock, NowProvider};
use crate::domain::models::{ActiveSession, Task, TimedInterval};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Single cell holding the interval currently running process-wide.
///
/// The mutation service is the only writer of the session itself; the ticker
/// only refreshes `elapsed_seconds`. Readers either subscribe or take a snapshot.
pub struct SessionTracker {
    sender: watch::Sender<Option<ActiveSession>>,
    now_provider: NowProvider,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender,
            now_provider: system_clock(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn set_active(&self, task: &Task, interval: TimedInterval, provisional: bool) -> ActiveSession {
        let session = ActiveSession {
            task: task.clone(),
            elapsed_seconds: interval.elapsed_seconds_at((self.now_provider)()),
            interval,
            provisional,
        };
        self.sender.send_replace(Some(session.clone()));
        info!(
            task_id = %session.task.id,
            interval_id = %session.interval.id,
            provisional,
            "active session started"
        );
        session
    }

    pub fn clear(&self) -> Option<ActiveSession> {
        let previous = self.sender.send_replace(None);
        if let Some(session) = previous.as_ref() {
            info!(
                task_id = %session.task.id,
                interval_id = %session.interval.id,
                "active session cleared"
            );
        }
        previous
    }

    /// Clears the session only if it tracks `interval_id`.
    pub fn clear_if(&self, interval_id: &str) -> bool {
        let cleared = self.sender.send_if_modified(|current| {
            let matches = current
                .as_ref()
                .is_some_and(|session| session.interval.id == interval_id);
            if matches {
                *current = None;
            }
            matches
        });
        if cleared {
            info!(interval_id, "active session cleared");
        }
        cleared
    }

    /// Swaps a provisional interval for its remote-confirmed counterpart.
    pub fn confirm_interval(&self, local_id: &str, confirmed: TimedInterval) -> bool {
        let now = (self.now_provider)();
        self.sender.send_if_modified(|current| match current.as_mut() {
            Some(session) if session.interval.id == local_id => {
                session.elapsed_seconds = confirmed.elapsed_seconds_at(now);
                session.interval = confirmed;
                session.provisional = false;
                true
            }
            _ => false,
        })
    }

    pub fn snapshot(&self) -> Option<ActiveSession> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveSession>> {
        self.sender.subscribe()
    }

    /// Recomputes the elapsed time and republishes; a no-op without a session.
    pub fn tick(&self) {
        let now = (self.now_provider)();
        self.sender.send_if_modified(|current| match current.as_mut() {
            Some(session) => {
                session.elapsed_seconds = session.interval.elapsed_seconds_at(now);
                true
            }
            None => false,
        });
    }

    pub fn start_ticker(self: &Arc<Self>, period: Duration) -> RepeatingTaskHandle {
        let tracker = Arc::clone(self);
        debug!(period_ms = period.as_millis() as u64, "starting session ticker");
        spawn_repeating("session-ticker", period, move || tracker.tick())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::Mutex;

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-16T09:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn manual_clock(start: DateTime<Utc>) -> (Arc<Mutex<DateTime<Utc>>>, NowProvider) {
        let now = Arc::new(Mutex::new(start));
        let reader = Arc::clone(&now);
        let provider: NowProvider = Arc::new(move || *reader.lock().expect("clock lock"));
        (now, provider)
    }

    fn running_interval(id: &str) -> TimedInterval {
        let mut interval = TimedInterval::running(fixed_time(), "focus");
        interval.id = id.to_string();
        interval
    }

    #[test]
    fn tick_recomputes_elapsed_from_begin() {
        let (clock, provider) = manual_clock(fixed_time());
        let tracker = SessionTracker::new().with_now_provider(provider);
        tracker.set_active(&Task::new("t1", "Docs"), running_interval("time-1"), false);

        *clock.lock().expect("clock lock") = fixed_time() + ChronoDuration::seconds(90);
        tracker.tick();

        let session = tracker.snapshot().expect("session active");
        assert_eq!(session.elapsed_seconds, 90);
    }

    #[test]
    fn tick_without_session_does_not_publish() {
        let tracker = SessionTracker::new();
        let mut receiver = tracker.subscribe();
        tracker.tick();
        assert!(!receiver.has_changed().expect("sender alive"));
        assert!(receiver.borrow_and_update().is_none());
    }

    #[test]
    fn clear_if_ignores_other_intervals() {
        let tracker = SessionTracker::new();
        tracker.set_active(&Task::new("t1", "Docs"), running_interval("time-1"), false);

        assert!(!tracker.clear_if("time-2"));
        assert!(tracker.snapshot().is_some());
        assert!(tracker.clear_if("time-1"));
        assert!(tracker.snapshot().is_none());
    }

    #[test]
    fn confirm_interval_replaces_provisional_session() {
        let tracker = SessionTracker::new();
        tracker.set_active(&Task::new("t1", "Docs"), running_interval("local-1"), true);

        assert!(tracker.confirm_interval("local-1", running_interval("time-7")));
        let session = tracker.snapshot().expect("session active");
        assert_eq!(session.interval.id, "time-7");
        assert!(!session.provisional);
        assert!(!tracker.confirm_interval("local-1", running_interval("time-8")));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_republishes_every_period() {
        let (clock, provider) = manual_clock(fixed_time());
        let tracker = Arc::new(SessionTracker::new().with_now_provider(provider));
        tracker.set_active(&Task::new("t1", "Docs"), running_interval("time-1"), false);
        let mut receiver = tracker.subscribe();

        let handle = tracker.start_ticker(Duration::from_secs(1));
        *clock.lock().expect("clock lock") = fixed_time() + ChronoDuration::seconds(5);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(receiver.has_changed().expect("sender alive"));
        assert_eq!(
            receiver.borrow_and_update().as_ref().map(|session| session.elapsed_seconds),
            Some(5)
        );
        handle.stop().await;
    }
}
