//! Named timers.
//!
//! Components arm and cancel timers by name; firing is delivered to the
//! agent's event loop as a [`TimerEvent`]. Scheduling a name that is already
//! armed replaces the previous timer.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fire once after the delay
    Delay(Duration),
    /// Fire every period, first time one period from now
    Periodic(Duration),
    /// Fire once at the given instant (immediately if already past)
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub name: String,
}

pub trait Scheduler: Send + Sync {
    fn schedule(&self, name: &str, schedule: Schedule);
    fn cancel(&self, name: &str);
}

/// Timers backed by tokio tasks
pub struct TokioScheduler {
    events: mpsc::UnboundedSender<TimerEvent>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl TokioScheduler {
    /// Create the scheduler and the receiver its timers fire into
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                events,
                timers: Mutex::new(HashMap::new()),
                clock,
            },
            receiver,
        )
    }

    fn spawn_timer(&self, name: &str, schedule: Schedule) -> JoinHandle<()> {
        let events = self.events.clone();
        let event = TimerEvent {
            name: name.to_string(),
        };

        match schedule {
            Schedule::Delay(delay) => tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(event);
            }),
            Schedule::At(at) => {
                let delay = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(event);
                })
            }
            Schedule::Periodic(period) => tokio::spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut interval = tokio::time::interval_at(start, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if events.send(event.clone()).is_err() {
                        break;
                    }
                }
            }),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, name: &str, schedule: Schedule) {
        debug!(timer = name, ?schedule, "timer scheduled");
        let handle = self.spawn_timer(name, schedule);
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(previous) = timers.insert(name.to_string(), handle) {
                previous.abort();
            }
        }
    }

    fn cancel(&self, name: &str) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(handle) = timers.remove(name) {
                debug!(timer = name, "timer canceled");
                handle.abort();
            }
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }
}

/// Scheduler that only remembers what is armed; never fires
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    armed: Mutex<HashMap<String, Schedule>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(&self, name: &str) -> Option<Schedule> {
        self.armed.lock().ok().and_then(|armed| armed.get(name).cloned())
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, name: &str, schedule: Schedule) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(name.to_string(), schedule);
        }
    }

    fn cancel(&self, name: &str) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[tokio::test(start_paused = true)]
    async fn test_delay_timer_fires_once() {
        let (scheduler, mut events) = TokioScheduler::new(Arc::new(SystemClock));
        scheduler.schedule("once", Schedule::Delay(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(31)).await;
        let event = events.recv().await.expect("timer should fire");
        assert_eq!(event.name, "once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let (scheduler, mut events) = TokioScheduler::new(Arc::new(SystemClock));
        scheduler.schedule("retry", Schedule::Delay(Duration::from_secs(10)));
        scheduler.schedule("retry", Schedule::Delay(Duration::from_secs(100)));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(events.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(60)).await;
        let event = events.recv().await.expect("replacement timer should fire");
        assert_eq!(event.name, "retry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (scheduler, mut events) = TokioScheduler::new(Arc::new(SystemClock));
        scheduler.schedule("guard", Schedule::Delay(Duration::from_secs(5)));
        scheduler.cancel("guard");

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_recording_scheduler() {
        let scheduler = RecordingScheduler::new();
        scheduler.schedule("harvest", Schedule::Periodic(Duration::from_secs(300)));
        assert_eq!(
            scheduler.armed("harvest"),
            Some(Schedule::Periodic(Duration::from_secs(300)))
        );
        scheduler.cancel("harvest");
        assert!(scheduler.armed("harvest").is_none());
    }
}
