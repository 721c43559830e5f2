//! Ring timeout: a single-shot, cancellable delay that delivers
//! `SignalEvent::RingTimeout` into the controller's event queue.
//!
//! Each `arm` gets a fresh schedule id. The shared slot holds the one
//! schedule allowed to fire together with the token of its sleeping task.
//! Arming, firing and cancelling all go through that one lock and
//! compare-and-clear it, so once `cancel` returns the timer can no longer
//! enqueue anything. A fire that won the race has already enqueued its
//! event; the controller absorbs it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SignalEvent;

/// Proof of one armed schedule. Consumed by [`RingTimer::cancel`].
#[derive(Debug)]
pub struct TimerToken {
    id: u64,
    cancel: CancellationToken,
}

impl TimerToken {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The schedule currently allowed to fire.
struct Schedule {
    id: u64,
    sleeper: CancellationToken,
}

type Slot = Arc<Mutex<Option<Schedule>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Schedule>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct RingTimer {
    slot: Slot,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<SignalEvent>,
}

impl RingTimer {
    pub fn new(events: mpsc::UnboundedSender<SignalEvent>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Schedule a `RingTimeout` after `duration`, replacing any schedule
    /// that is still pending.
    pub fn arm(&self, duration: Duration) -> TimerToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        {
            let mut slot = lock(&self.slot);
            let schedule = Schedule {
                id,
                sleeper: cancel.clone(),
            };
            if let Some(previous) = slot.replace(schedule) {
                previous.sleeper.cancel();
                tracing::debug!("Ring timer #{} superseded by #{}", previous.id, id);
            }
        }

        let slot = Arc::clone(&self.slot);
        let events = self.events.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = task_cancel.cancelled() => {
                    tracing::debug!("Ring timer #{} cancelled", id);
                }
                _ = tokio::time::sleep(duration) => {
                    let mut slot = lock(&slot);
                    if slot.as_ref().map(|s| s.id) == Some(id) {
                        *slot = None;
                        tracing::info!("Ring timer #{} fired after {:?}", id, duration);
                        if events.send(SignalEvent::RingTimeout).is_err() {
                            tracing::debug!("Ring timer #{} fired into a closed queue", id);
                        }
                    }
                }
            }
        });

        tracing::debug!("Ring timer #{} armed for {:?}", id, duration);
        TimerToken { id, cancel }
    }

    /// Cancel the schedule behind `token`.
    ///
    /// Returns true if the schedule was still pending. False means it already
    /// fired or was replaced; either way nothing more will be delivered for it.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let cleared = {
            let mut slot = lock(&self.slot);
            if slot.as_ref().map(|s| s.id) == Some(token.id) {
                *slot = None;
                true
            } else {
                false
            }
        };
        token.cancel.cancel();
        tracing::debug!("Ring timer #{} cancel (pending={})", token.id, cleared);
        cleared
    }

    /// Cancel whatever is armed. Safe to call any number of times.
    pub fn disarm(&self) {
        if let Some(schedule) = lock(&self.slot).take() {
            schedule.sleeper.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

impl Drop for RingTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> (RingTimer, mpsc::UnboundedReceiver<SignalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RingTimer::new(tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let (timer, mut rx) = timer();
        let _token = timer.arm(Duration::from_secs(35));
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(34)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), SignalEvent::RingTimeout);
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire() {
        let (timer, mut rx) = timer();
        let token = timer.arm(Duration::from_secs(35));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(timer.cancel(token));
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let (timer, mut rx) = timer();
        let token = timer.arm(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!timer.cancel(token));
        assert_eq!(rx.try_recv().unwrap(), SignalEvent::RingTimeout);
        timer.disarm();
        timer.disarm();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_schedule() {
        let (timer, mut rx) = timer();
        let first = timer.arm(Duration::from_secs(10));
        let second = timer.arm(Duration::from_secs(20));
        assert_ne!(first.id(), second.id());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(rx.try_recv().is_err());
        // The replaced schedule is no longer pending.
        assert!(!timer.cancel(first));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv().unwrap(), SignalEvent::RingTimeout);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_disarms() {
        let (timer, mut rx) = timer();
        let _token = timer.arm(Duration::from_secs(1));
        drop(timer);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_arm_leaves_one_live_schedule() {
        for _ in 0..50 {
            let (timer, mut rx) = timer();
            let timer = Arc::new(timer);

            let arms: Vec<_> = (0..2)
                .map(|_| {
                    let timer = Arc::clone(&timer);
                    tokio::spawn(async move { timer.arm(Duration::from_millis(10)) })
                })
                .collect();
            for arm in arms {
                arm.await.unwrap();
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!timer.is_armed(), "armed schedule never fired");
            assert_eq!(rx.try_recv().unwrap(), SignalEvent::RingTimeout);
            assert!(rx.try_recv().is_err());
        }
    }
}
