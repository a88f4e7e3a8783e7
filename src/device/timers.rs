//! Debounce and confirmation timers of one device, kept in a single `DelayQueue`
//! so the device task can wait on all of them at once.

use std::future::poll_fn;
use std::time::Duration;
use tokio_util::time::{delay_queue::Key, DelayQueue};

use crate::confirm::PublisherId;
use crate::dispatch::HandlerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Debounce window of a handler elapsed
    Debounce(HandlerId),
    /// Confirmation period of a publisher elapsed
    Confirmation(PublisherId),
}

/// Owners keep the key of their live timer in an `Option<Key>` slot; the slot
/// must be cleared when the timer fires.
#[derive(Default)]
pub struct Timers {
    queue: DelayQueue<TimerKind>,
}

impl Timers {
    /// Starts the timer of `slot`, restarting it if one is already running.
    pub fn arm(&mut self, slot: &mut Option<Key>, kind: TimerKind, after: Duration) {
        match slot {
            Some(key) => self.queue.reset(key, after),
            None => *slot = Some(self.queue.insert(kind, after)),
        }
    }

    pub fn cancel(&mut self, slot: &mut Option<Key>) {
        if let Some(key) = slot.take() {
            self.queue.try_remove(&key);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Next timer to fire; `None` once no timer is pending.
    pub async fn next_expired(&mut self) -> Option<TimerKind> {
        poll_fn(|cx| self.queue.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn rearming_restarts_the_window() {
        let mut timers = Timers::default();
        let mut slot = None;
        let start = Instant::now();

        timers.arm(&mut slot, TimerKind::Debounce(0), Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(60)).await;
        timers.arm(&mut slot, TimerKind::Debounce(0), Duration::from_millis(100));

        assert_eq!(timers.next_expired().await, Some(TimerKind::Debounce(0)));
        assert!(start.elapsed() >= Duration::from_millis(160));
        assert_eq!(timers.next_expired().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_never_fire() {
        let mut timers = Timers::default();
        let mut slot = None;
        timers.arm(&mut slot, TimerKind::Confirmation(3), Duration::from_secs(1));
        timers.cancel(&mut slot);
        assert!(slot.is_none());
        assert!(timers.is_empty());
        assert_eq!(timers.next_expired().await, None);
    }
}
