//! Cancellable deferred actions.
//!
//! Agents never block on a wait: the bid-collection window and the
//! progress delays are sleeper tasks that post an event back onto the
//! owning agent's channel. Every pending timer is tracked here so teardown
//! can cancel them all before the transport goes away.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Duration;

pub struct TimerRegistry<E> {
    tx: mpsc::Sender<E>,
    pending: HashMap<String, AbortHandle>,
}

impl<E: Send + 'static> TimerRegistry<E> {
    pub fn new(tx: mpsc::Sender<E>) -> Self {
        Self { tx, pending: HashMap::new() }
    }

    /// Post `event` to the owning agent after `delay`. Scheduling under an
    /// existing key replaces (cancels) the previous timer.
    pub fn schedule(&mut self, key: &str, delay: Duration, event: E) {
        self.cancel(key);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event).await;
        });
        self.pending.insert(key.to_string(), handle.abort_handle());
    }

    pub fn cancel(&mut self, key: &str) {
        if let Some(handle) = self.pending.remove(key) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.pending.get(key).is_some_and(|h| !h.is_finished())
    }
}

impl<E> Drop for TimerRegistry<E> {
    fn drop(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerRegistry::new(tx);

        timers.schedule("window", Duration::from_secs(10), "closed");
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(rx.recv().await, Some("closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerRegistry::new(tx);

        timers.schedule("window", Duration::from_secs(10), "closed");
        timers.cancel("window");
        tokio::time::advance(Duration::from_secs(20)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerRegistry::new(tx);

        timers.schedule("window", Duration::from_secs(10), "first");
        timers.schedule("window", Duration::from_secs(5), "second");
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(rx.recv().await, Some("second"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerRegistry::new(tx);

        timers.schedule("a", Duration::from_secs(1), 1);
        timers.schedule("b", Duration::from_secs(2), 2);
        timers.cancel_all();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(rx.try_recv().is_err());
        assert!(!timers.is_scheduled("a"));
    }
}
