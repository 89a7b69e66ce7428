//! Two-phase latch used to gate comms startup and teardown.
//!
//! A trigger variable moves through `inactive -> activated -> triggered`.
//! The state lives in a single-producer [`watch`] channel: the transition
//! methods are synchronous `send_modify` calls and the waits subscribe to
//! the channel, so there is no condition-variable lock to juggle. In
//! particular `reset` can trigger-then-deactivate atomically, where the
//! original condvar formulation had to drop its lock mid-reset to avoid
//! deadlocking against `trigger`.

use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct TriggerState {
    activated: bool,
    triggered: bool,
}

#[derive(Debug)]
pub struct TriggerVariable {
    state: watch::Sender<TriggerState>,
}

impl Default for TriggerVariable {
    fn default() -> Self {
        TriggerVariable::new()
    }
}

impl TriggerVariable {
    pub fn new() -> Self {
        TriggerVariable { state: watch::channel(TriggerState::default()).0 }
    }

    /// Move the latch to the activated state.
    ///
    /// Returns false if it was already active. Activation clears any stale
    /// trigger from a previous cycle.
    pub fn activate(&self) -> bool {
        let mut newly_activated = false;
        self.state.send_if_modified(|s| {
            if s.activated {
                false
            } else {
                s.activated = true;
                s.triggered = false;
                newly_activated = true;
                true
            }
        });
        newly_activated
    }

    /// Fire the trigger. Has no effect and returns false while inactive.
    pub fn trigger(&self) -> bool {
        let mut accepted = false;
        self.state.send_if_modified(|s| {
            if s.activated {
                accepted = true;
                if !s.triggered {
                    s.triggered = true;
                    return true;
                }
            }
            false
        });
        accepted
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().activated
    }

    pub fn is_triggered(&self) -> bool {
        self.state.borrow().triggered
    }

    /// Return the latch to inactive, firing the trigger first if the cycle
    /// was still pending so that concurrent [`wait`](Self::wait) calls
    /// observe a triggered state rather than hanging.
    pub fn reset(&self) {
        self.state.send_if_modified(|s| {
            if s.activated && !s.triggered {
                s.triggered = true;
            }
            let changed = s.activated;
            s.activated = false;
            changed
        });
    }

    /// Wait until the trigger fires. Returns immediately if the latch is
    /// inactive or already triggered.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        loop {
            {
                let s = *rx.borrow_and_update();
                if !s.activated || s.triggered {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the trigger with a timeout; true when the wait condition
    /// held before the timeout.
    pub async fn wait_for(&self, duration: Duration) -> bool {
        tokio::time::timeout(duration, self.wait()).await.is_ok()
    }

    /// Wait until the latch is activated.
    pub async fn wait_activation(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if rx.borrow_and_update().activated {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn wait_for_activation(&self, duration: Duration) -> bool {
        tokio::time::timeout(duration, self.wait_activation()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn activate_then_trigger() {
        let tv = TriggerVariable::new();
        assert!(!tv.trigger(), "trigger before activation must be refused");
        assert!(tv.activate());
        assert!(!tv.activate(), "second activation is a no-op");
        assert!(tv.trigger());
        assert!(tv.is_triggered());
        // triggering again still reports success on an active latch
        assert!(tv.trigger());
    }

    #[test]
    fn reset_deactivates_and_blocks_triggers() {
        let tv = TriggerVariable::new();
        tv.activate();
        tv.reset();
        assert!(!tv.is_active());
        assert!(!tv.trigger(), "trigger after reset must be refused until re-activation");
        assert!(tv.activate());
        assert!(!tv.is_triggered(), "activation starts a fresh cycle");
    }

    #[tokio::test]
    async fn wait_observes_trigger() {
        let tv = Arc::new(TriggerVariable::new());
        tv.activate();
        let waiter = {
            let tv = tv.clone();
            tokio::spawn(async move {
                tv.wait().await;
                tv.is_triggered()
            })
        };
        tokio::task::yield_now().await;
        tv.trigger();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_times_out_without_trigger() {
        let tv = TriggerVariable::new();
        tv.activate();
        assert!(!tv.wait_for(Duration::from_millis(20)).await);
        tv.trigger();
        assert!(tv.wait_for(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn reset_releases_pending_waiters() {
        let tv = Arc::new(TriggerVariable::new());
        tv.activate();
        let waiter = {
            let tv = tv.clone();
            tokio::spawn(async move { tv.wait().await })
        };
        tokio::task::yield_now().await;
        tv.reset();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must be released by reset")
            .unwrap();
    }
}
