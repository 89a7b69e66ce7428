//! Library-wide teardown signal.
//!
//! Blocking waits in the comms layer poll a [`Receiver`] so a process-level
//! shutdown (signal handler, abnormal library unload) can cut every retry
//! loop short. Constructed explicitly and passed down; [`global`] exists for
//! entry points that have nothing to thread it through.

use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc, OnceLock,
};

#[derive(Debug, Clone)]
pub struct Sender(Arc<AtomicBool>);

#[derive(Debug, Clone)]
pub struct Receiver(Arc<AtomicBool>);

pub fn channel() -> (Sender, Receiver) {
    let flag = Arc::new(AtomicBool::new(false));
    (Sender(flag.clone()), Receiver(flag))
}

impl Sender {
    pub fn trip(&self) {
        self.0.store(true, Relaxed);
    }

    pub fn subscribe(&self) -> Receiver {
        Receiver(self.0.clone())
    }
}

impl Receiver {
    pub fn is_tripped(&self) -> bool {
        self.0.load(Relaxed)
    }
}

/// The process-wide trip wire for entry points without an explicit one.
pub fn global() -> &'static Sender {
    static GLOBAL: OnceLock<Sender> = OnceLock::new();
    GLOBAL.get_or_init(|| channel().0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_once_for_all_receivers() {
        let (tx, rx) = channel();
        let rx2 = tx.subscribe();
        assert!(!rx.is_tripped());
        tx.trip();
        assert!(rx.is_tripped());
        assert!(rx2.is_tripped());
    }
}
