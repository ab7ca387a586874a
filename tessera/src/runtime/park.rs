use crate::utils::Deadline;
use parking_lot::{Condvar, Mutex};

/// Binary wake signal.
///
/// `notify` latches a flag under the lock, so a notification that races
/// ahead of `wait` is never lost: the next `wait` consumes it and returns
/// immediately.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cond.notify_one();
    }

    /// Blocks until notified or `deadline` passes. Returns whether a
    /// notification was consumed.
    pub(crate) fn wait(&self, deadline: Deadline) -> bool {
        let mut notified = self.notified.lock();

        while !*notified {
            match deadline.instant() {
                None => self.cond.wait(&mut notified),
                Some(at) => {
                    if self.cond.wait_until(&mut notified, at).timed_out() {
                        break;
                    }
                }
            }
        }

        std::mem::replace(&mut *notified, false)
    }

    /// Consumes a pending notification without blocking.
    pub(crate) fn take(&self) -> bool {
        std::mem::replace(&mut *self.notified.lock(), false)
    }

    #[cfg(test)]
    pub(crate) fn is_notified(&self) -> bool {
        *self.notified.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let signal = Signal::new();
        signal.notify();
        assert!(signal.is_notified());
        assert!(signal.wait(Deadline::Infinite));
        assert!(!signal.is_notified());
    }

    #[test]
    fn test_wait_times_out() {
        let signal = Signal::new();
        let start = Instant::now();
        assert!(!signal.wait(Deadline::after(Duration::from_millis(10))));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_cross_thread_wake() {
        let signal = Arc::new(Signal::new());
        let waker = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                signal.notify();
            })
        };

        assert!(signal.wait(Deadline::after(Duration::from_secs(5))));
        waker.join().unwrap();
        assert!(!signal.take());
    }
}
