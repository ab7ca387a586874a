use crate::context;
use crate::error::SchedError;
use crate::runtime::park::Signal;
use crate::utils::Deadline;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct EventInner {
    set: AtomicBool,

    /// Executor wake handles to notify on `set`. Drained on every `set`.
    subscribers: Mutex<Vec<Arc<Signal>>>,

    cond: Condvar,
}

/// Manual-reset event: the external wait source WAIT tasks block on and
/// FENCE tasks signal.
///
/// Once set, the event stays set until `reset`. Executors subscribe their
/// internal wake handle and are notified on `set`, they never poll.
#[derive(Clone, Default)]
pub struct Event(Arc<EventInner>);

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event that starts out set.
    pub fn new_set() -> Self {
        let event = Self::new();
        event.0.set.store(true, Ordering::Release);
        event
    }

    pub fn set(&self) {
        let subscribers = {
            let mut subscribers = self.0.subscribers.lock();
            self.0.set.store(true, Ordering::Release);
            self.0.cond.notify_all();
            std::mem::take(&mut *subscribers)
        };

        for signal in subscribers {
            signal.notify();
        }
    }

    pub fn reset(&self) {
        self.0.set.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.set.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the event is set or `deadline` passes.
    ///
    /// Not allowed on worker threads: a worker blocked here cannot run the
    /// task that would set the event. Use a WAIT task instead.
    pub fn wait(&self, deadline: impl Into<Deadline>) -> Result<(), SchedError> {
        if let Some(worker) = context::current_worker_id() {
            return Err(SchedError::invalid_state(format!(
                "blocking event wait on worker {}",
                worker
            )));
        }

        let deadline = deadline.into();
        let mut subscribers = self.0.subscribers.lock();

        while !self.is_set() {
            match deadline.instant() {
                None => self.0.cond.wait(&mut subscribers),
                Some(at) => {
                    if self.0.cond.wait_until(&mut subscribers, at).timed_out() && !self.is_set() {
                        return Err(SchedError::DeadlineExceeded);
                    }
                }
            }
        }

        Ok(())
    }

    /// Registers `signal` to be notified on the next `set`. Returns true,
    /// without registering, when the event is already set.
    pub(crate) fn subscribe(&self, signal: &Arc<Signal>) -> bool {
        let mut subscribers = self.0.subscribers.lock();
        if self.is_set() {
            return true;
        }

        if !subscribers.iter().any(|s| Arc::ptr_eq(s, signal)) {
            subscribers.push(Arc::clone(signal));
        }
        false
    }

    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(Event: Send, Sync, Clone);

    #[test]
    fn test_set_and_reset() {
        let event = Event::new();
        assert!(!event.is_set());

        event.set();
        assert!(event.is_set());
        assert!(event.wait(Deadline::immediate()).is_ok());

        event.reset();
        assert!(!event.is_set());
        assert!(matches!(
            event.wait(Deadline::immediate()),
            Err(SchedError::DeadlineExceeded)
        ));
    }

    #[test]
    fn test_subscribers_notified_once() {
        let event = Event::new();
        let signal = Arc::new(Signal::new());

        assert!(!event.subscribe(&signal));
        assert!(!event.subscribe(&signal), "duplicate subscription is a no-op");
        assert!(!signal.is_notified());

        event.set();
        assert!(signal.take());

        // Already set: nothing to subscribe to.
        assert!(event.subscribe(&signal));
        assert!(!signal.is_notified());
    }

    #[test]
    fn test_cross_thread_wait() {
        let event = Event::new();
        let setter = {
            let event = event.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                event.set();
            })
        };

        assert!(event.wait(Duration::from_secs(5)).is_ok());
        setter.join().unwrap();
    }
}
