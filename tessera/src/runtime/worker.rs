use crate::context;
use crate::runtime::Handle;
use crate::runtime::executor::{Scheduler, WorkerState};
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::task::Task;
use crate::utils::{Deadline, ScopeGuard};
use std::ops::ControlFlow;
use std::sync::Arc;

/// Loop state of one worker thread.
pub(crate) struct Worker {
    id: usize,
    sched: Arc<Scheduler>,
    ticker: Ticker,
    data: LoopData,
}

impl Worker {
    pub(crate) fn new(id: usize, handle: Handle) -> Self {
        let sched = Arc::clone(&*handle);
        let data = LoopData {
            global_queue_interval: sched.cfg.global_queue_interval,
            pop_global_queue: false,
        };

        Self {
            id,
            sched,
            ticker: Ticker::new(),
            data,
        }
    }

    pub(crate) fn run(mut self) {
        let _ctx = context::enter_worker(self.id);

        let sched = Arc::clone(&self.sched);
        let id = self.id;
        let _stopped = ScopeGuard::new(|| {
            sched.clear_idle(id);
            sched.slots[id].set_state(WorkerState::Stopped);
            tracing::debug!(worker_id = id, "worker stopped");
        });

        tracing::debug!(worker_id = id, "worker started");

        loop {
            if let Some(task) = self.find_task().or_else(|| self.park()) {
                sched.slots[id].set_state(WorkerState::Running);
                sched.execute(id, task);
            }

            let events = self.ticker.tick(&*sched, &mut self.data);
            if let ControlFlow::Break(()) = self.process_ticker_events(events) {
                break;
            }
        }
    }

    fn process_ticker_events(&mut self, events: TickerEvents) -> ControlFlow<()> {
        if events.contains(TickerEvents::SHUTDOWN) {
            return ControlFlow::Break(());
        }

        if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
            self.data.pop_global_queue = true;
        }

        if events.contains(TickerEvents::POLL_WAIT_SET) {
            self.sched.poll_wait_set(self.id);
        }

        ControlFlow::Continue(())
    }

    /// Own queue (newest first), then the submission queue, then peers.
    /// Every `global_queue_interval` ticks the submission queue goes first.
    fn find_task(&mut self) -> Option<Task> {
        let sched = &self.sched;

        if std::mem::take(&mut self.data.pop_global_queue)
            && let Some(task) = sched.pop_injector()
        {
            return Some(task);
        }

        sched.slots[self.id]
            .queue
            .pop()
            .or_else(|| sched.pop_injector())
            .or_else(|| self.steal())
    }

    /// Probes up to `theft_victims` peers starting at a random one and takes
    /// a batch of the oldest tasks this worker may run.
    fn steal(&self) -> Option<Task> {
        let sched = &self.sched;
        let n = sched.worker_count();
        if n == 1 {
            return None;
        }

        let peers = n - 1;
        let offset = fastrand::usize(..peers);

        for k in 0..sched.cfg.theft_victims().min(peers) {
            let victim = (self.id + 1 + (offset + k) % peers) % n;
            let victim_queue = &sched.slots[victim].queue;

            let mut batch = victim_queue.steal(self.id, sched.cfg.max_theft_task_count);
            if batch.is_empty() {
                continue;
            }

            let first = batch.remove(0);
            let slot = &sched.slots[self.id];
            slot.note_stolen(batch.len() + 1);

            tracing::trace!(
                worker_id = self.id,
                victim,
                count = batch.len() + 1,
                "stole tasks"
            );

            if !batch.is_empty() {
                slot.queue.push_batch(batch);
            }

            // The victim still has a backlog, let another idle peer help.
            if !victim_queue.is_empty() {
                sched.wake_one_idle();
            }

            return Some(first);
        }

        None
    }

    /// Blocks until there may be work. Returns a task found while re-checking
    /// after advertising as idle.
    ///
    /// The first idle worker takes the designated waiter role and blocks on
    /// the wait-set, so pending WAIT tasks resolve on their event or deadline.
    /// Everybody else blocks on its own signal.
    fn park(&mut self) -> Option<Task> {
        let sched = Arc::clone(&self.sched);
        let id = self.id;
        let slot = &sched.slots[id];

        slot.set_state(WorkerState::Idle);
        sched.mark_idle(id);

        // Anything queued before our idle bit was visible must be seen here.
        if sched.is_shutdown() {
            sched.clear_idle(id);
            return None;
        }

        if let Some(task) = self.find_task() {
            sched.clear_idle(id);
            return Some(task);
        }

        match sched.wait_set.try_acquire_waiter(id) {
            Some(token) => {
                slot.set_state(WorkerState::Parked);

                // A peer may have claimed our idle bit before we held the
                // token, in which case it posted to our own signal.
                if !slot.signal.take() {
                    tracing::trace!(worker_id = id, pending = sched.wait_set.pending(), "wait");
                    token.wait(Deadline::Infinite);
                }

                drop(token);
                sched.clear_idle(id);
                slot.set_state(WorkerState::Idle);
                sched.poll_wait_set(id);

                // About to run work, hand the waiter role to an idle peer.
                if sched.wait_set.pending() > 0 && !slot.queue.is_empty() {
                    sched.wake_one_idle();
                }
            }
            None => {
                slot.set_state(WorkerState::Parked);
                tracing::trace!(worker_id = id, "park");
                slot.signal.wait(Deadline::Infinite);
                sched.clear_idle(id);
                slot.set_state(WorkerState::Idle);
            }
        }

        None
    }
}

#[derive(Debug)]
struct LoopData {
    global_queue_interval: u32,
    pop_global_queue: bool,
}

impl TickerData for LoopData {
    type Context = Scheduler;

    fn update_and_check(&mut self, sched: &Scheduler, tick: u32) -> TickerEvents {
        if sched.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        let mut events = TickerEvents::empty();
        let interval_hit = tick.is_multiple_of(self.global_queue_interval);

        if interval_hit {
            events.insert(TickerEvents::POP_GLOBAL_QUEUE);
        }

        // Without a designated waiter, busy workers resolve waits themselves.
        let waits = &sched.wait_set;
        if waits.pending() > 0 && !waits.has_waiter() && (interval_hit || waits.take_signal()) {
            events.insert(TickerEvents::POLL_WAIT_SET);
        }

        events
    }
}
