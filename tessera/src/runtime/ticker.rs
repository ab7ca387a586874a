use bitflags::bitflags;

#[derive(Debug, Default)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Implemented by the worker loop state. The ticker only counts; deciding
/// which maintenance to run on a given tick is left to the data.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Check the injector before the local queue on the next lookup.
        const POP_GLOBAL_QUEUE = 1;

        /// Resolve pending WAIT tasks whose event fired or deadline passed.
        const POLL_WAIT_SET = 1 << 1;

        /// The executor is shutting down.
        const SHUTDOWN = 1 << 2;
    }
}
