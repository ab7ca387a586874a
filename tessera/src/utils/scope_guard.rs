/// Runs a closure when dropped, including while unwinding.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(on_drop: F) -> Self {
        ScopeGuard {
            on_drop: Some(on_drop),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop() {
        let hits = Cell::new(0);
        {
            let _guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_runs_while_unwinding() {
        let hits = Cell::new(0);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
            panic!("unwind");
        }));
        assert!(res.is_err());
        assert_eq!(hits.get(), 1);
    }
}
