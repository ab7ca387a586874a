use std::time::{Duration, Instant};

/// Absolute point in time after which a blocking operation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Deadline {
    /// Absolute instant. An instant in the past means "poll once".
    At(Instant),

    /// Wait forever.
    #[default]
    Infinite,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        // `checked_add` fails for absurd timeouts, treat those as infinite.
        Instant::now()
            .checked_add(timeout)
            .map_or(Deadline::Infinite, Deadline::At)
    }

    pub fn immediate() -> Self {
        Deadline::At(Instant::now())
    }

    pub fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::At(at) => Some(*at),
            Deadline::Infinite => None,
        }
    }

    pub fn has_elapsed(&self) -> bool {
        self.instant().is_some_and(|at| Instant::now() >= at)
    }

    /// Earliest of the two deadlines. `Infinite` orders after every instant.
    pub fn earliest(self, other: Deadline) -> Deadline {
        std::cmp::min(self, other)
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Deadline::after(timeout)
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::At(at)
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(Deadline::Infinite, Deadline::after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinite_orders_last() {
        let at = Deadline::after(Duration::from_secs(1));
        assert_eq!(at.earliest(Deadline::Infinite), at);
        assert_eq!(Deadline::Infinite.earliest(at), at);
        assert_eq!(
            Deadline::Infinite.earliest(Deadline::Infinite),
            Deadline::Infinite
        );
    }

    #[test]
    fn test_elapsed() {
        assert!(Deadline::immediate().has_elapsed());
        assert!(!Deadline::Infinite.has_elapsed());
        assert!(!Deadline::after(Duration::from_secs(60)).has_elapsed());
        assert_eq!(Deadline::from(None), Deadline::Infinite);
    }
}
