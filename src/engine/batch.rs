//! Adaptive batch sizing under memory pressure.
//!
//! The engine starts each phase with an effectively unbounded batch limit
//! and polls an injectable [`MemoryProbe`] between rows. When the probe
//! reports pressure the phase is abandoned, the limit is halved, and the
//! phase restarts from the top of the current pass. The limit strictly
//! decreases on every retry, so the loop terminates: once it cannot shrink
//! below one key, the engine fails with an explicit "increase available
//! memory" error instead of looping.

use std::cell::Cell;

use log::warn;

use crate::error::{PivotError, PivotResult};

/// Decides when the engine should back off. Injectable so tests can
/// simulate pressure deterministically instead of relying on real
/// allocator behavior.
pub trait MemoryProbe {
    /// Called between rows with the number of keys currently held in
    /// memory. Returning `true` triggers a batch shrink and a phase
    /// restart.
    fn under_pressure(&self, keys_in_memory: usize) -> bool;
}

/// Default probe: never reports pressure. The batch limit alone bounds
/// the in-memory maps.
pub struct NoPressure;

impl MemoryProbe for NoPressure {
    fn under_pressure(&self, _keys_in_memory: usize) -> bool {
        false
    }
}

/// A probe with a fixed key budget.
pub struct KeyBudget(pub usize);

impl MemoryProbe for KeyBudget {
    fn under_pressure(&self, keys_in_memory: usize) -> bool {
        keys_in_memory > self.0
    }
}

/// Tracks the batch limit for one conversion job.
pub struct BatchController {
    limit: usize,
    probe: Box<dyn MemoryProbe>,
    last_polled: Cell<usize>,
}

impl BatchController {
    /// Practically unbounded: the first pass of every phase tries to take
    /// the whole dataset in one batch.
    pub const UNBOUNDED: usize = usize::MAX;

    pub fn new(initial_limit: Option<usize>, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            limit: initial_limit.unwrap_or(Self::UNBOUNDED).max(1),
            probe,
            last_polled: Cell::new(0),
        }
    }

    /// Current maximum number of distinct keys per in-memory batch.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Consult the probe. Returns the internal pressure signal, consumed
    /// by the phase retry loop.
    pub fn poll(&self, keys_in_memory: usize, phase: &'static str) -> PivotResult<()> {
        self.last_polled.set(keys_in_memory);
        if self.probe.under_pressure(keys_in_memory) {
            Err(PivotError::MemoryPressure(phase))
        } else {
            Ok(())
        }
    }

    /// Halve the limit after a pressure signal. The new limit is strictly
    /// smaller than both the old limit and the batch size that failed;
    /// shrinking below one key escalates to [`PivotError::ResourceExhaustion`].
    pub fn shrink(&mut self, phase: &'static str) -> PivotResult<usize> {
        let failed_at = self.limit.min(self.last_polled.get().max(1));
        if failed_at <= 1 {
            return Err(PivotError::ResourceExhaustion(phase));
        }
        self.limit = (failed_at / 2).max(1);
        warn!("memory pressure during '{phase}': batch limit reduced to {}", self.limit);
        Ok(self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unbounded() {
        let ctrl = BatchController::new(None, Box::new(NoPressure));
        assert_eq!(ctrl.limit(), BatchController::UNBOUNDED);
        assert!(ctrl.poll(1_000_000, "test").is_ok());
    }

    #[test]
    fn test_shrink_is_strictly_monotonic() {
        let mut ctrl = BatchController::new(None, Box::new(KeyBudget(0)));
        assert!(ctrl.poll(64, "test").is_err());

        let mut previous = ctrl.limit().min(64);
        loop {
            match ctrl.shrink("test") {
                Ok(limit) => {
                    assert!(limit < previous, "limit must strictly decrease");
                    previous = limit;
                    ctrl.poll(limit, "test").unwrap_err();
                }
                Err(e) => {
                    assert!(matches!(e, PivotError::ResourceExhaustion("test")));
                    break;
                }
            }
        }
        assert_eq!(ctrl.limit(), 1);
    }

    #[test]
    fn test_shrink_halves_from_failing_batch() {
        let mut ctrl = BatchController::new(None, Box::new(KeyBudget(5)));
        assert!(ctrl.poll(10, "test").is_err());
        assert_eq!(ctrl.shrink("test").unwrap(), 5);
    }

    #[test]
    fn test_explicit_limit_floor() {
        let mut ctrl = BatchController::new(Some(1), Box::new(KeyBudget(0)));
        ctrl.poll(1, "test").unwrap_err();
        assert!(matches!(
            ctrl.shrink("test"),
            Err(PivotError::ResourceExhaustion("test"))
        ));
    }

    #[test]
    fn test_budget_probe_boundary() {
        let probe = KeyBudget(3);
        assert!(!probe.under_pressure(3));
        assert!(probe.under_pressure(4));
    }
}
