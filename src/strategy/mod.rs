//! Adaptive batch size and validation strictness.
//!
//! Parameters are a pure function of the rolling outcome window and the
//! configured bounds, so they are recomputed every cycle (and after a resume)
//! rather than stored.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::fix::ValidationLevel;
use crate::issue::Category;
use crate::pipeline_config::StrategySection;
use crate::queue::TaskOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Applied,
    Skipped,
    Failed,
}

impl From<&TaskOutcome> for OutcomeKind {
    fn from(outcome: &TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Applied { .. } => OutcomeKind::Applied,
            TaskOutcome::Skipped { .. } => OutcomeKind::Skipped,
            TaskOutcome::Failed { .. } => OutcomeKind::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeSample {
    pub category: Category,
    pub kind: OutcomeKind,
}

/// The last `capacity` fix outcomes, oldest first.
#[derive(Debug, Clone)]
pub struct OutcomeWindow {
    capacity: usize,
    samples: VecDeque<OutcomeSample>,
}

impl OutcomeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, category: Category, kind: OutcomeKind) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(OutcomeSample { category, kind });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `applied / (applied + failed)`; skips carry no signal. `None` without decisive samples.
    pub fn success_rate(&self) -> Option<f64> {
        let applied = self.count(OutcomeKind::Applied);
        let failed = self.count(OutcomeKind::Failed);
        if applied + failed == 0 {
            return None;
        }
        Some(applied as f64 / (applied + failed) as f64)
    }

    fn count(&self, kind: OutcomeKind) -> usize {
        self.samples.iter().filter(|s| s.kind == kind).count()
    }

    /// Length of the trailing run of `kind` among decisive samples.
    fn trailing(&self, kind: OutcomeKind) -> usize {
        self.samples
            .iter()
            .rev()
            .filter(|s| s.kind != OutcomeKind::Skipped)
            .take_while(|s| s.kind == kind)
            .count()
    }

    /// Per category, the trailing run of failures within that category's own outcomes.
    fn trailing_failures_by_category(&self) -> HashMap<Category, usize> {
        let mut runs: HashMap<Category, usize> = HashMap::new();
        let mut closed: HashMap<Category, bool> = HashMap::new();
        for sample in self.samples.iter().rev() {
            if sample.kind == OutcomeKind::Skipped {
                continue;
            }
            let done = closed.entry(sample.category).or_insert(false);
            if *done {
                continue;
            }
            if sample.kind == OutcomeKind::Failed {
                *runs.entry(sample.category).or_insert(0) += 1;
            } else {
                *done = true;
            }
        }
        runs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyBounds {
    pub initial_batch_size: usize,
    pub max_batch_size: usize,
    pub base_validation_level: ValidationLevel,
}

impl From<&StrategySection> for StrategyBounds {
    fn from(section: &StrategySection) -> Self {
        let max_batch_size = section.max_batch_size.max(1);
        Self {
            initial_batch_size: section.initial_batch_size.clamp(1, max_batch_size),
            max_batch_size,
            base_validation_level: section.base_validation_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StrategyParameters {
    pub batch_size: usize,
    pub validation_level: ValidationLevel,
    pub parallel_allowed: bool,
}

pub const GROW_ABOVE: f64 = 0.8;
pub const SHRINK_BELOW: f64 = 0.5;

/// Derive next-cycle parameters.
///
/// - rate > 0.8: batch grows by one per trailing success, up to the ceiling.
/// - rate < 0.5: batch halves per trailing failure, floor 1.
/// - every two trailing failures within one category tighten validation one level.
/// - parallel dispatch is off at strict validation or while the rate is below 0.5.
pub fn derive(window: &OutcomeWindow, bounds: &StrategyBounds) -> StrategyParameters {
    let rate = window.success_rate();
    let initial = bounds.initial_batch_size.clamp(1, bounds.max_batch_size.max(1));

    let batch_size = match rate {
        Some(r) if r > GROW_ABOVE => {
            let streak = window.trailing(OutcomeKind::Applied);
            (initial + streak).min(bounds.max_batch_size)
        }
        Some(r) if r < SHRINK_BELOW => {
            let streak = window.trailing(OutcomeKind::Failed).clamp(1, usize::BITS as usize - 1);
            (initial >> streak).max(1)
        }
        _ => initial,
    };

    let steps = window
        .trailing_failures_by_category()
        .values()
        .map(|run| run / 2)
        .max()
        .unwrap_or(0);
    let validation_level =
        (0..steps).fold(bounds.base_validation_level, |level, _| level.tighten());

    let parallel_allowed =
        validation_level != ValidationLevel::Strict && rate.is_none_or(|r| r >= SHRINK_BELOW);

    StrategyParameters {
        batch_size: batch_size.max(1),
        validation_level,
        parallel_allowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Category::*;
    use OutcomeKind::*;

    fn bounds() -> StrategyBounds {
        StrategyBounds {
            initial_batch_size: 4,
            max_batch_size: 8,
            base_validation_level: ValidationLevel::Basic,
        }
    }

    fn window(samples: &[(Category, OutcomeKind)]) -> OutcomeWindow {
        let mut w = OutcomeWindow::new(20);
        for (c, k) in samples {
            w.record(*c, *k);
        }
        w
    }

    #[test]
    fn test_empty_window_uses_initial_parameters() {
        let params = derive(&OutcomeWindow::new(20), &bounds());
        assert_eq!(params.batch_size, 4);
        assert_eq!(params.validation_level, ValidationLevel::Basic);
        assert!(params.parallel_allowed);
    }

    #[test]
    fn test_high_success_grows_batch_up_to_ceiling() {
        let params = derive(&window(&[(Quality, Applied); 2]), &bounds());
        assert_eq!(params.batch_size, 6);
        let params = derive(&window(&[(Quality, Applied); 12]), &bounds());
        assert_eq!(params.batch_size, 8);
    }

    #[test]
    fn test_low_success_shrinks_batch_to_floor() {
        let params = derive(&window(&[(Quality, Applied), (Security, Failed), (Quality, Failed)]), &bounds());
        assert_eq!(params.batch_size, 1);
        assert!(!params.parallel_allowed);

        let params = derive(&window(&[(Quality, Failed)]), &bounds());
        assert_eq!(params.batch_size, 2);
    }

    #[test]
    fn test_middle_rate_keeps_initial() {
        let params = derive(
            &window(&[(Quality, Applied), (Quality, Applied), (Quality, Failed), (Quality, Applied)]),
            &bounds(),
        );
        assert_eq!(params.batch_size, 4);
    }

    #[test]
    fn test_two_consecutive_failures_in_category_tighten() {
        let params = derive(&window(&[(Security, Failed), (Quality, Applied), (Security, Failed)]), &bounds());
        assert_eq!(params.validation_level, ValidationLevel::Standard);

        let params = derive(&window(&[(Security, Failed), (Security, Failed), (Security, Failed), (Security, Failed)]), &bounds());
        assert_eq!(params.validation_level, ValidationLevel::Strict);
        assert!(!params.parallel_allowed);
    }

    #[test]
    fn test_failures_spread_across_categories_do_not_tighten() {
        let params = derive(&window(&[(Security, Failed), (Quality, Failed), (Duplicate, Failed)]), &bounds());
        assert_eq!(params.validation_level, ValidationLevel::Basic);
    }

    #[test]
    fn test_success_resets_category_run() {
        let params = derive(&window(&[(Security, Failed), (Security, Applied), (Security, Failed)]), &bounds());
        assert_eq!(params.validation_level, ValidationLevel::Basic);
    }

    #[test]
    fn test_skips_are_ignored() {
        let w = window(&[(Quality, Skipped), (Quality, Skipped)]);
        assert_eq!(w.success_rate(), None);
        assert_eq!(derive(&w, &bounds()).batch_size, 4);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut w = OutcomeWindow::new(2);
        w.record(Quality, Failed);
        w.record(Quality, Applied);
        w.record(Quality, Applied);
        assert_eq!(w.len(), 2);
        assert_eq!(w.success_rate(), Some(1.0));
    }

    #[test]
    fn test_derive_is_deterministic() {
        let w = window(&[(Security, Applied), (Connection, Failed), (Quality, Applied)]);
        assert_eq!(derive(&w, &bounds()), derive(&w.clone(), &bounds()));
    }
}
