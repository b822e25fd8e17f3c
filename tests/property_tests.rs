use proptest::prelude::*;
use remediate::fix::ValidationLevel;
use remediate::issue::Category;
use remediate::strategy::{OutcomeKind, OutcomeWindow, StrategyBounds, derive};

fn category() -> impl Strategy<Value = Category> {
    prop_oneof![
        Just(Category::Security),
        Just(Category::Connection),
        Just(Category::Duplicate),
        Just(Category::Quality),
    ]
}

fn kind() -> impl Strategy<Value = OutcomeKind> {
    prop_oneof![
        Just(OutcomeKind::Applied),
        Just(OutcomeKind::Skipped),
        Just(OutcomeKind::Failed),
    ]
}

fn level() -> impl Strategy<Value = ValidationLevel> {
    prop_oneof![
        Just(ValidationLevel::Basic),
        Just(ValidationLevel::Standard),
        Just(ValidationLevel::Strict),
    ]
}

// Batch size stays within [1, ceiling] for any outcome history and any
// configured bounds, including an initial size above the ceiling.
proptest! {
    #[test]
    fn test_batch_size_stays_within_bounds(
        samples in prop::collection::vec((category(), kind()), 0..200),
        capacity in 1usize..64,
        initial in 0usize..64,
        ceiling in 0usize..32,
        base in level(),
    ) {
        let bounds = StrategyBounds {
            initial_batch_size: initial,
            max_batch_size: ceiling,
            base_validation_level: base,
        };
        let mut window = OutcomeWindow::new(capacity);
        for (category, kind) in samples {
            window.record(category, kind);
            let params = derive(&window, &bounds);
            prop_assert!(params.batch_size >= 1);
            prop_assert!(params.batch_size <= ceiling.max(1));
        }
    }

    #[test]
    fn test_validation_never_loosens_and_strict_is_serial(
        samples in prop::collection::vec((category(), kind()), 0..100),
        base in level(),
    ) {
        let bounds = StrategyBounds {
            initial_batch_size: 4,
            max_batch_size: 8,
            base_validation_level: base,
        };
        let mut window = OutcomeWindow::new(20);
        for (category, kind) in samples {
            window.record(category, kind);
        }
        let params = derive(&window, &bounds);
        prop_assert!(params.validation_level >= base);
        if params.validation_level == ValidationLevel::Strict {
            prop_assert!(!params.parallel_allowed);
        }
    }
}
