//! Stable exit codes for fixloop CLI commands.

use crate::looping::LoopStop;

/// Fixed, converged, or any non-loop command that succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, missing environment, or an unexpected error.
pub const INVALID: i32 = 1;
/// The loop ended without a fix: max loops, wall clock, budget, or a stop file.
pub const UNFIXED: i32 = 2;
/// Automated recovery gave up.
pub const MANUAL_INTERVENTION: i32 = 3;

pub fn for_stop(stop: &LoopStop) -> i32 {
    match stop {
        LoopStop::Fixed { .. } | LoopStop::Converged { .. } => OK,
        LoopStop::ManualIntervention { .. } => MANUAL_INTERVENTION,
        LoopStop::MaxLoopsExhausted { .. }
        | LoopStop::WallClockExceeded
        | LoopStop::Stopped
        | LoopStop::BudgetExhausted(_) => UNFIXED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::BudgetError;

    #[test]
    fn loop_stops_map_to_codes() {
        assert_eq!(for_stop(&LoopStop::Converged { stagnant: 5 }), OK);
        assert_eq!(for_stop(&LoopStop::MaxLoopsExhausted { loops: 10 }), UNFIXED);
        assert_eq!(
            for_stop(&LoopStop::BudgetExhausted(BudgetError::Total { used: 2, limit: 1 })),
            UNFIXED
        );
        assert_eq!(
            for_stop(&LoopStop::ManualIntervention { failures: 3 }),
            MANUAL_INTERVENTION
        );
    }
}
