//! Stagnation tracking across outer iterations.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceState {
    pub last_content_hash: Option<String>,
    pub stagnant_count: u32,
}

impl ConvergenceState {
    /// Record this iteration's content hash and return the updated stagnation count.
    ///
    /// An unchanged hash increments the count; any change resets it to zero.
    pub fn observe(&mut self, content_hash: &str) -> u32 {
        if self.last_content_hash.as_deref() == Some(content_hash) {
            self.stagnant_count += 1;
        } else {
            self.stagnant_count = 0;
            self.last_content_hash = Some(content_hash.to_string());
        }
        self.stagnant_count
    }

    pub fn has_converged(&self, threshold: u32) -> bool {
        threshold > 0 && self.stagnant_count >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_hash_counts_up_and_change_resets() {
        let mut state = ConvergenceState::default();
        assert_eq!(state.observe("a"), 0);
        assert_eq!(state.observe("a"), 1);
        assert_eq!(state.observe("a"), 2);
        assert_eq!(state.observe("b"), 0);
        assert_eq!(state.last_content_hash.as_deref(), Some("b"));
    }

    #[test]
    fn converges_at_threshold() {
        let mut state = ConvergenceState::default();
        state.observe("h");
        for _ in 0..4 {
            state.observe("h");
        }
        assert!(!state.has_converged(5));
        state.observe("h");
        assert!(state.has_converged(5));
        assert!(!state.has_converged(0));
    }
}
