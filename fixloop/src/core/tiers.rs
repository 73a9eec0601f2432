//! Provider tier bookkeeping: exhaustion flags, day rollover, free-tier cooldown,
//! and failure classification. Pure; the supervisor in `io::providers` drives it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Provider tiers in strict fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Primary,
    Premium,
    Free,
}

impl Tier {
    pub const ORDER: [Tier; 3] = [Tier::Primary, Tier::Premium, Tier::Free];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Premium => "premium",
            Tier::Free => "free",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierState {
    pub tier: Tier,
    pub exhausted: bool,
    /// Only tracked for the free tier, which re-enables itself after a cooldown.
    pub exhausted_at: Option<DateTime<Utc>>,
    pub cooldown_secs: Option<u64>,
}

impl TierState {
    fn fresh(tier: Tier, free_cooldown_secs: u64) -> Self {
        Self {
            tier,
            exhausted: false,
            exhausted_at: None,
            cooldown_secs: (tier == Tier::Free).then_some(free_cooldown_secs),
        }
    }
}

/// Persisted tier state for one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBook {
    pub day: NaiveDate,
    pub tiers: Vec<TierState>,
    /// Models that failed an entitlement check. Survives day rollover.
    pub blacklisted_models: BTreeSet<String>,
}

impl TierBook {
    pub fn new(now: DateTime<Utc>, free_cooldown_secs: u64) -> Self {
        Self {
            day: now.date_naive(),
            tiers: Tier::ORDER
                .iter()
                .map(|tier| TierState::fresh(*tier, free_cooldown_secs))
                .collect(),
            blacklisted_models: BTreeSet::new(),
        }
    }

    /// Apply day rollover (all tiers) and free-tier cooldown expiry.
    ///
    /// Returns the tiers that were re-enabled.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Vec<Tier> {
        let mut reenabled = Vec::new();
        if now.date_naive() != self.day {
            self.day = now.date_naive();
            for state in &mut self.tiers {
                if state.exhausted {
                    reenabled.push(state.tier);
                }
                state.exhausted = false;
                state.exhausted_at = None;
            }
            return reenabled;
        }
        for state in &mut self.tiers {
            if !state.exhausted {
                continue;
            }
            let (Some(at), Some(cooldown)) = (state.exhausted_at, state.cooldown_secs) else {
                continue;
            };
            let cooldown = ChronoDuration::seconds(i64::try_from(cooldown).unwrap_or(i64::MAX));
            if at + cooldown <= now {
                state.exhausted = false;
                state.exhausted_at = None;
                reenabled.push(state.tier);
            }
        }
        reenabled
    }

    pub fn is_exhausted(&self, tier: Tier) -> bool {
        self.state(tier).is_some_and(|s| s.exhausted)
    }

    pub fn all_exhausted(&self) -> bool {
        self.tiers.iter().all(|s| s.exhausted)
    }

    /// Mark `tier` exhausted. Returns false if it already was.
    pub fn mark_exhausted(&mut self, tier: Tier, now: DateTime<Utc>) -> bool {
        let Some(state) = self.tiers.iter_mut().find(|s| s.tier == tier) else {
            return false;
        };
        if state.exhausted {
            return false;
        }
        state.exhausted = true;
        if state.cooldown_secs.is_some() {
            state.exhausted_at = Some(now);
        }
        true
    }

    pub fn blacklist(&mut self, model: &str) -> bool {
        self.blacklisted_models.insert(model.to_string())
    }

    pub fn is_blacklisted(&self, model: &str) -> bool {
        self.blacklisted_models.contains(model)
    }

    pub fn state(&self, tier: Tier) -> Option<&TierState> {
        self.tiers.iter().find(|s| s.tier == tier)
    }
}

/// How a failed provider call should move the tier state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Quota or billing limit: exhaust the tier.
    Quota,
    /// Model not enabled for the account: exhaust the tier and blacklist the model.
    Entitlement,
    /// Anything else: fall back for this call only.
    Ordinary,
}

static ENTITLEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)not entitled|model is not enabled|not available for your (?:plan|account)|access to model|model_not_found",
    )
    .expect("entitlement pattern should compile")
});

static QUOTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)quota|rate limit exceeded|billing|insufficient credits|usage limit|exceeded your current",
    )
    .expect("quota pattern should compile")
});

/// Classify provider failure output. Entitlement wins over quota when both match.
pub fn classify_failure(output: &str) -> FailureClass {
    if ENTITLEMENT_RE.is_match(output) {
        return FailureClass::Entitlement;
    }
    if QUOTA_RE.is_match(output) {
        return FailureClass::Quota;
    }
    FailureClass::Ordinary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0)
            .single()
            .expect("valid time")
    }

    #[test]
    fn classifies_failure_output() {
        assert_eq!(
            classify_failure("Error: You exceeded your current quota"),
            FailureClass::Quota
        );
        assert_eq!(
            classify_failure("402 billing hard limit reached"),
            FailureClass::Quota
        );
        assert_eq!(
            classify_failure("The model gpt-x is not enabled for this org (model is not enabled)"),
            FailureClass::Entitlement
        );
        assert_eq!(
            classify_failure("connection reset by peer"),
            FailureClass::Ordinary
        );
    }

    #[test]
    fn mark_exhausted_is_reported_once() {
        let mut book = TierBook::new(at(1, 9, 0), 3600);
        assert!(book.mark_exhausted(Tier::Primary, at(1, 9, 5)));
        assert!(!book.mark_exhausted(Tier::Primary, at(1, 9, 6)));
        assert!(book.is_exhausted(Tier::Primary));
        assert!(!book.all_exhausted());
        // Only the free tier records a timestamp.
        assert_eq!(book.state(Tier::Primary).and_then(|s| s.exhausted_at), None);
    }

    #[test]
    fn free_tier_reenables_after_cooldown() {
        let mut book = TierBook::new(at(1, 9, 0), 1800);
        book.mark_exhausted(Tier::Premium, at(1, 9, 0));
        book.mark_exhausted(Tier::Free, at(1, 9, 0));

        assert!(book.refresh(at(1, 9, 20)).is_empty());
        assert!(book.is_exhausted(Tier::Free));

        assert_eq!(book.refresh(at(1, 9, 30)), vec![Tier::Free]);
        assert!(!book.is_exhausted(Tier::Free));
        assert!(book.is_exhausted(Tier::Premium));
    }

    #[test]
    fn day_rollover_resets_every_tier_but_keeps_blacklist() {
        let mut book = TierBook::new(at(1, 23, 0), 1800);
        for tier in Tier::ORDER {
            book.mark_exhausted(tier, at(1, 23, 10));
        }
        book.blacklist("model-a");
        assert!(book.all_exhausted());

        let reenabled = book.refresh(at(2, 0, 1));
        assert_eq!(reenabled, Tier::ORDER.to_vec());
        assert!(!book.all_exhausted());
        assert_eq!(book.day, at(2, 0, 1).date_naive());
        assert!(book.is_blacklisted("model-a"));
    }
}
