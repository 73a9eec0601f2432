//! Token, cost, and wall-clock budgets.
//!
//! [`BudgetLedger`] is an explicit value owned by the run and threaded as `&mut` through
//! every LLM call site. Counters only ever grow for the lifetime of a run.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::Value;

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("wall-clock budget exhausted"));
    }
    Ok(remaining)
}

/// Hard limits checked by [`BudgetLedger::enforce`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetLimits {
    pub max_iteration_tokens: u64,
    pub max_total_tokens: u64,
    pub max_cost_gbp: f64,
}

/// Prices in GBP per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetRates {
    pub prompt_cost_per_1k: f64,
    pub completion_cost_per_1k: f64,
}

/// Reason a usage report was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    Negative { field: &'static str, value: i64 },
    NonNumeric { field: &'static str, value: String },
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageError::Negative { field, value } => {
                write!(f, "invalid usage: {field} tokens must be >= 0 (got {value})")
            }
            UsageError::NonNumeric { field, value } => {
                write!(f, "invalid usage: {field} tokens must be an integer (got {value})")
            }
        }
    }
}

impl std::error::Error for UsageError {}

/// A budget threshold was crossed. Aborts the current outer iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetError {
    Iteration {
        used: u64,
        limit: u64,
    },
    Total {
        used: u64,
        limit: u64,
    },
    Cost {
        cost: f64,
        limit: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
}

impl BudgetError {
    /// Total and cost violations can never recover within the same run.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, BudgetError::Iteration { .. })
    }
}

impl fmt::Display for BudgetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetError::Iteration { used, limit } => write!(
                f,
                "iteration budget exceeded: used {used} tokens, limit {limit} tokens"
            ),
            BudgetError::Total { used, limit } => write!(
                f,
                "total budget exceeded: used {used} tokens, limit {limit} tokens"
            ),
            BudgetError::Cost {
                cost,
                limit,
                prompt_tokens,
                completion_tokens,
            } => write!(
                f,
                "cost budget exceeded: estimated £{cost:.4}, limit £{limit:.4} (prompt {prompt_tokens} tokens, completion {completion_tokens} tokens)"
            ),
        }
    }
}

impl std::error::Error for BudgetError {}

/// Point-in-time view of the ledger, written into iteration logs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_gbp: f64,
}

#[derive(Debug, Clone)]
pub struct BudgetLedger {
    prompt_tokens: u64,
    completion_tokens: u64,
    limits: BudgetLimits,
    rates: BudgetRates,
}

impl BudgetLedger {
    pub fn new(limits: BudgetLimits, rates: BudgetRates) -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: 0,
            limits,
            rates,
        }
    }

    /// Record one call's usage. Negative counts are rejected and leave the ledger unchanged.
    pub fn add_usage(&mut self, prompt: i64, completion: i64) -> Result<(), UsageError> {
        let prompt = non_negative("prompt", prompt)?;
        let completion = non_negative("completion", completion)?;
        self.prompt_tokens = self.prompt_tokens.saturating_add(prompt);
        self.completion_tokens = self.completion_tokens.saturating_add(completion);
        Ok(())
    }

    /// Record usage reported as raw JSON (a provider `usage` object's fields).
    ///
    /// Anything other than an integral JSON number is rejected as non-numeric.
    pub fn add_usage_value(&mut self, prompt: &Value, completion: &Value) -> Result<(), UsageError> {
        let prompt = integral("prompt", prompt)?;
        let completion = integral("completion", completion)?;
        self.add_usage(prompt, completion)
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn estimated_cost(&self) -> f64 {
        self.prompt_tokens as f64 / 1000.0 * self.rates.prompt_cost_per_1k
            + self.completion_tokens as f64 / 1000.0 * self.rates.completion_cost_per_1k
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens(),
            estimated_cost_gbp: self.estimated_cost(),
        }
    }

    /// Check iteration, total, and cost limits in that order.
    ///
    /// Pure with respect to the ledger: repeated calls with the same input return the same verdict.
    pub fn enforce(&self, iteration_start_tokens: u64) -> Result<(), BudgetError> {
        let total = self.total_tokens();
        let used = total.saturating_sub(iteration_start_tokens);
        if used > self.limits.max_iteration_tokens {
            return Err(BudgetError::Iteration {
                used,
                limit: self.limits.max_iteration_tokens,
            });
        }
        if total > self.limits.max_total_tokens {
            return Err(BudgetError::Total {
                used: total,
                limit: self.limits.max_total_tokens,
            });
        }
        let cost = self.estimated_cost();
        if cost > self.limits.max_cost_gbp {
            return Err(BudgetError::Cost {
                cost,
                limit: self.limits.max_cost_gbp,
                prompt_tokens: self.prompt_tokens,
                completion_tokens: self.completion_tokens,
            });
        }
        Ok(())
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<u64, UsageError> {
    u64::try_from(value).map_err(|_| UsageError::Negative { field, value })
}

fn integral(field: &'static str, value: &Value) -> Result<i64, UsageError> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    if let Some(n) = value.as_u64() {
        return i64::try_from(n).map_err(|_| UsageError::NonNumeric {
            field,
            value: value.to_string(),
        });
    }
    Err(UsageError::NonNumeric {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn ledger(max_iteration_tokens: u64, max_total_tokens: u64, max_cost_gbp: f64) -> BudgetLedger {
        BudgetLedger::new(
            BudgetLimits {
                max_iteration_tokens,
                max_total_tokens,
                max_cost_gbp,
            },
            BudgetRates {
                prompt_cost_per_1k: 0.01,
                completion_cost_per_1k: 0.03,
            },
        )
    }

    #[test]
    fn add_usage_rejects_negative_counts() {
        let mut l = ledger(100, 1000, 10.0);
        assert_eq!(
            l.add_usage(-1, 5),
            Err(UsageError::Negative {
                field: "prompt",
                value: -1
            })
        );
        assert_eq!(
            l.add_usage(5, -7),
            Err(UsageError::Negative {
                field: "completion",
                value: -7
            })
        );
        assert_eq!(l.total_tokens(), 0);
    }

    #[test]
    fn add_usage_value_rejects_non_numeric() {
        let mut l = ledger(100, 1000, 10.0);
        for bad in [json!("12"), json!(1.5), json!(null), json!([1]), json!({"n": 1})] {
            assert!(matches!(
                l.add_usage_value(&bad, &json!(1)),
                Err(UsageError::NonNumeric { field: "prompt", .. })
            ));
            assert!(matches!(
                l.add_usage_value(&json!(1), &bad),
                Err(UsageError::NonNumeric {
                    field: "completion",
                    ..
                })
            ));
        }
        assert!(matches!(
            l.add_usage_value(&json!(-3), &json!(1)),
            Err(UsageError::Negative { .. })
        ));
        assert_eq!(l.total_tokens(), 0);

        l.add_usage_value(&json!(12), &json!(3)).expect("valid usage");
        assert_eq!(l.prompt_tokens(), 12);
        assert_eq!(l.completion_tokens(), 3);
    }

    #[test]
    fn totals_equal_sum_of_increments_in_any_order() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut increments: Vec<(i64, i64)> = (0..rng.gen_range(1..20))
                .map(|_| (rng.gen_range(0..5_000), rng.gen_range(0..5_000)))
                .collect();
            let expected: u64 = increments.iter().map(|(p, c)| (p + c) as u64).sum();

            let mut forward = ledger(u64::MAX, u64::MAX, f64::MAX);
            for (p, c) in &increments {
                forward.add_usage(*p, *c).expect("add");
            }
            increments.reverse();
            let mut backward = ledger(u64::MAX, u64::MAX, f64::MAX);
            for (p, c) in &increments {
                backward.add_usage(*p, *c).expect("add");
            }

            assert_eq!(forward.total_tokens(), expected);
            assert_eq!(backward.total_tokens(), expected);
        }
    }

    #[test]
    fn iteration_budget_message_names_used_and_limit() {
        let mut l = ledger(100, 1_000_000, 1_000.0);
        l.add_usage(80, 30).expect("add");
        let err = l.enforce(0).expect_err("over iteration budget");
        assert_eq!(err, BudgetError::Iteration { used: 110, limit: 100 });
        let msg = err.to_string();
        assert!(msg.contains("iteration budget exceeded"));
        assert!(msg.contains("110"));
        assert!(msg.contains("100"));
        assert!(!err.is_persistent());
    }

    #[test]
    fn iteration_check_ignores_total_state() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let max_iteration = rng.gen_range(1..500u64);
            let max_total = rng.gen_range(1..2_000u64);
            let mut l = ledger(max_iteration, max_total, f64::MAX);
            l.add_usage(rng.gen_range(0..1_000), rng.gen_range(0..1_000))
                .expect("add");
            let start = rng.gen_range(0..=l.total_tokens());
            let used = l.total_tokens() - start;

            let verdict = l.enforce(start);
            let is_iteration_error = matches!(verdict, Err(BudgetError::Iteration { .. }));
            assert_eq!(is_iteration_error, used > max_iteration);
        }
    }

    #[test]
    fn total_and_cost_checks_follow_iteration_check() {
        let mut l = ledger(1_000, 500, 1_000.0);
        l.add_usage(400, 200).expect("add");
        let err = l.enforce(550).expect_err("total exceeded");
        assert_eq!(err, BudgetError::Total { used: 600, limit: 500 });
        assert!(err.to_string().contains("total budget exceeded"));
        assert!(err.is_persistent());

        let mut l = ledger(1_000_000, 1_000_000, 0.01);
        l.add_usage(1_000, 1_000).expect("add");
        let err = l.enforce(2_000).expect_err("cost exceeded");
        let msg = err.to_string();
        assert!(msg.contains("cost budget exceeded"));
        assert!(msg.contains("£0.0400"));
        assert!(msg.contains("prompt 1000 tokens"));
        assert!(msg.contains("completion 1000 tokens"));
    }

    #[test]
    fn enforce_is_idempotent() {
        let mut l = ledger(50, 1_000, 10.0);
        l.add_usage(40, 20).expect("add");
        let first = l.enforce(0);
        let second = l.enforce(0);
        assert_eq!(first, second);
        assert_eq!(l.total_tokens(), 60);
    }

    #[test]
    fn remaining_budget_errors_after_deadline() {
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(remaining_budget(past).is_err());
        assert!(remaining_budget(Instant::now() + Duration::from_secs(5)).is_ok());
    }
}
