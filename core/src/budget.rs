//! Spend ceiling enforcement
//!
//! The gate separates a cheap, non-mutating admission check ([`BudgetGate::allow`])
//! from the authoritative post-hoc charge ([`BudgetGate::charge`]). Admission
//! uses an optimistic estimate and never takes a lock; a run can therefore
//! overshoot the ceiling by roughly one bout per worker.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Margin applied on top of raw token cost
pub const MARGIN: f64 = 0.10;

/// Model used for pricing when the requested model is unknown
pub const FALLBACK_MODEL: &str = "claude-sonnet-4-5";

/// Input tokens assumed per output token when estimating a bout
pub const INPUT_OUTPUT_RATIO: u64 = 3;

/// Output tokens assumed per turn when estimating a bout
pub const OUTPUT_TOKENS_PER_TURN: u64 = 250;

const MICROS_PER_GBP: f64 = 1_000_000.0;

/// Price per million tokens, in GBP
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPrice {
    /// Model identifier
    pub model: &'static str,
    /// Input price per million tokens
    pub input_per_m: f64,
    /// Output price per million tokens
    pub output_per_m: f64,
}

/// Known model prices
pub static PRICE_TABLE: &[ModelPrice] = &[
    ModelPrice {
        model: "claude-haiku-4-5",
        input_per_m: 0.80,
        output_per_m: 4.00,
    },
    ModelPrice {
        model: "claude-sonnet-4-5",
        input_per_m: 2.40,
        output_per_m: 12.00,
    },
    ModelPrice {
        model: "claude-opus-4-5",
        input_per_m: 4.00,
        output_per_m: 20.00,
    },
];

/// Price entry for `model`, falling back to [`FALLBACK_MODEL`]
pub fn price_for(model: &str) -> ModelPrice {
    PRICE_TABLE
        .iter()
        .find(|p| p.model == model)
        .or_else(|| PRICE_TABLE.iter().find(|p| p.model == FALLBACK_MODEL))
        .copied()
        .unwrap_or(PRICE_TABLE[0])
}

/// Cost in GBP for the given token counts, margin included
pub fn token_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let price = price_for(model);
    let raw = (input_tokens as f64 * price.input_per_m + output_tokens as f64 * price.output_per_m)
        / 1_000_000.0;
    raw * (1.0 + MARGIN)
}

/// Pre-flight estimate for a bout of `turns` turns
pub fn estimate_bout_cost(model: &str, turns: u32) -> f64 {
    let output = OUTPUT_TOKENS_PER_TURN * u64::from(turns);
    token_cost(model, output * INPUT_OUTPUT_RATIO, output)
}

fn to_micros(gbp: f64) -> u64 {
    if gbp.is_finite() && gbp > 0.0 {
        (gbp * MICROS_PER_GBP).round() as u64
    } else {
        0
    }
}

#[derive(Debug, Default)]
struct Ledger {
    per_model: HashMap<String, f64>,
    bouts: u64,
}

/// Concurrency-safe spend ledger with an optional ceiling
#[derive(Debug)]
pub struct BudgetGate {
    ceiling_micros: u64,
    spent_micros: AtomicU64,
    ledger: Mutex<Ledger>,
}

impl BudgetGate {
    /// Create a gate. A ceiling of zero (or below) means unlimited.
    pub fn new(ceiling_gbp: f64) -> Self {
        Self {
            ceiling_micros: to_micros(ceiling_gbp),
            spent_micros: AtomicU64::new(0),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// A gate with no ceiling
    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    /// Whether a ceiling is configured
    pub fn is_limited(&self) -> bool {
        self.ceiling_micros > 0
    }

    /// Configured ceiling in GBP (0.0 when unlimited)
    pub fn ceiling(&self) -> f64 {
        self.ceiling_micros as f64 / MICROS_PER_GBP
    }

    /// Estimate a bout and check it against the remaining budget.
    ///
    /// Does not reserve anything.
    pub fn allow(&self, model: &str, turns: u32) -> (f64, bool) {
        let estimate = estimate_bout_cost(model, turns);
        if !self.is_limited() {
            return (estimate, true);
        }
        let spent = self.spent_micros.load(Ordering::Acquire);
        let allowed = spent.saturating_add(to_micros(estimate)) <= self.ceiling_micros;
        (estimate, allowed)
    }

    /// Record spend against `model` and count one bout.
    ///
    /// Non-positive or non-finite amounts still count the bout but add no spend.
    pub fn charge(&self, model: &str, amount_gbp: f64) {
        let micros = to_micros(amount_gbp);
        self.spent_micros.fetch_add(micros, Ordering::AcqRel);

        let mut ledger = self.ledger.lock();
        *ledger.per_model.entry(model.to_string()).or_insert(0.0) +=
            micros as f64 / MICROS_PER_GBP;
        ledger.bouts += 1;
    }

    /// Charge the real cost of a bout from token counts; returns the amount charged
    pub fn charge_tokens(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let cost = token_cost(model, input_tokens, output_tokens);
        self.charge(model, cost);
        cost
    }

    /// Total spend so far in GBP
    pub fn spent(&self) -> f64 {
        self.spent_micros.load(Ordering::Acquire) as f64 / MICROS_PER_GBP
    }

    /// Remaining budget in GBP, clamped at zero. `None` means unlimited.
    pub fn remaining(&self) -> Option<f64> {
        if !self.is_limited() {
            return None;
        }
        let spent = self.spent_micros.load(Ordering::Acquire);
        Some(self.ceiling_micros.saturating_sub(spent) as f64 / MICROS_PER_GBP)
    }

    /// Whether spend has reached the ceiling
    pub fn exhausted(&self) -> bool {
        self.is_limited() && self.spent_micros.load(Ordering::Acquire) >= self.ceiling_micros
    }

    /// Bouts charged so far
    pub fn bouts(&self) -> u64 {
        self.ledger.lock().bouts
    }

    /// Point-in-time copy of the ledger
    pub fn snapshot(&self) -> BudgetSnapshot {
        let ledger = self.ledger.lock();
        BudgetSnapshot {
            ceiling_gbp: self.ceiling(),
            spent_gbp: self.spent(),
            remaining_gbp: self.remaining(),
            exhausted: self.exhausted(),
            bouts: ledger.bouts,
            per_model: ledger
                .per_model
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }
}

/// Serializable view of the budget
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    /// Ceiling in GBP (0.0 = unlimited)
    pub ceiling_gbp: f64,
    /// Spend so far
    pub spent_gbp: f64,
    /// Remaining budget; `None` when unlimited
    pub remaining_gbp: Option<f64>,
    /// Whether the ceiling has been reached
    pub exhausted: bool,
    /// Bouts charged
    pub bouts: u64,
    /// Spend per model
    pub per_model: BTreeMap<String, f64>,
}
