//! Token budget tracking and forecasting.
//!
//! The tracker watches aggregate input+output tokens against a configured
//! budget. It emits each signal class at most once per run except
//! `Exceeded`, which keeps firing:
//!
//! - `Warn` at 90 % of budget
//! - `Forecast` when average per-stage usage times the remaining stages
//!   predicts an overrun while actual usage is still at or below 90 %
//! - `Exceeded` at 100 %, which triggers the degradation chain

/// Warn threshold as a fraction of the budget.
const WARN_RATIO: f64 = 0.9;

/// Signal from a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSignal {
    /// Actual usage crossed 90 % of the budget.
    Warn { used: u64, budget: u64 },
    /// Projected usage crosses the budget before the plan finishes.
    Forecast { predicted: u64, budget: u64 },
    /// The budget is spent.
    Exceeded { used: u64, budget: u64 },
}

/// Tracks token usage against an optional budget.
#[derive(Debug)]
pub struct BudgetTracker {
    budget: Option<u64>,
    warned: bool,
    forecast_warned: bool,
}

impl BudgetTracker {
    pub fn new(budget: Option<u64>) -> Self {
        Self {
            budget,
            warned: false,
            forecast_warned: false,
        }
    }

    /// Check usage after a stage boundary. `stages_completed` and
    /// `stages_total` drive the forecast.
    pub fn check(
        &mut self,
        used: u64,
        stages_completed: usize,
        stages_total: usize,
    ) -> Option<BudgetSignal> {
        let budget = self.budget?;

        if used >= budget {
            return Some(BudgetSignal::Exceeded { used, budget });
        }

        let warn_at = (budget as f64 * WARN_RATIO) as u64;
        if used >= warn_at {
            if !self.warned {
                self.warned = true;
                return Some(BudgetSignal::Warn { used, budget });
            }
            return None;
        }

        // Forecast only fires while actual usage is still at or below the
        // warn threshold.
        if stages_completed > 0 && stages_total > stages_completed && !self.forecast_warned {
            let average = used / stages_completed as u64;
            let remaining = (stages_total - stages_completed) as u64;
            let predicted = used + average * remaining;
            if predicted > budget {
                self.forecast_warned = true;
                return Some(BudgetSignal::Forecast { predicted, budget });
            }
        }

        None
    }
}
