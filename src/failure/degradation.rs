//! Monotonic degradation chain applied under recovery or budget pressure.
//!
//! Strategies apply in a fixed order, at most one per invocation, and the
//! chain never rewinds:
//!
//! 1. `switch_model` — only when a configured fallback model differs from
//!    the current one
//! 2. `reduce_scope` — only when skipping non-critical tasks is enabled
//! 3. `serial_mode` — drop parallelism to one
//! 4. `graceful_stop` — set the stop flag and wind the run down

use serde::{Deserialize, Serialize};

/// One degradation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationStrategy {
    SwitchModel,
    ReduceScope,
    SerialMode,
    GracefulStop,
}

/// Fixed application order.
const STRATEGY_ORDER: &[DegradationStrategy] = &[
    DegradationStrategy::SwitchModel,
    DegradationStrategy::ReduceScope,
    DegradationStrategy::SerialMode,
    DegradationStrategy::GracefulStop,
];

/// Static configuration for the chain.
#[derive(Debug, Clone, Default)]
pub struct DegradationConfig {
    /// Fallback model for `switch_model`.
    pub fallback_model: Option<String>,
    /// Whether `reduce_scope` may skip non-completed tasks.
    pub skip_non_critical: bool,
}

/// The monotonic strategy chain. `level` only moves forward.
#[derive(Debug)]
pub struct DegradationChain {
    config: DegradationConfig,
    level: usize,
    applied: Vec<DegradationStrategy>,
}

impl DegradationChain {
    /// Create a chain with the given configuration.
    pub fn new(config: DegradationConfig) -> Self {
        Self {
            config,
            level: 0,
            applied: Vec::new(),
        }
    }

    /// Check whether any strategy remains to apply.
    pub fn can_degrade(&self) -> bool {
        !self.applied.contains(&DegradationStrategy::GracefulStop)
            && self.level < STRATEGY_ORDER.len()
    }

    /// Strategies applied so far, in order.
    pub fn applied(&self) -> &[DegradationStrategy] {
        &self.applied
    }

    fn applicable(&self, strategy: DegradationStrategy, current_model: &str) -> bool {
        match strategy {
            DegradationStrategy::SwitchModel => self
                .config
                .fallback_model
                .as_deref()
                .is_some_and(|fb| fb != current_model),
            DegradationStrategy::ReduceScope => self.config.skip_non_critical,
            DegradationStrategy::SerialMode | DegradationStrategy::GracefulStop => true,
        }
    }

    /// Advance to and return the next applicable strategy, or None when
    /// the chain is exhausted. Inapplicable strategies are skipped and
    /// never revisited.
    pub fn apply_next(&mut self, current_model: &str) -> Option<DegradationStrategy> {
        while self.level < STRATEGY_ORDER.len() {
            let strategy = STRATEGY_ORDER[self.level];
            self.level += 1;
            if self.applicable(strategy, current_model) {
                self.applied.push(strategy);
                return Some(strategy);
            }
        }
        None
    }

    /// The fallback model for `switch_model`, when configured.
    pub fn fallback_model(&self) -> Option<&str> {
        self.config.fallback_model.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_chain_in_order() {
        let mut chain = DegradationChain::new(DegradationConfig {
            fallback_model: Some("small-model".into()),
            skip_non_critical: true,
        });

        assert_eq!(
            chain.apply_next("big-model"),
            Some(DegradationStrategy::SwitchModel)
        );
        assert_eq!(
            chain.apply_next("small-model"),
            Some(DegradationStrategy::ReduceScope)
        );
        assert_eq!(
            chain.apply_next("small-model"),
            Some(DegradationStrategy::SerialMode)
        );
        assert!(chain.can_degrade());
        assert_eq!(
            chain.apply_next("small-model"),
            Some(DegradationStrategy::GracefulStop)
        );
        assert!(!chain.can_degrade());
        assert_eq!(chain.apply_next("small-model"), None);
    }

    #[test]
    fn test_switch_model_skipped_without_fallback() {
        let mut chain = DegradationChain::new(DegradationConfig {
            fallback_model: None,
            skip_non_critical: true,
        });
        assert_eq!(
            chain.apply_next("big-model"),
            Some(DegradationStrategy::ReduceScope)
        );
    }

    #[test]
    fn test_switch_model_skipped_when_already_on_fallback() {
        let mut chain = DegradationChain::new(DegradationConfig {
            fallback_model: Some("small-model".into()),
            skip_non_critical: false,
        });
        // Already running the fallback: both switch_model and reduce_scope
        // are inapplicable, so serial mode comes first.
        assert_eq!(
            chain.apply_next("small-model"),
            Some(DegradationStrategy::SerialMode)
        );
    }

    #[test]
    fn test_chain_never_rewinds() {
        let mut chain = DegradationChain::new(DegradationConfig::default());
        assert_eq!(
            chain.apply_next("m"),
            Some(DegradationStrategy::SerialMode)
        );
        assert_eq!(
            chain.apply_next("m"),
            Some(DegradationStrategy::GracefulStop)
        );
        assert_eq!(chain.apply_next("m"), None);
        assert_eq!(
            chain.applied(),
            &[
                DegradationStrategy::SerialMode,
                DegradationStrategy::GracefulStop
            ]
        );
    }

    #[test]
    fn test_one_strategy_per_invocation() {
        let mut chain = DegradationChain::new(DegradationConfig {
            fallback_model: Some("fb".into()),
            skip_non_critical: true,
        });
        let first = chain.apply_next("m").unwrap();
        assert_eq!(chain.applied().len(), 1);
        assert_eq!(first, DegradationStrategy::SwitchModel);
    }
}
