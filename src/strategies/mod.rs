//! Liquidation strategies
//!
//! A strategy turns one bar and its aligned liquidation bucket into a
//! [`Signal`]. Strategies are stateless; everything that evolves over a run
//! (open position, pending entries) lives in the engine.

pub mod counter_trade;
pub mod follow_the_flow;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::StrategyParams;
use crate::{Bar, LiquidationBucket, Signal};

pub use counter_trade::CounterTrade;
pub use follow_the_flow::FollowTheFlow;

// =============================================================================
// Strategy Trait
// =============================================================================

/// Trading strategy contract
pub trait Strategy: Send + Sync {
    /// Identifier, matches the config's `strategy_name`
    fn name(&self) -> &'static str;

    /// Signal for the step made of `bar` and the bucket completed by its close
    fn evaluate(&self, bar: &Bar, bucket: &LiquidationBucket, params: &StrategyParams) -> Signal;
}

/// `flow` reaches `threshold`. Empty buckets never trigger.
pub(crate) fn breaches(flow: f64, threshold: f64) -> bool {
    flow > 0.0 && flow >= threshold
}

/// Combine both entry checks; the long side wins when both fire
pub(crate) fn pick_entry(long: bool, short: bool) -> Signal {
    match (long, short) {
        (true, _) => Signal::EnterLong,
        (false, true) => Signal::EnterShort,
        (false, false) => Signal::None,
    }
}

// =============================================================================
// Strategy resolution
// =============================================================================

static COUNTER_TRADE: CounterTrade = CounterTrade;
static FOLLOW_THE_FLOW: FollowTheFlow = FollowTheFlow;

/// Known strategies, keyed by their config id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    CounterTrade,
    FollowTheFlow,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 2] = [StrategyKind::CounterTrade, StrategyKind::FollowTheFlow];

    pub fn resolve(self) -> &'static dyn Strategy {
        match self {
            StrategyKind::CounterTrade => &COUNTER_TRADE,
            StrategyKind::FollowTheFlow => &FOLLOW_THE_FLOW,
        }
    }

    pub fn id(self) -> &'static str {
        self.resolve().name()
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.id() == normalized)
            .ok_or_else(|| {
                format!(
                    "Unknown strategy: '{}'. Available: {}",
                    s,
                    available_strategies().join(", ")
                )
            })
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Get list of available strategy names
pub fn available_strategies() -> Vec<&'static str> {
    StrategyKind::ALL.iter().map(|k| k.id()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_id() {
        assert_eq!(
            "counter-trade".parse::<StrategyKind>().unwrap(),
            StrategyKind::CounterTrade
        );
        assert_eq!(
            "Follow_The_Flow".parse::<StrategyKind>().unwrap(),
            StrategyKind::FollowTheFlow
        );
        assert!("grid".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_names_round_trip() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.to_string().parse::<StrategyKind>().unwrap(), kind);
        }
        assert_eq!(available_strategies(), vec!["counter-trade", "follow-the-flow"]);
    }

    #[test]
    fn test_long_wins_when_both_fire() {
        assert_eq!(pick_entry(true, true), Signal::EnterLong);
        assert_eq!(pick_entry(false, true), Signal::EnterShort);
        assert_eq!(pick_entry(false, false), Signal::None);
    }
}
