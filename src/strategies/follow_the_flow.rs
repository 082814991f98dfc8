//! Follow-the-flow: trade in the direction of the liquidation cascade

use super::{breaches, pick_entry, Strategy};
use crate::config::StrategyParams;
use crate::{Bar, LiquidationBucket, Side, Signal};

#[derive(Debug, Clone, Copy, Default)]
pub struct FollowTheFlow;

impl Strategy for FollowTheFlow {
    fn name(&self) -> &'static str {
        "follow-the-flow"
    }

    fn evaluate(&self, _bar: &Bar, bucket: &LiquidationBucket, params: &StrategyParams) -> Signal {
        let long = breaches(
            bucket.buy_usd,
            params.entry_threshold(Side::Buy, Side::Buy, bucket),
        );
        let short = breaches(
            bucket.sell_usd,
            params.entry_threshold(Side::Sell, Side::Sell, bucket),
        );
        pick_entry(long, short)
    }
}
