//! Counter-trade: fade the side that just got liquidated
//!
//! Heavy sell-side liquidations (longs being flushed) open a long, heavy
//! buy-side liquidations (shorts being squeezed) open a short.

use super::{breaches, pick_entry, Strategy};
use crate::config::StrategyParams;
use crate::{Bar, LiquidationBucket, Side, Signal};

#[derive(Debug, Clone, Copy, Default)]
pub struct CounterTrade;

impl Strategy for CounterTrade {
    fn name(&self) -> &'static str {
        "counter-trade"
    }

    fn evaluate(&self, _bar: &Bar, bucket: &LiquidationBucket, params: &StrategyParams) -> Signal {
        let long = breaches(
            bucket.sell_usd,
            params.entry_threshold(Side::Buy, Side::Sell, bucket),
        );
        let short = breaches(
            bucket.buy_usd,
            params.entry_threshold(Side::Sell, Side::Buy, bucket),
        );
        pick_entry(long, short)
    }
}
