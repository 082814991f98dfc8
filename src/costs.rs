//! Cost model: slippage, commission and leverage-adjusted sizing
//!
//! All functions are pure. Slippage is a fraction of price here; the parameter
//! set stores it as a percent and the engine converts once per run.

use crate::error::BacktestError;
use crate::Side;

/// Fill price after slippage. Buys pay up, sells receive less.
pub fn apply_slippage(price: f64, side: Side, slippage: f64) -> f64 {
    match side {
        Side::Buy => price * (1.0 + slippage),
        Side::Sell => price * (1.0 - slippage),
    }
}

/// Inverse of [`apply_slippage`]
pub fn remove_slippage(fill: f64, side: Side, slippage: f64) -> f64 {
    match side {
        Side::Buy => fill / (1.0 + slippage),
        Side::Sell => fill / (1.0 - slippage),
    }
}

/// Commission on `notional`, `commission_pct` in percent
pub fn commission(notional: f64, commission_pct: f64) -> f64 {
    notional.abs() * commission_pct / 100.0
}

/// Position size in units of the base asset.
///
/// `equity * fraction * leverage / price`. Fails when there is no equity left
/// or the margin plus the entry commission does not fit into it.
pub fn position_size(
    equity: f64,
    fraction: f64,
    leverage: f64,
    price: f64,
    commission_pct: f64,
) -> Result<f64, BacktestError> {
    if equity <= 0.0 || price <= 0.0 {
        return Err(BacktestError::InsufficientEquity {
            required: 0.0,
            available: equity,
        });
    }

    let notional = equity * fraction * leverage;
    let margin = notional / leverage;
    let required = margin + commission(notional, commission_pct);
    if required > equity {
        return Err(BacktestError::InsufficientEquity {
            required,
            available: equity,
        });
    }

    Ok(notional / price)
}
