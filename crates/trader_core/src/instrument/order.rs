//! Broker-facing value types: order sides, intents, submit outcomes and
//! holdings as reported by the account balance endpoint.

use serde::{Deserialize, Serialize};

/// Whole-won price. KRX equities never trade at fractional won.
pub type Price = u64;
/// Share count.
pub type Quantity = u64;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Map the fill-notice side code (`"01"` sell, `"02"` buy).
    pub fn from_fill_code(code: &str) -> Option<Self> {
        match code {
            "01" => Some(Side::Sell),
            "02" => Some(Side::Buy),
            _ => None,
        }
    }
}

/// Pricing instruction sent with an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPrice {
    Market,
    /// Limit order at this price; triggers always emit `Market`.
    Limit(Price),
}

/// What caused an order to be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    BuySignal,
    SellSignal,
    Liquidation,
}

/// An order the state machine wants placed.
///
/// The machine records a pending marker before handing this out, so the
/// same intent is never emitted twice for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: Quantity,
    pub price: OrderPrice,
    pub reason: TriggerReason,
}

/// Gateway verdict on a submitted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { message: String },
    Rejected { message: String },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            SubmitOutcome::Accepted { message } | SubmitOutcome::Rejected { message } => message,
        }
    }
}

/// One position line from the broker's balance inquiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub display_name: String,
    pub quantity: Quantity,
    /// Average purchase price; fractional on the broker side.
    pub average_price: Option<f64>,
    pub current_price: Option<Price>,
    /// Shares bought during the current session.
    pub bought_today: Quantity,
    /// Evaluation profit rate in percent.
    pub profit_rate: Option<f64>,
}
