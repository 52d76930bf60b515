//! Per-instrument persisted record and the lifecycle graph it moves along.
//!
//! **States:** `ToBuy -> BuySubmitted -> BoughtPartialFilled -> ToSell ->
//! SellSubmitted -> SoldPartialFilled -> SoldCompleted`
//!
//! [`LifecycleState::is_valid_successor`] is the single whitelist of
//! event-driven edges. The machine refuses any commit that would take an
//! edge outside it. Startup reconciliation and day rollover are the only
//! writers allowed to jump, and they log when they do.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::order::{Price, Quantity, Side};

/// Number of applied fill fingerprints kept per instrument.
pub const APPLIED_FILL_HISTORY: usize = 64;

// --- Lifecycle ----------------------------------------------------------

/// Trading state of one instrument's buy/sell cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    ToBuy,
    BuySubmitted,
    BoughtPartialFilled,
    ToSell,
    SellSubmitted,
    SoldPartialFilled,
    SoldCompleted,
}

impl LifecycleState {
    /// Starting state for a given held quantity.
    pub fn initial_for(held: Quantity) -> Self {
        if held > 0 {
            LifecycleState::ToSell
        } else {
            LifecycleState::ToBuy
        }
    }

    /// Whether this state is terminal for the current cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::SoldCompleted)
    }

    /// Side of the order outstanding in this state, if any.
    pub fn in_flight_side(self) -> Option<Side> {
        match self {
            LifecycleState::BuySubmitted | LifecycleState::BoughtPartialFilled => Some(Side::Buy),
            LifecycleState::SellSubmitted | LifecycleState::SoldPartialFilled => Some(Side::Sell),
            _ => None,
        }
    }

    /// Whether `next` is a legal event-driven successor of `self`.
    ///
    /// Partial-fill states may loop on themselves; every other same-state
    /// pair is a field update, not a transition, and is also accepted.
    pub fn is_valid_successor(self, next: Self) -> bool {
        use LifecycleState::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (ToBuy, BuySubmitted)
                | (BuySubmitted, BoughtPartialFilled)
                | (BuySubmitted, ToSell)
                | (BoughtPartialFilled, ToSell)
                | (ToSell, SellSubmitted)
                | (SellSubmitted, SoldPartialFilled)
                | (SellSubmitted, SoldCompleted)
                | (SoldPartialFilled, SoldCompleted)
                // rejection returns to the prior stable state
                | (BuySubmitted, ToBuy)
                | (SellSubmitted, ToSell)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::ToBuy => "TO_BUY",
            LifecycleState::BuySubmitted => "BUY_SUBMITTED",
            LifecycleState::BoughtPartialFilled => "BOUGHT_PARTIAL_FILLED",
            LifecycleState::ToSell => "TO_SELL",
            LifecycleState::SellSubmitted => "SELL_SUBMITTED",
            LifecycleState::SoldPartialFilled => "SOLD_PARTIAL_FILLED",
            LifecycleState::SoldCompleted => "SOLD_COMPLETED",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Pending order ------------------------------------------------------

/// A submission recorded before the gateway call.
///
/// While present, neither trigger may fire for this instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub side: Side,
    pub quantity: Quantity,
    pub recorded_at: DateTime<FixedOffset>,
    /// Set once the gateway (or an accept notice) confirms receipt.
    pub broker_accepted: bool,
}

// --- Seed ---------------------------------------------------------------

/// Universe entry an instrument record is created from at the start of a
/// trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSeed {
    pub symbol: String,
    pub display_name: String,
    pub buy_budget: u64,
    pub buy_trigger_price: Price,
    #[serde(default)]
    pub buy_quantity_original: Quantity,
    pub sell_trigger_price: Price,
    #[serde(default)]
    pub sell_target_ratio: Option<f64>,
    pub trading_window_start: DateTime<FixedOffset>,
    pub trading_window_end: DateTime<FixedOffset>,
}

// --- Instrument record --------------------------------------------------

/// Trading state of one symbol; the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    pub symbol: String,
    pub display_name: String,
    pub lifecycle: LifecycleState,
    pub held_quantity: Quantity,

    pub buy_budget: u64,
    pub buy_trigger_price: Price,
    pub buy_order_price_modified: Price,
    pub buy_quantity_original: Quantity,
    pub buy_quantity_submitted: Quantity,

    pub sell_trigger_price_original: Price,
    pub sell_trigger_price_modified: Price,
    pub sell_quantity_submitted: Quantity,
    pub sell_target_ratio: Option<f64>,

    pub trading_window_start: DateTime<FixedOffset>,
    pub trading_window_end: DateTime<FixedOffset>,

    pub last_traded_price: Option<Price>,
    pub best_bid_price: Option<Price>,
    pub best_ask_price: Option<Price>,

    pub average_purchase_price: Option<f64>,
    #[serde(default)]
    pub acquired_today: bool,

    #[serde(default)]
    pub pending_order: Option<PendingOrder>,
    /// Hex fingerprints of fill notices already applied, oldest first.
    #[serde(default)]
    pub applied_fills: Vec<String>,
}

impl InstrumentState {
    /// Fresh record for a new trading day. Lifecycle is fixed later by
    /// reconciliation against broker holdings.
    pub fn from_seed(seed: &InstrumentSeed) -> Self {
        Self {
            symbol: seed.symbol.clone(),
            display_name: seed.display_name.clone(),
            lifecycle: LifecycleState::ToBuy,
            held_quantity: 0,
            buy_budget: seed.buy_budget,
            buy_trigger_price: seed.buy_trigger_price,
            buy_order_price_modified: 0,
            buy_quantity_original: seed.buy_quantity_original,
            buy_quantity_submitted: 0,
            sell_trigger_price_original: seed.sell_trigger_price,
            sell_trigger_price_modified: seed.sell_trigger_price,
            sell_quantity_submitted: 0,
            sell_target_ratio: seed.sell_target_ratio,
            trading_window_start: seed.trading_window_start,
            trading_window_end: seed.trading_window_end,
            last_traded_price: None,
            best_bid_price: None,
            best_ask_price: None,
            average_purchase_price: None,
            acquired_today: false,
            pending_order: None,
            applied_fills: Vec::new(),
        }
    }

    /// Whether this record belongs to the same trading day as `seed`.
    pub fn same_session_as(&self, seed: &InstrumentSeed) -> bool {
        self.trading_window_start.date_naive() == seed.trading_window_start.date_naive()
    }

    pub fn has_applied_fill(&self, fingerprint: &str) -> bool {
        self.applied_fills.iter().any(|f| f == fingerprint)
    }

    /// Append a fingerprint, evicting the oldest beyond the history bound.
    pub fn record_applied_fill(&mut self, fingerprint: String) {
        self.applied_fills.push(fingerprint);
        if self.applied_fills.len() > APPLIED_FILL_HISTORY {
            let excess = self.applied_fills.len() - APPLIED_FILL_HISTORY;
            self.applied_fills.drain(..excess);
        }
    }

    /// Sell target derived from the average purchase price, when both the
    /// price and a target ratio are known.
    pub fn derived_sell_target(&self) -> Option<Price> {
        let avg = self.average_purchase_price?;
        let ratio = self.sell_target_ratio?;
        let target = (avg * (1.0 + ratio)).trunc();
        if target.is_finite() && target >= 1.0 {
            Some(target as Price)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_history_is_bounded() {
        let seed = InstrumentSeed {
            symbol: "005930".into(),
            display_name: "Samsung".into(),
            buy_budget: 1_000_000,
            buy_trigger_price: 70_000,
            buy_quantity_original: 0,
            sell_trigger_price: 75_000,
            sell_target_ratio: None,
            trading_window_start: DateTime::parse_from_rfc3339("2024-03-04T09:00:00+09:00")
                .unwrap(),
            trading_window_end: DateTime::parse_from_rfc3339("2024-03-04T15:20:00+09:00")
                .unwrap(),
        };
        let mut state = InstrumentState::from_seed(&seed);
        for i in 0..(APPLIED_FILL_HISTORY + 10) {
            state.record_applied_fill(format!("{i:016x}"));
        }
        assert_eq!(state.applied_fills.len(), APPLIED_FILL_HISTORY);
        assert!(!state.has_applied_fill(&format!("{:016x}", 0)));
        assert!(state.has_applied_fill(&format!("{:016x}", APPLIED_FILL_HISTORY + 9)));
    }

    #[test]
    fn derived_sell_target_truncates() {
        let seed = InstrumentSeed {
            symbol: "000660".into(),
            display_name: "Hynix".into(),
            buy_budget: 0,
            buy_trigger_price: 0,
            buy_quantity_original: 0,
            sell_trigger_price: 0,
            sell_target_ratio: Some(0.03),
            trading_window_start: DateTime::parse_from_rfc3339("2024-03-04T09:00:00+09:00")
                .unwrap(),
            trading_window_end: DateTime::parse_from_rfc3339("2024-03-04T15:20:00+09:00")
                .unwrap(),
        };
        let mut state = InstrumentState::from_seed(&seed);
        assert_eq!(state.derived_sell_target(), None);
        state.average_purchase_price = Some(10_001.0);
        // 10001 * 1.03 = 10301.03
        assert_eq!(state.derived_sell_target(), Some(10_301));
    }
}
