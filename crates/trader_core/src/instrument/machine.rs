//! Per-instrument trading state machine.
//!
//! Events go in, [`Effect`]s come out; the machine never performs I/O
//! beyond its store. The caller executes `Submit` effects against the
//! order gateway and feeds the verdict back through
//! [`InstrumentStateMachine::on_submit_outcome`].
//!
//! **Hard rules:**
//! - Never panic on out-of-order or replayed notices.
//! - Every lifecycle step goes through [`LifecycleState::is_valid_successor`].
//! - A mutation is persisted before it becomes visible in memory.
//! - A pending order blocks both triggers until it resolves.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, info, warn};

use crate::codec::{FillKind, FillNotice, MarketEvent, ViDirection};
use crate::error::PersistenceError;
use crate::idempotency::{compute_fill_fingerprint, format_fingerprint};

use super::order::{
    Holding, OrderIntent, OrderPrice, Price, Side, SubmitOutcome, TriggerReason,
};
use super::state::{InstrumentState, LifecycleState, PendingOrder};
use super::store::InstrumentStore;

// --- Events & effects ---------------------------------------------------

/// Typed input routed to one instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentEvent {
    Quote { best_bid: Price, best_ask: Price },
    Trade { last_price: Price },
    Volatility { direction: ViDirection, trigger_price: Price },
    Fill(FillNotice),
}

impl From<&MarketEvent> for InstrumentEvent {
    fn from(event: &MarketEvent) -> Self {
        match event {
            MarketEvent::Quote(q) => InstrumentEvent::Quote {
                best_bid: q.best_bid,
                best_ask: q.best_ask,
            },
            MarketEvent::Trade(t) => InstrumentEvent::Trade {
                last_price: t.last_price,
            },
            MarketEvent::Volatility(v) => InstrumentEvent::Volatility {
                direction: v.direction,
                trigger_price: v.trigger_price,
            },
        }
    }
}

/// Work the caller must carry out after a successful `handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Place this order and report back via `on_submit_outcome`.
    Submit(OrderIntent),
    /// Fire-and-forget operator notification.
    Notify(String),
    /// Fetch this symbol's holding and pass it to `refresh_holding`.
    RefreshHolding,
}

// --- Machine ------------------------------------------------------------

/// Owns one symbol's [`InstrumentState`] and its persistence.
pub struct InstrumentStateMachine {
    state: InstrumentState,
    store: Arc<dyn InstrumentStore>,
    transitions: u64,
}

impl std::fmt::Debug for InstrumentStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentStateMachine")
            .field("symbol", &self.state.symbol)
            .field("lifecycle", &self.state.lifecycle)
            .field("held_quantity", &self.state.held_quantity)
            .finish()
    }
}

impl InstrumentStateMachine {
    /// Wrap an already-persisted (or freshly seeded) record.
    pub fn new(state: InstrumentState, store: Arc<dyn InstrumentStore>) -> Self {
        Self {
            state,
            store,
            transitions: 0,
        }
    }

    pub fn state(&self) -> &InstrumentState {
        &self.state
    }

    pub fn symbol(&self) -> &str {
        &self.state.symbol
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.lifecycle
    }

    /// Number of lifecycle changes committed by this instance.
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Apply one routed event.
    pub fn handle(
        &mut self,
        event: &InstrumentEvent,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Effect>, PersistenceError> {
        match event {
            InstrumentEvent::Quote { best_bid, best_ask } => {
                let mut next = self.state.clone();
                next.best_bid_price = nonzero(*best_bid);
                next.best_ask_price = nonzero(*best_ask);
                self.commit(next)?;
                Ok(Vec::new())
            }
            InstrumentEvent::Trade { last_price } => self.on_trade(*last_price, now),
            InstrumentEvent::Volatility {
                direction,
                trigger_price,
            } => self.on_volatility(*direction, *trigger_price),
            InstrumentEvent::Fill(notice) => self.on_fill(notice, now),
        }
    }

    fn on_trade(
        &mut self,
        last_price: Price,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Effect>, PersistenceError> {
        if last_price == 0 {
            debug!(symbol = %self.state.symbol, "zero trade price ignored");
            return Ok(Vec::new());
        }

        let mut next = self.state.clone();
        next.last_traded_price = Some(last_price);
        let mut effects = Vec::new();

        // buy first, then sell
        if let Some(intent) = arm_buy(&mut next, now) {
            effects.push(Effect::Notify(format!(
                "[BUY] {} {} <= {}, ordering {} shares",
                label(&next),
                last_price,
                next.buy_trigger_price,
                intent.quantity
            )));
            effects.push(Effect::Submit(intent));
        }
        if next.sell_trigger_price_modified > 0 && last_price >= next.sell_trigger_price_modified {
            if let Some(intent) = arm_sell(&mut next, now, TriggerReason::SellSignal) {
                effects.push(Effect::Notify(format!(
                    "[SELL] {} {} >= {}, ordering {} shares",
                    label(&next),
                    last_price,
                    next.sell_trigger_price_modified,
                    intent.quantity
                )));
                effects.push(Effect::Submit(intent));
            }
        }

        self.commit(next)?;
        Ok(effects)
    }

    fn on_volatility(
        &mut self,
        direction: ViDirection,
        trigger_price: Price,
    ) -> Result<Vec<Effect>, PersistenceError> {
        if trigger_price == 0 {
            warn!(symbol = %self.state.symbol, "volatility interrupt without a price ignored");
            return Ok(Vec::new());
        }

        let mut next = self.state.clone();
        let note = match direction {
            ViDirection::Up => {
                next.buy_trigger_price = trigger_price;
                format!("[VI UP] {} buy trigger -> {}", label(&next), trigger_price)
            }
            ViDirection::Down => {
                next.sell_trigger_price_modified = trigger_price;
                format!("[VI DOWN] {} sell trigger -> {}", label(&next), trigger_price)
            }
        };
        info!(symbol = %next.symbol, ?direction, trigger_price, "volatility interrupt");
        self.commit(next)?;
        Ok(vec![Effect::Notify(note)])
    }

    /// Feed back the gateway verdict for a `Submit` effect.
    pub fn on_submit_outcome(
        &mut self,
        side: Side,
        outcome: &SubmitOutcome,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Effect>, PersistenceError> {
        let Some(pending) = self.state.pending_order.as_ref() else {
            warn!(symbol = %self.state.symbol, side = side.as_str(), "submit outcome without a pending order");
            return Ok(Vec::new());
        };
        if pending.side != side {
            warn!(
                symbol = %self.state.symbol,
                side = side.as_str(),
                pending = pending.side.as_str(),
                "submit outcome for the wrong side"
            );
            return Ok(Vec::new());
        }
        if pending.broker_accepted {
            debug!(symbol = %self.state.symbol, side = side.as_str(), "order already accepted; outcome ignored");
            return Ok(Vec::new());
        }

        let mut next = self.state.clone();
        let mut effects = Vec::new();
        match outcome {
            SubmitOutcome::Accepted { message } => {
                if next.lifecycle == prior_state(side)
                    && !advance(&mut next, submitted_state(side))
                {
                    return Ok(Vec::new());
                }
                if let Some(p) = next.pending_order.as_mut() {
                    p.broker_accepted = true;
                }
                info!(symbol = %next.symbol, side = side.as_str(), %message, "order accepted");
            }
            SubmitOutcome::Rejected { message } => {
                if next.lifecycle == submitted_state(side)
                    && !advance(&mut next, prior_state(side))
                {
                    return Ok(Vec::new());
                }
                clear_submission(&mut next, side);
                warn!(symbol = %next.symbol, side = side.as_str(), %message, "order rejected");
                effects.push(Effect::Notify(format!(
                    "[REJECTED] {} {} order at {}: {}",
                    label(&next),
                    side.as_str(),
                    now.format("%H:%M:%S"),
                    message
                )));
            }
        }

        self.commit(next)?;
        Ok(effects)
    }

    fn on_fill(
        &mut self,
        notice: &FillNotice,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Effect>, PersistenceError> {
        let fingerprint = format_fingerprint(compute_fill_fingerprint(notice));
        if self.state.has_applied_fill(&fingerprint) {
            debug!(symbol = %self.state.symbol, %fingerprint, "replayed fill notice ignored");
            return Ok(Vec::new());
        }

        let mut next = self.state.clone();
        let applied = if notice.refused {
            apply_refusal(&mut next, notice)
        } else {
            match notice.kind {
                FillKind::Accept => apply_accept(&mut next, notice, now),
                FillKind::Confirm => apply_confirm(&mut next, notice, now),
            }
        };
        let Some(effects) = applied else {
            return Ok(Vec::new());
        };

        next.record_applied_fill(fingerprint);
        self.commit(next)?;
        Ok(effects)
    }

    /// Startup reconciliation against the broker's holding for this symbol
    /// (`None` when the broker reports no position).
    ///
    /// Stable states adopt the broker quantity. Interrupted orders are
    /// collapsed on it and never re-submitted.
    pub fn reconcile(
        &mut self,
        holding: Option<&Holding>,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Effect>, PersistenceError> {
        let broker_qty = holding.map_or(0, |h| h.quantity);
        let mut next = self.state.clone();
        let mut effects = Vec::new();
        apply_holding_metadata(&mut next, holding);

        let interrupted = next
            .pending_order
            .as_ref()
            .map(|p| p.side)
            .or(next.lifecycle.in_flight_side());

        if let Some(side) = interrupted {
            let to = match (broker_qty > 0, side) {
                (true, _) => LifecycleState::ToSell,
                (false, Side::Buy) => LifecycleState::ToBuy,
                (false, Side::Sell) => LifecycleState::SoldCompleted,
            };
            warn!(
                symbol = %next.symbol,
                from = %next.lifecycle,
                to = %to,
                broker_qty,
                "collapsing interrupted order on broker holdings"
            );
            effects.push(Effect::Notify(format!(
                "[RECONCILE] {} interrupted {} order at {}: {} -> {}, held {}",
                label(&next),
                side.as_str(),
                now.format("%H:%M:%S"),
                next.lifecycle,
                to,
                broker_qty
            )));
            next.lifecycle = to;
            next.held_quantity = broker_qty;
            next.pending_order = None;
            next.buy_quantity_submitted = 0;
            next.sell_quantity_submitted = 0;
        } else if next.lifecycle.is_terminal() {
            if broker_qty > 0 {
                warn!(symbol = %next.symbol, broker_qty, "completed instrument still held at broker");
            }
            next.held_quantity = broker_qty;
        } else {
            next.held_quantity = broker_qty;
            next.lifecycle = LifecycleState::initial_for(broker_qty);
        }

        refresh_sell_target(&mut next);
        self.commit(next)?;
        Ok(effects)
    }

    /// Mid-session refresh after a buy completes. Adopts holding metadata
    /// and the derived sell target but never the quantity or lifecycle.
    pub fn refresh_holding(&mut self, holding: &Holding) -> Result<(), PersistenceError> {
        let mut next = self.state.clone();
        apply_holding_metadata(&mut next, Some(holding));
        if next.held_quantity > 0 {
            if let Some(target) = next.derived_sell_target() {
                next.sell_trigger_price_modified = target;
            }
        }
        self.commit(next)
    }

    /// End-of-day liquidation: market-sell the full position through the
    /// normal sell path unless it was acquired today.
    pub fn liquidate(
        &mut self,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Effect>, PersistenceError> {
        if self.state.acquired_today {
            debug!(symbol = %self.state.symbol, "acquired today, not liquidated");
            return Ok(Vec::new());
        }
        let mut next = self.state.clone();
        let Some(intent) = arm_sell(&mut next, now, TriggerReason::Liquidation) else {
            return Ok(Vec::new());
        };
        let effects = vec![
            Effect::Notify(format!(
                "[LIQUIDATE] {} market sell {} shares",
                label(&next),
                intent.quantity
            )),
            Effect::Submit(intent),
        ];
        self.commit(next)?;
        Ok(effects)
    }

    /// Persist `next` and, only on success, make it current.
    fn commit(&mut self, next: InstrumentState) -> Result<(), PersistenceError> {
        if next == self.state {
            return Ok(());
        }
        self.store.persist(&next)?;

        let from = self.state.lifecycle;
        self.state = next;
        if from != self.state.lifecycle {
            self.transitions += 1;
            info!(
                symbol = %self.state.symbol,
                from = %from,
                to = %self.state.lifecycle,
                held = self.state.held_quantity,
                "lifecycle transition"
            );
        }
        Ok(())
    }
}

// --- Trigger arming -----------------------------------------------------

/// Record a pending buy if the buy trigger holds.
fn arm_buy(next: &mut InstrumentState, now: DateTime<FixedOffset>) -> Option<OrderIntent> {
    if next.lifecycle != LifecycleState::ToBuy || next.pending_order.is_some() {
        return None;
    }
    let last = next.last_traded_price?;
    if last > next.buy_trigger_price || now < next.trading_window_start {
        return None;
    }

    let quantity = if next.buy_budget > 0 {
        next.buy_budget / last
    } else {
        next.buy_quantity_original
    };
    if quantity == 0 {
        debug!(symbol = %next.symbol, last, budget = next.buy_budget, "buy trigger met but quantity is zero");
        return None;
    }

    next.buy_quantity_submitted = quantity;
    next.buy_order_price_modified = next.best_bid_price.unwrap_or(last);
    next.pending_order = Some(PendingOrder {
        side: Side::Buy,
        quantity,
        recorded_at: now,
        broker_accepted: false,
    });
    Some(OrderIntent {
        symbol: next.symbol.clone(),
        side: Side::Buy,
        quantity,
        price: OrderPrice::Market,
        reason: TriggerReason::BuySignal,
    })
}

/// Record a pending full-position sell. Price conditions are the caller's.
fn arm_sell(
    next: &mut InstrumentState,
    now: DateTime<FixedOffset>,
    reason: TriggerReason,
) -> Option<OrderIntent> {
    if next.lifecycle != LifecycleState::ToSell
        || next.pending_order.is_some()
        || next.held_quantity == 0
    {
        return None;
    }

    let quantity = next.held_quantity;
    next.sell_quantity_submitted = quantity;
    next.pending_order = Some(PendingOrder {
        side: Side::Sell,
        quantity,
        recorded_at: now,
        broker_accepted: false,
    });
    Some(OrderIntent {
        symbol: next.symbol.clone(),
        side: Side::Sell,
        quantity,
        price: OrderPrice::Market,
        reason,
    })
}

// --- Fill application ---------------------------------------------------
//
// Each returns `None` when the notice does not apply to the current state;
// the copy is then discarded and the fingerprint is not recorded.

fn apply_refusal(next: &mut InstrumentState, notice: &FillNotice) -> Option<Vec<Effect>> {
    let side = notice.side;
    let has_pending = next.pending_order.as_ref().is_some_and(|p| p.side == side);
    if next.lifecycle != submitted_state(side)
        && !(next.lifecycle == prior_state(side) && has_pending)
    {
        warn!(symbol = %next.symbol, lifecycle = %next.lifecycle, "refusal notice ignored");
        return None;
    }
    if !advance(next, prior_state(side)) {
        return None;
    }
    clear_submission(next, side);
    Some(vec![Effect::Notify(format!(
        "[REFUSED] {} {} order {} refused by the exchange",
        label(next),
        side.as_str(),
        notice.order_number
    ))])
}

fn apply_accept(
    next: &mut InstrumentState,
    notice: &FillNotice,
    now: DateTime<FixedOffset>,
) -> Option<Vec<Effect>> {
    let side = notice.side;
    if !enter_submitted(next, notice, now) {
        return None;
    }
    if notice.order_quantity > 0 {
        match side {
            Side::Buy => next.buy_quantity_submitted = notice.order_quantity,
            Side::Sell => next.sell_quantity_submitted = notice.order_quantity,
        }
    }
    debug!(
        symbol = %next.symbol,
        side = side.as_str(),
        order_no = %notice.order_number,
        order_qty = notice.order_quantity,
        "order accepted by exchange"
    );
    Some(Vec::new())
}

fn apply_confirm(
    next: &mut InstrumentState,
    notice: &FillNotice,
    now: DateTime<FixedOffset>,
) -> Option<Vec<Effect>> {
    if notice.filled_quantity == 0 {
        debug!(symbol = %next.symbol, order_no = %notice.order_number, "empty fill confirmation ignored");
        return None;
    }
    if !enter_submitted(next, notice, now) {
        return None;
    }

    match notice.side {
        Side::Buy => {
            let Some(held) = next.held_quantity.checked_add(notice.filled_quantity) else {
                warn!(symbol = %next.symbol, "buy fill overflows held quantity; rejected");
                return None;
            };
            next.held_quantity = held;
            let target = if next.buy_quantity_submitted > 0 {
                next.buy_quantity_submitted
            } else {
                notice.order_quantity
            };

            if held >= target {
                if !advance(next, LifecycleState::ToSell) {
                    return None;
                }
                next.pending_order = None;
                Some(vec![
                    Effect::Notify(format!(
                        "[BOUGHT] {} {} shares @ {}, holding {}",
                        label(next),
                        notice.filled_quantity,
                        notice.filled_price,
                        held
                    )),
                    Effect::RefreshHolding,
                ])
            } else {
                if !advance(next, LifecycleState::BoughtPartialFilled) {
                    return None;
                }
                Some(vec![Effect::Notify(format!(
                    "[BUY FILL] {} {} shares @ {} ({}/{})",
                    label(next),
                    notice.filled_quantity,
                    notice.filled_price,
                    held,
                    target
                ))])
            }
        }
        Side::Sell => {
            let Some(remaining) = next.held_quantity.checked_sub(notice.filled_quantity) else {
                warn!(
                    symbol = %next.symbol,
                    held = next.held_quantity,
                    filled = notice.filled_quantity,
                    "sell fill would drive held quantity negative; rejected"
                );
                return None;
            };
            next.held_quantity = remaining;

            if remaining == 0 {
                if !advance(next, LifecycleState::SoldCompleted) {
                    return None;
                }
                next.pending_order = None;
                Some(vec![Effect::Notify(format!(
                    "[SOLD] {} {} shares @ {}, position closed",
                    label(next),
                    notice.filled_quantity,
                    notice.filled_price
                ))])
            } else {
                if !advance(next, LifecycleState::SoldPartialFilled) {
                    return None;
                }
                Some(vec![Effect::Notify(format!(
                    "[SELL FILL] {} {} shares @ {}, {} remaining",
                    label(next),
                    notice.filled_quantity,
                    notice.filled_price,
                    remaining
                ))])
            }
        }
    }
}

/// Move into the notice side's submitted state if not already past it.
///
/// A notice for an order with no recorded submission (e.g. a gateway
/// timeout that actually reached the broker) is adopted as broker truth.
fn enter_submitted(
    next: &mut InstrumentState,
    notice: &FillNotice,
    now: DateTime<FixedOffset>,
) -> bool {
    let side = notice.side;
    let partial = match side {
        Side::Buy => LifecycleState::BoughtPartialFilled,
        Side::Sell => LifecycleState::SoldPartialFilled,
    };
    if next.lifecycle == submitted_state(side) || next.lifecycle == partial {
        if let Some(p) = next.pending_order.as_mut() {
            p.broker_accepted = true;
        }
        return true;
    }
    if next.lifecycle != prior_state(side) {
        warn!(
            symbol = %next.symbol,
            lifecycle = %next.lifecycle,
            side = side.as_str(),
            kind = notice.kind.as_str(),
            "fill notice does not apply in this state; ignored"
        );
        return false;
    }

    match next.pending_order.as_mut() {
        Some(p) if p.side == side => p.broker_accepted = true,
        Some(_) => return false,
        None => {
            warn!(
                symbol = %next.symbol,
                side = side.as_str(),
                order_no = %notice.order_number,
                "notice for an unrecorded order; adopting"
            );
            next.pending_order = Some(PendingOrder {
                side,
                quantity: notice.order_quantity,
                recorded_at: now,
                broker_accepted: true,
            });
        }
    }
    advance(next, submitted_state(side))
}

// --- Helpers ------------------------------------------------------------

/// Take one lifecycle step if the graph allows it.
fn advance(next: &mut InstrumentState, to: LifecycleState) -> bool {
    if !next.lifecycle.is_valid_successor(to) {
        warn!(symbol = %next.symbol, from = %next.lifecycle, to = %to, "refused lifecycle edge");
        return false;
    }
    next.lifecycle = to;
    true
}

fn submitted_state(side: Side) -> LifecycleState {
    match side {
        Side::Buy => LifecycleState::BuySubmitted,
        Side::Sell => LifecycleState::SellSubmitted,
    }
}

fn prior_state(side: Side) -> LifecycleState {
    match side {
        Side::Buy => LifecycleState::ToBuy,
        Side::Sell => LifecycleState::ToSell,
    }
}

fn clear_submission(next: &mut InstrumentState, side: Side) {
    next.pending_order = None;
    match side {
        Side::Buy => next.buy_quantity_submitted = 0,
        Side::Sell => next.sell_quantity_submitted = 0,
    }
}

fn apply_holding_metadata(next: &mut InstrumentState, holding: Option<&Holding>) {
    match holding {
        Some(h) => {
            next.average_purchase_price = h.average_price;
            next.acquired_today = h.bought_today > 0;
            if next.display_name.is_empty() {
                next.display_name = h.display_name.clone();
            }
        }
        None => {
            next.average_purchase_price = None;
            next.acquired_today = false;
        }
    }
}

fn refresh_sell_target(next: &mut InstrumentState) {
    if next.held_quantity > 0 {
        if let Some(target) = next.derived_sell_target() {
            next.sell_trigger_price_modified = target;
        }
    } else if next.lifecycle == LifecycleState::ToBuy {
        next.sell_trigger_price_modified = next.sell_trigger_price_original;
    }
}

fn nonzero(price: Price) -> Option<Price> {
    (price > 0).then_some(price)
}

fn label(state: &InstrumentState) -> String {
    format!("{}({})", state.display_name, state.symbol)
}
