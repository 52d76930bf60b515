//! I/O-free half of the stream dispatcher.
//!
//! `raw record -> FrameDecoder -> (cipher) -> symbol lookup -> machine`.
//! Decode and routing failures are dropped here and never leave the
//! router; only a [`PersistenceError`] propagates.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, info, warn};

use crate::codec::{ControlMessage, EncryptedFillNotice, Frame, FrameDecoder, MarketEvent, SessionCipherContext};
use crate::error::{DecodeError, PersistenceError, RoutingError};
use crate::instrument::{Effect, Holding, InstrumentEvent, InstrumentStateMachine, Side, SubmitOutcome};

use super::metrics::DispatchMetrics;

/// Effects produced by one machine for one routed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub symbol: String,
    pub effects: Vec<Effect>,
}

/// What a control message did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Heartbeat,
    KeyRotated { tr_id: String, generation: u64 },
    KeyRejected { tr_id: String, reason: String },
    Acknowledged { tr_id: String, message: Option<String> },
    ErrorReturn { tr_id: String, code: String, message: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Decode(DecodeError),
    Routing(RoutingError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// One delivery per routed record, in wire order.
    Delivered(Vec<Delivery>),
    Control(ControlOutcome),
    Dropped(DropReason),
}

/// Symbol-keyed router owning one account's machines and the session
/// cipher of its current connection.
#[derive(Debug)]
pub struct Router {
    account: String,
    decoder: FrameDecoder,
    cipher: SessionCipherContext,
    machines: HashMap<String, InstrumentStateMachine>,
    metrics: DispatchMetrics,
}

impl Router {
    pub fn new(
        account: impl Into<String>,
        machines: impl IntoIterator<Item = InstrumentStateMachine>,
    ) -> Self {
        Self {
            account: account.into(),
            decoder: FrameDecoder::new(),
            cipher: SessionCipherContext::new(),
            machines: machines
                .into_iter()
                .map(|m| (m.symbol().to_string(), m))
                .collect(),
            metrics: DispatchMetrics::new(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Tracked symbols, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.machines.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn machine(&self, symbol: &str) -> Option<&InstrumentStateMachine> {
        self.machines.get(symbol)
    }

    pub fn cipher(&self) -> &SessionCipherContext {
        &self.cipher
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// Latest `trading_window_end` across all machines.
    pub fn session_end(&self) -> Option<DateTime<FixedOffset>> {
        self.machines
            .values()
            .map(|m| m.state().trading_window_end)
            .max()
    }

    /// Forget the session key. Called whenever the connection is replaced.
    pub fn reset_session(&mut self) {
        if self.cipher.is_ready() {
            debug!(account = %self.account, "session key cleared");
        }
        self.cipher.clear();
    }

    /// Route one raw record.
    pub fn route(
        &mut self,
        raw: &str,
        now: DateTime<FixedOffset>,
    ) -> Result<RouteOutcome, PersistenceError> {
        self.metrics.record_frame();
        match self.decoder.decode(raw) {
            Ok(Frame::Market(events)) => self.route_market(&events, now),
            Ok(Frame::EncryptedFill(notice)) => self.route_fill(&notice, now),
            Ok(Frame::Control(message)) => Ok(RouteOutcome::Control(self.handle_control(message))),
            Err(err) => Ok(self.drop_decode(err)),
        }
    }

    fn route_market(
        &mut self,
        events: &[MarketEvent],
        now: DateTime<FixedOffset>,
    ) -> Result<RouteOutcome, PersistenceError> {
        let mut deliveries = Vec::with_capacity(events.len());
        let mut first_miss = None;

        for event in events {
            self.metrics.record_market_event();
            let symbol = event.symbol();
            let Some(machine) = self.machines.get_mut(symbol) else {
                self.metrics.record_routing_drop();
                debug!(account = %self.account, %symbol, "event for untracked symbol dropped");
                first_miss.get_or_insert_with(|| RoutingError::UnknownSymbol(symbol.to_string()));
                continue;
            };
            let effects = machine.handle(&InstrumentEvent::from(event), now)?;
            deliveries.push(Delivery {
                symbol: symbol.to_string(),
                effects,
            });
        }

        Ok(match first_miss {
            Some(miss) if deliveries.is_empty() => RouteOutcome::Dropped(DropReason::Routing(miss)),
            _ => RouteOutcome::Delivered(deliveries),
        })
    }

    fn route_fill(
        &mut self,
        notice: &EncryptedFillNotice,
        now: DateTime<FixedOffset>,
    ) -> Result<RouteOutcome, PersistenceError> {
        let fill = match self.decoder.decrypt_fill(notice, &self.cipher) {
            Ok(fill) => fill,
            Err(err) => return Ok(self.drop_decode(err)),
        };
        self.metrics.record_fill_notice();

        let Some(machine) = self.machines.get_mut(&fill.symbol) else {
            self.metrics.record_routing_drop();
            warn!(account = %self.account, symbol = %fill.symbol, order_no = %fill.order_number, "fill notice for untracked symbol dropped");
            return Ok(RouteOutcome::Dropped(DropReason::Routing(
                RoutingError::UnknownSymbol(fill.symbol),
            )));
        };
        let symbol = fill.symbol.clone();
        let effects = machine.handle(&InstrumentEvent::Fill(fill), now)?;
        Ok(RouteOutcome::Delivered(vec![Delivery { symbol, effects }]))
    }

    fn handle_control(&mut self, mut message: ControlMessage) -> ControlOutcome {
        self.metrics.record_control();

        if message.is_heartbeat() {
            debug!(account = %self.account, "heartbeat");
            return ControlOutcome::Heartbeat;
        }
        if message.is_key_rotation() {
            if let Some(material) = message.cipher.take() {
                return match self.cipher.rotate(material) {
                    Ok(generation) => {
                        self.metrics.record_key_rotation();
                        info!(account = %self.account, tr_id = %message.tr_id, generation, "session key rotated");
                        ControlOutcome::KeyRotated {
                            tr_id: message.tr_id,
                            generation,
                        }
                    }
                    Err(err) => {
                        warn!(account = %self.account, tr_id = %message.tr_id, error = %err, "session key rejected; cleared");
                        ControlOutcome::KeyRejected {
                            tr_id: message.tr_id,
                            reason: err.to_string(),
                        }
                    }
                };
            }
        }
        if message.is_error() {
            let code = message.return_code.unwrap_or_default();
            warn!(
                account = %self.account,
                tr_id = %message.tr_id,
                %code,
                msg = message.message.as_deref().unwrap_or(""),
                "control error return"
            );
            return ControlOutcome::ErrorReturn {
                tr_id: message.tr_id,
                code,
                message: message.message,
            };
        }

        info!(
            account = %self.account,
            tr_id = %message.tr_id,
            tr_key = message.tr_key.as_deref().unwrap_or(""),
            msg = message.message.as_deref().unwrap_or(""),
            "control ack"
        );
        ControlOutcome::Acknowledged {
            tr_id: message.tr_id,
            message: message.message,
        }
    }

    fn drop_decode(&mut self, err: DecodeError) -> RouteOutcome {
        self.metrics.record_decode_drop();
        warn!(account = %self.account, error = %err, "frame dropped");
        RouteOutcome::Dropped(DropReason::Decode(err))
    }

    /// Feed a gateway verdict back to the machine that emitted the intent.
    pub fn apply_submit_outcome(
        &mut self,
        symbol: &str,
        side: Side,
        outcome: &SubmitOutcome,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Effect>, PersistenceError> {
        self.metrics.record_submission();
        if !outcome.is_accepted() {
            self.metrics.record_rejection();
        }
        match self.machines.get_mut(symbol) {
            Some(machine) => machine.on_submit_outcome(side, outcome, now),
            None => {
                warn!(account = %self.account, %symbol, "submit outcome for untracked symbol");
                Ok(Vec::new())
            }
        }
    }

    /// Startup reconciliation of every machine, in symbol order.
    pub fn reconcile_all(
        &mut self,
        holdings: &[Holding],
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Delivery>, PersistenceError> {
        let mut deliveries = Vec::new();
        for symbol in self.symbols() {
            let holding = holdings.iter().find(|h| h.symbol == symbol);
            if let Some(machine) = self.machines.get_mut(&symbol) {
                let effects = machine.reconcile(holding, now)?;
                if !effects.is_empty() {
                    deliveries.push(Delivery { symbol, effects });
                }
            }
        }
        Ok(deliveries)
    }

    /// Post-buy holding refresh. Returns `false` for untracked symbols.
    pub fn refresh_holding(&mut self, holding: &Holding) -> Result<bool, PersistenceError> {
        match self.machines.get_mut(&holding.symbol) {
            Some(machine) => machine.refresh_holding(holding).map(|()| true),
            None => Ok(false),
        }
    }

    /// Liquidate one tracked symbol; `None` when the symbol is untracked.
    pub fn liquidate(
        &mut self,
        symbol: &str,
        now: DateTime<FixedOffset>,
    ) -> Result<Option<Vec<Effect>>, PersistenceError> {
        match self.machines.get_mut(symbol) {
            Some(machine) => machine.liquidate(now).map(Some),
            None => Ok(None),
        }
    }
}
