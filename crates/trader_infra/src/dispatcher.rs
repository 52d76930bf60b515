//! Async half of stream dispatch.
//!
//! Owns the account's single connection and drives the [`Router`]: one
//! record is read, routed and fully executed (including any order call)
//! before the next read. Notifications are spawned and never awaited.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};
use trader_core::dispatch::{RouteOutcome, Router};
use trader_core::error::PersistenceError;
use trader_core::instrument::{
    Effect, Holding, OrderIntent, OrderPrice, Side, SubmitOutcome, TriggerReason,
};
use trader_core::schedule::Clock;

use crate::config::Tunables;
use crate::gateway::OrderGateway;
use crate::notify::Notifier;
use crate::stream::{ConnectionError, FramePoll, StreamConnection, StreamConnector, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Longest silence tolerated before the connection is presumed dead.
    pub heartbeat_timeout: Duration,
    /// Upper bound on a single read so callers regain control regularly.
    pub poll_slice: Duration,
    pub order_timeout: Duration,
}

impl From<&Tunables> for DispatcherSettings {
    fn from(t: &Tunables) -> Self {
        Self {
            heartbeat_timeout: t.heartbeat_timeout,
            poll_slice: t.frame_poll_slice,
            order_timeout: t.order_timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// What one `poll_once` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Routed(RouteOutcome),
    KeepAlive,
    Idle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiquidationReport {
    /// Tracked instruments that submitted a sell.
    pub tracked: usize,
    /// Broker positions outside the universe sold directly.
    pub untracked: usize,
    /// Positions acquired today, left alone.
    pub skipped: usize,
}

pub struct StreamDispatcher {
    router: Router,
    gateway: Arc<dyn OrderGateway>,
    notifier: Arc<dyn Notifier>,
    connector: Arc<dyn StreamConnector>,
    connection: Option<Box<dyn StreamConnection>>,
    subscriptions: Vec<Subscription>,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
    last_activity: Instant,
    connects: u64,
}

impl StreamDispatcher {
    pub fn new(
        router: Router,
        gateway: Arc<dyn OrderGateway>,
        notifier: Arc<dyn Notifier>,
        connector: Arc<dyn StreamConnector>,
        subscriptions: Vec<Subscription>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            router,
            gateway,
            notifier,
            connector,
            connection: None,
            subscriptions,
            clock,
            settings,
            last_activity: Instant::now(),
            connects: 0,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn gateway(&self) -> &Arc<dyn OrderGateway> {
        &self.gateway
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u64 {
        self.connects
    }

    // --- Connection -----------------------------------------------------

    /// Replace the connection: close the old one, forget its session key,
    /// connect and re-subscribe every channel.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.disconnect().await;
        let connection = self.connector.connect(&self.subscriptions).await?;
        self.connection = Some(connection);
        self.last_activity = Instant::now();
        self.connects += 1;
        info!(
            account = %self.router.account(),
            channels = self.subscriptions.len(),
            connects = self.connects,
            "stream subscribed"
        );
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.router.reset_session();
    }

    /// Read and fully process at most one record.
    ///
    /// Waits no longer than the poll slice, and never past the heartbeat
    /// deadline. A missed deadline is a [`ConnectionError::HeartbeatTimeout`].
    pub async fn poll_once(&mut self) -> Result<CycleOutcome, DispatchError> {
        let heartbeat = self.settings.heartbeat_timeout;
        let elapsed = self.last_activity.elapsed();
        if elapsed >= heartbeat {
            return Err(ConnectionError::HeartbeatTimeout(heartbeat).into());
        }
        let wait = self.settings.poll_slice.min(heartbeat - elapsed);

        let Some(connection) = self.connection.as_mut() else {
            return Err(ConnectionError::NotConnected.into());
        };
        let polled = connection.next_frame(wait).await;
        let polled = match polled {
            Ok(polled) => polled,
            Err(err) => {
                self.connection = None;
                return Err(err.into());
            }
        };

        match polled {
            FramePoll::Idle => {
                if self.last_activity.elapsed() >= heartbeat {
                    warn!(account = %self.router.account(), ?heartbeat, "heartbeat missed");
                    return Err(ConnectionError::HeartbeatTimeout(heartbeat).into());
                }
                Ok(CycleOutcome::Idle)
            }
            FramePoll::KeepAlive => {
                self.last_activity = Instant::now();
                Ok(CycleOutcome::KeepAlive)
            }
            FramePoll::Frame(raw) => {
                self.last_activity = Instant::now();
                let outcome = self.router.route(&raw, self.clock.now())?;
                if let RouteOutcome::Delivered(deliveries) = &outcome {
                    for delivery in deliveries {
                        self.execute(&delivery.symbol, delivery.effects.clone())
                            .await?;
                    }
                }
                Ok(CycleOutcome::Routed(outcome))
            }
        }
    }

    // --- Effects --------------------------------------------------------

    /// Run `symbol`'s effects in order; submit outcomes may enqueue more.
    async fn execute(&mut self, symbol: &str, effects: Vec<Effect>) -> Result<(), PersistenceError> {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Notify(message) => self.notify(message),
                Effect::Submit(intent) => {
                    let outcome = self.submit(&intent).await;
                    let follow_up = self.router.apply_submit_outcome(
                        &intent.symbol,
                        intent.side,
                        &outcome,
                        self.clock.now(),
                    )?;
                    queue.extend(follow_up);
                }
                Effect::RefreshHolding => self.refresh_holding(symbol).await?,
            }
        }
        Ok(())
    }

    /// Gateway call bounded by the order timeout. Any failure is a rejection.
    async fn submit(&mut self, intent: &OrderIntent) -> SubmitOutcome {
        info!(
            account = %self.router.account(),
            symbol = %intent.symbol,
            side = intent.side.as_str(),
            quantity = intent.quantity,
            price = ?intent.price,
            reason = ?intent.reason,
            "submitting order"
        );
        match timeout(self.settings.order_timeout, self.gateway.submit_order(intent)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(account = %self.router.account(), symbol = %intent.symbol, error = %err, "gateway error; treating as rejected");
                SubmitOutcome::Rejected {
                    message: err.to_string(),
                }
            }
            Err(_) => {
                warn!(account = %self.router.account(), symbol = %intent.symbol, timeout = ?self.settings.order_timeout, "order timed out; treating as rejected");
                SubmitOutcome::Rejected {
                    message: format!("no response within {:?}", self.settings.order_timeout),
                }
            }
        }
    }

    /// Fire-and-forget operator notification.
    pub fn notify(&self, message: impl Into<String>) {
        let message = message.into();
        let notifier = Arc::clone(&self.notifier);
        let account = self.router.account().to_string();
        let at = self.clock.now();
        debug!(%account, %message, "notification queued");
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(at, &message).await {
                warn!(%account, error = %err, "notification failed");
            }
        });
    }

    // --- Account-level operations ---------------------------------------

    /// Startup reconciliation against broker holdings.
    pub async fn reconcile(&mut self, holdings: &[Holding]) -> Result<(), PersistenceError> {
        let deliveries = self.router.reconcile_all(holdings, self.clock.now())?;
        for delivery in deliveries {
            self.execute(&delivery.symbol, delivery.effects).await?;
        }
        Ok(())
    }

    /// Post-buy refresh of one symbol from the broker's balance.
    async fn refresh_holding(&mut self, symbol: &str) -> Result<(), PersistenceError> {
        let holdings = match self.gateway.holdings().await {
            Ok(holdings) => holdings,
            Err(err) => {
                warn!(account = %self.router.account(), %symbol, error = %err, "holding refresh failed");
                return Ok(());
            }
        };
        match holdings.iter().find(|h| h.symbol == symbol) {
            Some(holding) => {
                self.router.refresh_holding(holding)?;
            }
            None => debug!(account = %self.router.account(), %symbol, "holding not yet reported"),
        }
        Ok(())
    }

    /// Market-sell every broker position not acquired today.
    pub async fn liquidate_positions(&mut self) -> Result<LiquidationReport, PersistenceError> {
        let mut report = LiquidationReport::default();
        let holdings = match self.gateway.holdings().await {
            Ok(holdings) => holdings,
            Err(err) => {
                error!(account = %self.router.account(), error = %err, "liquidation skipped: holdings unavailable");
                self.notify(format!("[LIQUIDATE] holdings unavailable: {err}"));
                return Ok(report);
            }
        };

        let now = self.clock.now();
        for holding in holdings.iter().filter(|h| h.quantity > 0) {
            if self.router.machine(&holding.symbol).is_some() {
                self.router.refresh_holding(holding)?;
                match self.router.liquidate(&holding.symbol, now)? {
                    Some(effects) if !effects.is_empty() => {
                        report.tracked += 1;
                        self.execute(&holding.symbol, effects).await?;
                    }
                    _ => report.skipped += 1,
                }
            } else if holding.bought_today > 0 {
                report.skipped += 1;
            } else {
                report.untracked += 1;
                let intent = OrderIntent {
                    symbol: holding.symbol.clone(),
                    side: Side::Sell,
                    quantity: holding.quantity,
                    price: OrderPrice::Market,
                    reason: TriggerReason::Liquidation,
                };
                let outcome = self.submit(&intent).await;
                self.notify(format!(
                    "[LIQUIDATE] {}({}) market sell {} shares: {}",
                    holding.display_name,
                    holding.symbol,
                    holding.quantity,
                    if outcome.is_accepted() { "accepted" } else { outcome.message() }
                ));
            }
        }
        info!(account = %self.router.account(), ?report, "liquidation pass done");
        Ok(report)
    }

    /// Send the account summary as a notification.
    pub async fn report_balance(&mut self) {
        match self.gateway.account_summary().await {
            Ok(summary) => self.notify(summary.render()),
            Err(err) => warn!(account = %self.router.account(), error = %err, "balance refresh failed"),
        }
    }
}
