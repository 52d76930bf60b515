//! One brokerage account end to end: startup reconciliation, the frame
//! loop, wall-clock gates and reconnects.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use trader_core::dispatch::Router;
use trader_core::error::PersistenceError;
use trader_core::instrument::{InstrumentSeed, InstrumentState, InstrumentStateMachine, InstrumentStore};
use trader_core::schedule::{Clock, DailyWindowGate, GateStore, IntervalGate, SystemClock};

use crate::config::{AccountConfig, ConfigError, Tunables, load_universe};
use crate::dispatcher::{CycleOutcome, DispatchError, DispatcherSettings, StreamDispatcher};
use crate::gateway::{GatewayError, KisRestGateway, OrderGateway};
use crate::notify::{LogNotifier, Notifier, NotifyError, WebhookNotifier};
use crate::store::JsonFileStore;
use crate::stream::ws::KisWsConnector;
use crate::stream::{ConnectionError, build_subscriptions, fill_tr_id};
use crate::supervisor::Backoff;

/// Key of the liquidation gate's record in the [`GateStore`].
pub const LIQUIDATION_GATE: &str = "liquidation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    /// Every tracked instrument's trading window and the day's liquidation
    /// window have closed.
    SessionEnded,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),
    #[error("stream unavailable after {attempts} attempts: {last}")]
    Connection { attempts: u32, last: ConnectionError },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("state directory {path}: {source}")]
    Storage { path: PathBuf, source: io::Error },
    #[error("notifier: {0}")]
    Notifier(#[from] NotifyError),
}

enum Wake {
    Cancelled,
    Polled(Result<CycleOutcome, DispatchError>),
}

pub struct AccountWorker {
    name: String,
    dispatcher: StreamDispatcher,
    clock: Arc<dyn Clock>,
    gates: Arc<dyn GateStore>,
    liquidation: DailyWindowGate,
    balance: IntervalGate,
    reconnect: Backoff,
    reconnect_max_attempts: u32,
    session_end: Option<DateTime<FixedOffset>>,
}

impl AccountWorker {
    pub fn new(
        name: impl Into<String>,
        dispatcher: StreamDispatcher,
        clock: Arc<dyn Clock>,
        gates: Arc<dyn GateStore>,
        tunables: &Tunables,
    ) -> Self {
        let liquidation = DailyWindowGate::new(tunables.liquidation_start, tunables.liquidation_window);
        let session_end = dispatcher.router().session_end().map(|end| {
            liquidation
                .window_end(end.date_naive())
                .and_local_timezone(*end.offset())
                .single()
                .map_or(end, |closed| end.max(closed))
        });
        Self {
            name: name.into(),
            dispatcher,
            clock,
            gates,
            liquidation,
            balance: IntervalGate::new(
                tunables.balance_refresh_interval_min,
                tunables.market_open,
                tunables.market_close,
            ),
            reconnect: Backoff::new(tunables.reconnect_initial_backoff, tunables.reconnect_max_backoff),
            reconnect_max_attempts: tunables.reconnect_max_attempts.max(1),
            session_end,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &StreamDispatcher {
        &self.dispatcher
    }

    /// Run until cancelled, until the session ends, or until a fault the
    /// worker cannot absorb.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<WorkerExit, WorkerError> {
        info!(account = %self.name, symbols = self.dispatcher.router().symbols().len(), "worker starting");

        match self.gates.last_fired(LIQUIDATION_GATE) {
            Ok(day) => self.liquidation.restore(day),
            Err(err) => return Err(self.fail(err).await),
        }

        let gateway = Arc::clone(self.dispatcher.gateway());
        let holdings = gateway.holdings().await?;
        if let Err(err) = self.dispatcher.reconcile(&holdings).await {
            return Err(self.fail(err).await);
        }

        if !self.connect_with_backoff(&cancel).await? {
            return Ok(self.stop(WorkerExit::Cancelled).await);
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(self.stop(WorkerExit::Cancelled).await);
            }

            let now = self.clock.now();
            if self.session_end.is_some_and(|end| now >= end) {
                info!(account = %self.name, "trading session over");
                self.dispatcher.notify("[SESSION] trading session ended");
                return Ok(self.stop(WorkerExit::SessionEnded).await);
            }

            if self.liquidation.poll(now) {
                info!(account = %self.name, "liquidation window open");
                // Recorded before any order goes out: a restart inside the
                // window must not sell the same positions again.
                if let Err(err) = self.gates.record_fired(LIQUIDATION_GATE, now.date_naive()) {
                    return Err(self.fail(err).await);
                }
                if let Err(err) = self.dispatcher.liquidate_positions().await {
                    return Err(self.fail(err).await);
                }
            }
            if self.balance.poll(now) {
                self.dispatcher.report_balance().await;
            }

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                polled = self.dispatcher.poll_once() => Wake::Polled(polled),
            };

            match wake {
                Wake::Cancelled => return Ok(self.stop(WorkerExit::Cancelled).await),
                Wake::Polled(Ok(_)) => {}
                Wake::Polled(Err(DispatchError::Connection(err))) => {
                    warn!(account = %self.name, error = %err, "stream lost; reconnecting");
                    if !self.connect_with_backoff(&cancel).await? {
                        return Ok(self.stop(WorkerExit::Cancelled).await);
                    }
                }
                Wake::Polled(Err(DispatchError::Persistence(err))) => {
                    return Err(self.fail(err).await);
                }
            }
        }
    }

    /// `Ok(false)` when cancelled before a connection was made.
    async fn connect_with_backoff(&mut self, cancel: &CancellationToken) -> Result<bool, WorkerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.dispatcher.connect() => Some(result),
            };
            let err = match connected {
                None => return Ok(false),
                Some(Ok(())) => return Ok(true),
                Some(Err(err)) => err,
            };

            if attempt >= self.reconnect_max_attempts {
                error!(account = %self.name, attempt, error = %err, "giving up on stream");
                self.dispatcher
                    .notify(format!("[ERROR] stream unavailable after {attempt} attempts: {err}"));
                return Err(WorkerError::Connection {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.reconnect.delay(attempt);
            warn!(account = %self.name, attempt, ?delay, error = %err, "connect failed");
            let slept = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if !slept {
                return Ok(false);
            }
        }
    }

    async fn stop(&mut self, exit: WorkerExit) -> WorkerExit {
        self.dispatcher.disconnect().await;
        info!(account = %self.name, ?exit, "worker stopped");
        exit
    }

    /// A record could not be written: stop so the restart reloads from disk.
    async fn fail(&mut self, err: PersistenceError) -> WorkerError {
        error!(account = %self.name, error = %err, "persistence failure; stopping worker");
        self.dispatcher.notify(format!("[FATAL] {err}"));
        self.dispatcher.disconnect().await;
        WorkerError::Persistence(err)
    }
}

// --- Bootstrap ----------------------------------------------------------

/// Machines for `seeds`, resumed from `store` when the saved record is from
/// the same trading day, otherwise freshly seeded and persisted.
pub fn build_router(
    account: &str,
    seeds: &[InstrumentSeed],
    store: Arc<dyn InstrumentStore>,
) -> Result<Router, PersistenceError> {
    let mut machines = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let state = match store.load(&seed.symbol)? {
            Some(saved) if saved.same_session_as(seed) => {
                info!(%account, symbol = %seed.symbol, lifecycle = %saved.lifecycle, "resumed");
                saved
            }
            stale => {
                let fresh = InstrumentState::from_seed(seed);
                store.persist(&fresh)?;
                info!(%account, symbol = %seed.symbol, replaced = stale.is_some(), "seeded");
                fresh
            }
        };
        machines.push(InstrumentStateMachine::new(state, Arc::clone(&store)));
    }
    Ok(Router::new(account, machines))
}

/// Wire the production adapters for `account` and run its worker once.
pub async fn run_account(
    account: AccountConfig,
    cancel: CancellationToken,
) -> Result<WorkerExit, WorkerError> {
    let tunables = account.tunables()?;
    let seeds = load_universe(&account.universe_path)?;
    if seeds.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{}: universe is empty",
            account.universe_path.display()
        ))
        .into());
    }

    let store = JsonFileStore::open(&account.state_dir).map_err(|source| WorkerError::Storage {
        path: account.state_dir.clone(),
        source,
    })?;
    let store = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::market());
    let router = build_router(&account.name, &seeds, store.clone())?;

    let gateway = KisRestGateway::connect(&account, tunables.http_timeout).await?;
    let approval_key = gateway.handshake().await?;
    let connector = KisWsConnector::new(
        &account.socket_url,
        approval_key,
        tunables.ws_ping_interval,
        tunables.http_timeout,
    );
    let notifier: Arc<dyn Notifier> = match &account.webhook_url {
        Some(url) if !url.is_empty() => Arc::new(WebhookNotifier::new(url, tunables.http_timeout)?),
        _ => Arc::new(LogNotifier),
    };
    let subscriptions = build_subscriptions(fill_tr_id(account.paper), &account.hts_id, &router.symbols());

    let dispatcher = StreamDispatcher::new(
        router,
        Arc::new(gateway),
        notifier,
        Arc::new(connector),
        subscriptions,
        Arc::clone(&clock),
        DispatcherSettings::from(&tunables),
    );
    let mut worker = AccountWorker::new(account.name.clone(), dispatcher, clock, store, &tunables);
    worker.run(cancel).await
}
