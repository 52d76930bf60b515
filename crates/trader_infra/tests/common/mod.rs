#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, FixedOffset};
use trader_core::instrument::{Holding, InstrumentSeed, MemoryStore, OrderIntent, SubmitOutcome};
use trader_core::schedule::{Clock, ManualClock};
use trader_infra::config::Tunables;
use trader_infra::dispatcher::{DispatcherSettings, StreamDispatcher};
use trader_infra::gateway::{AccountSummary, GatewayError, OrderGateway};
use trader_infra::notify::{Notifier, NotifyError};
use trader_infra::stream::{
    ConnectionError, FramePoll, StreamConnection, StreamConnector, Subscription,
    build_subscriptions,
};
use trader_infra::worker::build_router;

pub const KEY: &str = "0123456789abcdef0123456789abcdef";
pub const IV: &str = "fedcba9876543210";

// ─── Time ────────────────────────────────────────────────────────────────

/// Session-day timestamp at `hh:mm:ss` (+09:00).
pub fn at(hms: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(&format!("2024-03-04T{hms}+09:00")).unwrap()
}

pub fn temp_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "trader_{tag}_{}_{}",
        std::process::id(),
        nanos
    ))
}

/// Let spawned notification tasks run.
pub async fn flush() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

// ─── Domain fixtures ─────────────────────────────────────────────────────

pub fn seed(symbol: &str, buy_trigger: u64, budget: u64, sell_trigger: u64) -> InstrumentSeed {
    InstrumentSeed {
        symbol: symbol.to_string(),
        display_name: format!("name-{symbol}"),
        buy_budget: budget,
        buy_trigger_price: buy_trigger,
        buy_quantity_original: 0,
        sell_trigger_price: sell_trigger,
        sell_target_ratio: None,
        trading_window_start: at("09:00:00"),
        trading_window_end: at("15:20:00"),
    }
}

pub fn holding(symbol: &str, quantity: u64, bought_today: u64) -> Holding {
    Holding {
        symbol: symbol.to_string(),
        display_name: format!("name-{symbol}"),
        quantity,
        average_price: Some(950.0),
        current_price: Some(1000),
        bought_today,
        profit_rate: Some(5.26),
    }
}

// ─── Frames ──────────────────────────────────────────────────────────────

pub fn encrypt(plaintext: &str) -> String {
    let ciphertext = cbc::Encryptor::<aes::Aes256>::new_from_slices(KEY.as_bytes(), IV.as_bytes())
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    STANDARD.encode(ciphertext)
}

/// Encrypted buy confirmation for `qty` of a 105-share order at 950.
pub fn buy_confirm_frame(symbol: &str, qty: u64) -> String {
    let qty = qty.to_string();
    let plaintext = [
        "HTSID", "5012345601", "0000000001", "", "02", "0", "01", "0", symbol, qty.as_str(),
        "950", "100001", "0", "0", "2", "Y", "105",
    ]
    .join("^");
    format!("1|H0STCNI0|001|{}", encrypt(&plaintext))
}

pub fn key_rotation_frame() -> String {
    format!(
        r#"{{"header":{{"tr_id":"H0STCNI0","tr_key":"HTSID","encrypt":"N"}},"body":{{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS","output":{{"iv":"{IV}","key":"{KEY}"}}}}}}"#
    )
}

pub fn trade_frame(symbol: &str, price: u64) -> String {
    let price = price.to_string();
    let record = [symbol, "093001", price.as_str(), "2", "-50", "-0.5", "990", "1000", "1010", "980"]
        .join("^");
    format!("0|H0STCNT0|001|{record}")
}

// ─── Fake stream ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Step {
    Frame(String),
    KeepAlive,
    Fail(ConnectionError),
}

/// Hands out one scripted connection per `connect`; fails once the
/// scripts run out.
#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    connects: AtomicU64,
    subscribed: Mutex<Vec<Vec<Subscription>>>,
}

impl FakeConnector {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn subscribed(&self) -> Vec<Vec<Subscription>> {
        self.subscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn connect(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<Box<dyn StreamConnection>, ConnectionError> {
        let Some(steps) = self.scripts.lock().unwrap().pop_front() else {
            return Err(ConnectionError::Connect("connection refused".into()));
        };
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.subscribed.lock().unwrap().push(subscriptions.to_vec());
        Ok(Box::new(FakeConnection {
            steps: steps.into(),
        }))
    }
}

struct FakeConnection {
    steps: VecDeque<Step>,
}

#[async_trait]
impl StreamConnection for FakeConnection {
    async fn next_frame(&mut self, wait: Duration) -> Result<FramePoll, ConnectionError> {
        match self.steps.pop_front() {
            Some(Step::Frame(raw)) => Ok(FramePoll::Frame(raw)),
            Some(Step::KeepAlive) => Ok(FramePoll::KeepAlive),
            Some(Step::Fail(err)) => Err(err),
            None => {
                tokio::time::sleep(wait).await;
                Ok(FramePoll::Idle)
            }
        }
    }

    async fn close(&mut self) {}
}

// ─── Fake gateway ────────────────────────────────────────────────────────

/// Accepts every order unless an outcome is queued.
#[derive(Default)]
pub struct FakeGateway {
    outcomes: Mutex<VecDeque<Result<SubmitOutcome, GatewayError>>>,
    delay: Mutex<Option<Duration>>,
    intents: Mutex<Vec<OrderIntent>>,
    holdings: Mutex<Vec<Holding>>,
    fail_holdings: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, outcome: Result<SubmitOutcome, GatewayError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_holdings(&self, holdings: Vec<Holding>) {
        *self.holdings.lock().unwrap() = holdings;
    }

    pub fn set_fail_holdings(&self, fail: bool) {
        self.fail_holdings.store(fail, Ordering::SeqCst);
    }

    pub fn intents(&self) -> Vec<OrderIntent> {
        self.intents.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderGateway for FakeGateway {
    async fn handshake(&self) -> Result<String, GatewayError> {
        Ok("approval".into())
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<SubmitOutcome, GatewayError> {
        self.intents.lock().unwrap().push(intent.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.outcomes.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            Ok(SubmitOutcome::Accepted {
                message: "order accepted".into(),
            })
        })
    }

    async fn holdings(&self) -> Result<Vec<Holding>, GatewayError> {
        if self.fail_holdings.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("balance unavailable".into()));
        }
        Ok(self.holdings.lock().unwrap().clone())
    }

    async fn account_summary(&self) -> Result<AccountSummary, GatewayError> {
        let holdings = self.holdings().await?;
        Ok(AccountSummary {
            orderable_cash: 1_000_000,
            holdings,
            total_profit: 0,
            total_evaluation: 1_000_000,
        })
    }
}

// ─── Recording notifier ──────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _at: DateTime<FixedOffset>, message: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────

pub struct Harness {
    pub dispatcher: StreamDispatcher,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub connector: Arc<FakeConnector>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

pub fn settings() -> DispatcherSettings {
    DispatcherSettings {
        heartbeat_timeout: Duration::from_secs(5),
        poll_slice: Duration::from_secs(1),
        order_timeout: Duration::from_millis(500),
    }
}

pub fn tunables(overrides: &[(&str, f64)]) -> Tunables {
    let map: HashMap<String, f64> = overrides
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect();
    Tunables::resolve(&map).unwrap()
}

/// Dispatcher over `seeds` at 10:00, connected to `scripts` in order.
pub fn harness(seeds: &[InstrumentSeed], scripts: Vec<Vec<Step>>) -> Harness {
    harness_with(seeds, scripts, settings())
}

pub fn harness_with(
    seeds: &[InstrumentSeed],
    scripts: Vec<Vec<Step>>,
    settings: DispatcherSettings,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let router = build_router("acct-a", seeds, store.clone()).unwrap();
    let gateway = Arc::new(FakeGateway::new());
    let connector = Arc::new(FakeConnector::new(scripts));
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = Arc::new(ManualClock::new(at("10:00:00")));
    let subscriptions = build_subscriptions("H0STCNI0", "HTSID", &router.symbols());
    let dispatcher = StreamDispatcher::new(
        router,
        gateway.clone(),
        notifier.clone(),
        connector.clone(),
        subscriptions,
        clock.clone() as Arc<dyn Clock>,
        settings,
    );
    Harness {
        dispatcher,
        store,
        gateway,
        connector,
        notifier,
        clock,
    }
}
