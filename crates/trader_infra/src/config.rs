//! Account configuration and runtime tunables.
//!
//! Every tunable has a default. An account file may override any of them
//! by name in its `tunables` map; unknown names and non-finite or negative
//! values are configuration errors, never silently ignored.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, TimeDelta};
use serde::Deserialize;
use thiserror::Error;
use trader_core::instrument::{InstrumentSeed, Price, Quantity};
use trader_core::schedule::time_of_day;

/// Runtime tunables an account file may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigParam {
    // Stream
    HeartbeatTimeoutS,
    FramePollSliceMs,
    WsPingIntervalS,
    ReconnectInitialBackoffMs,
    ReconnectMaxBackoffMs,
    ReconnectMaxAttempts,

    // Gateway
    OrderTimeoutMs,
    HttpTimeoutS,

    // Schedule
    BalanceRefreshIntervalMin,
    MarketOpenSecondOfDay,
    MarketCloseSecondOfDay,
    LiquidationSecondOfDay,
    LiquidationWindowS,

    // Supervisor
    RestartInitialBackoffS,
    RestartMaxBackoffS,
    RestartMaxCount,
}

/// Error when a tunable override is unusable.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("tunable '{param_name}' rejected: {reason}")]
pub struct InvalidTunableError {
    pub param_name: &'static str,
    pub reason: &'static str,
}

/// Default value of a tunable.
pub fn default_value(param: ConfigParam) -> f64 {
    match param {
        ConfigParam::HeartbeatTimeoutS => 60.0,
        ConfigParam::FramePollSliceMs => 1000.0,
        ConfigParam::WsPingIntervalS => 30.0,
        ConfigParam::ReconnectInitialBackoffMs => 1000.0,
        ConfigParam::ReconnectMaxBackoffMs => 30_000.0,
        ConfigParam::ReconnectMaxAttempts => 20.0,

        ConfigParam::OrderTimeoutMs => 5000.0,
        ConfigParam::HttpTimeoutS => 10.0,

        ConfigParam::BalanceRefreshIntervalMin => 10.0,
        // 09:00, 15:40 and 15:21 exchange time
        ConfigParam::MarketOpenSecondOfDay => 32_400.0,
        ConfigParam::MarketCloseSecondOfDay => 56_400.0,
        ConfigParam::LiquidationSecondOfDay => 55_260.0,
        ConfigParam::LiquidationWindowS => 60.0,

        ConfigParam::RestartInitialBackoffS => 5.0,
        ConfigParam::RestartMaxBackoffS => 300.0,
        ConfigParam::RestartMaxCount => 10.0,
    }
}

/// snake_case name used in account files.
pub fn param_name(param: ConfigParam) -> &'static str {
    match param {
        ConfigParam::HeartbeatTimeoutS => "heartbeat_timeout_s",
        ConfigParam::FramePollSliceMs => "frame_poll_slice_ms",
        ConfigParam::WsPingIntervalS => "ws_ping_interval_s",
        ConfigParam::ReconnectInitialBackoffMs => "reconnect_initial_backoff_ms",
        ConfigParam::ReconnectMaxBackoffMs => "reconnect_max_backoff_ms",
        ConfigParam::ReconnectMaxAttempts => "reconnect_max_attempts",
        ConfigParam::OrderTimeoutMs => "order_timeout_ms",
        ConfigParam::HttpTimeoutS => "http_timeout_s",
        ConfigParam::BalanceRefreshIntervalMin => "balance_refresh_interval_min",
        ConfigParam::MarketOpenSecondOfDay => "market_open_second_of_day",
        ConfigParam::MarketCloseSecondOfDay => "market_close_second_of_day",
        ConfigParam::LiquidationSecondOfDay => "liquidation_second_of_day",
        ConfigParam::LiquidationWindowS => "liquidation_window_s",
        ConfigParam::RestartInitialBackoffS => "restart_initial_backoff_s",
        ConfigParam::RestartMaxBackoffS => "restart_max_backoff_s",
        ConfigParam::RestartMaxCount => "restart_max_count",
    }
}

pub fn param_from_name(name: &str) -> Option<ConfigParam> {
    ALL_PARAMS.iter().copied().find(|&p| param_name(p) == name)
}

/// Expected number of ConfigParam variants. Update when adding new variants.
pub const EXPECTED_PARAM_COUNT: usize = 16;

/// All known `ConfigParam` variants.
pub const ALL_PARAMS: &[ConfigParam] = &[
    ConfigParam::HeartbeatTimeoutS,
    ConfigParam::FramePollSliceMs,
    ConfigParam::WsPingIntervalS,
    ConfigParam::ReconnectInitialBackoffMs,
    ConfigParam::ReconnectMaxBackoffMs,
    ConfigParam::ReconnectMaxAttempts,
    ConfigParam::OrderTimeoutMs,
    ConfigParam::HttpTimeoutS,
    ConfigParam::BalanceRefreshIntervalMin,
    ConfigParam::MarketOpenSecondOfDay,
    ConfigParam::MarketCloseSecondOfDay,
    ConfigParam::LiquidationSecondOfDay,
    ConfigParam::LiquidationWindowS,
    ConfigParam::RestartInitialBackoffS,
    ConfigParam::RestartMaxBackoffS,
    ConfigParam::RestartMaxCount,
];

/// Resolve a tunable.
///
/// - `Some(v)` wins when it is finite and non-negative.
/// - `None` falls back to [`default_value`].
pub fn resolve_config_value(
    param: ConfigParam,
    value: Option<f64>,
) -> Result<f64, InvalidTunableError> {
    let Some(v) = value else {
        return Ok(default_value(param));
    };
    if !v.is_finite() {
        return Err(InvalidTunableError {
            param_name: param_name(param),
            reason: "value is non-finite (NaN or Infinity)",
        });
    }
    if v < 0.0 {
        return Err(InvalidTunableError {
            param_name: param_name(param),
            reason: "value is negative",
        });
    }
    Ok(v)
}

// --- Resolved tunables --------------------------------------------------

/// Tunables resolved into the units the runtime works in.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub heartbeat_timeout: Duration,
    pub frame_poll_slice: Duration,
    pub ws_ping_interval: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub reconnect_max_attempts: u32,
    pub order_timeout: Duration,
    pub http_timeout: Duration,
    pub balance_refresh_interval_min: u32,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub liquidation_start: NaiveTime,
    pub liquidation_window: TimeDelta,
    pub restart_initial_backoff: Duration,
    pub restart_max_backoff: Duration,
    pub restart_max_count: u32,
}

impl Tunables {
    /// Apply `overrides` (keyed by [`param_name`]) on top of the defaults.
    pub fn resolve(overrides: &HashMap<String, f64>) -> Result<Self, ConfigError> {
        if let Some(unknown) = overrides.keys().find(|k| param_from_name(k).is_none()) {
            return Err(ConfigError::UnknownTunable(unknown.clone()));
        }
        let get = |param: ConfigParam| -> Result<f64, ConfigError> {
            Ok(resolve_config_value(
                param,
                overrides.get(param_name(param)).copied(),
            )?)
        };
        let secs = |param: ConfigParam| get(param).and_then(|v| duration(param, v));
        let millis = |param: ConfigParam| get(param).and_then(|v| duration(param, v / 1000.0));
        let count = |param: ConfigParam| get(param).map(|v| v as u32);
        let clock = |param: ConfigParam| -> Result<NaiveTime, ConfigError> {
            let v = get(param)?;
            time_of_day(v as u32).ok_or_else(|| {
                ConfigError::Invalid(format!("{} is past the end of the day", param_name(param)))
            })
        };

        let tunables = Self {
            heartbeat_timeout: secs(ConfigParam::HeartbeatTimeoutS)?,
            frame_poll_slice: millis(ConfigParam::FramePollSliceMs)?,
            ws_ping_interval: secs(ConfigParam::WsPingIntervalS)?,
            reconnect_initial_backoff: millis(ConfigParam::ReconnectInitialBackoffMs)?,
            reconnect_max_backoff: millis(ConfigParam::ReconnectMaxBackoffMs)?,
            reconnect_max_attempts: count(ConfigParam::ReconnectMaxAttempts)?,
            order_timeout: millis(ConfigParam::OrderTimeoutMs)?,
            http_timeout: secs(ConfigParam::HttpTimeoutS)?,
            balance_refresh_interval_min: count(ConfigParam::BalanceRefreshIntervalMin)?,
            market_open: clock(ConfigParam::MarketOpenSecondOfDay)?,
            market_close: clock(ConfigParam::MarketCloseSecondOfDay)?,
            liquidation_start: clock(ConfigParam::LiquidationSecondOfDay)?,
            liquidation_window: TimeDelta::seconds(get(ConfigParam::LiquidationWindowS)? as i64),
            restart_initial_backoff: secs(ConfigParam::RestartInitialBackoffS)?,
            restart_max_backoff: secs(ConfigParam::RestartMaxBackoffS)?,
            restart_max_count: count(ConfigParam::RestartMaxCount)?,
        };

        if tunables.heartbeat_timeout.is_zero() || tunables.frame_poll_slice.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat timeout and frame poll slice must be positive".into(),
            ));
        }
        if tunables.market_open >= tunables.market_close {
            return Err(ConfigError::Invalid(
                "market open must be before market close".into(),
            ));
        }
        Ok(tunables)
    }
}

fn duration(param: ConfigParam, seconds: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| ConfigError::Invalid(format!("{} is out of range", param_name(param))))
}

// --- Errors -------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("unknown tunable '{0}'")]
    UnknownTunable(String),
    #[error(transparent)]
    InvalidTunable(#[from] InvalidTunableError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no account files in {0}")]
    NoAccounts(PathBuf),
}

// --- Account files ------------------------------------------------------

/// One brokerage account, read from `<config_dir>/<name>.json`.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub url_base: String,
    pub socket_url: String,
    pub app_key: String,
    pub app_secret: String,
    /// Fetched at startup when absent.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Fetched by the handshake when absent.
    #[serde(default)]
    pub approval_key: Option<String>,
    pub account_number: String,
    pub account_product_code: String,
    pub hts_id: String,
    #[serde(default)]
    pub paper: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub universe_path: PathBuf,
    pub state_dir: PathBuf,
    #[serde(default)]
    pub tunables: HashMap<String, f64>,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("name", &self.name)
            .field("url_base", &self.url_base)
            .field("socket_url", &self.socket_url)
            .field("account_number", &self.account_number)
            .field("paper", &self.paper)
            .field("universe_path", &self.universe_path)
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

impl AccountConfig {
    pub fn tunables(&self) -> Result<Tunables, ConfigError> {
        Tunables::resolve(&self.tunables)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("name", &self.name),
            ("url_base", &self.url_base),
            ("socket_url", &self.socket_url),
            ("app_key", &self.app_key),
            ("app_secret", &self.app_secret),
            ("account_number", &self.account_number),
            ("hts_id", &self.hts_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account '{}': {field} is empty",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

pub fn load_account(path: &Path) -> Result<AccountConfig, ConfigError> {
    let account: AccountConfig = read_json(path)?;
    account.validate()?;
    Ok(account)
}

/// Every `*.json` account file in `dir`, sorted by file name.
pub fn load_accounts(dir: &Path) -> Result<Vec<AccountConfig>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    if paths.is_empty() {
        return Err(ConfigError::NoAccounts(dir.to_path_buf()));
    }

    let accounts = paths
        .iter()
        .map(|p| load_account(p))
        .collect::<Result<Vec<_>, _>>()?;

    let mut state_dirs = std::collections::HashSet::new();
    for account in &accounts {
        if !state_dirs.insert(account.state_dir.clone()) {
            return Err(ConfigError::Invalid(format!(
                "account '{}' shares state_dir {} with another account",
                account.name,
                account.state_dir.display()
            )));
        }
    }
    Ok(accounts)
}

// --- Universe file ------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UniverseEntry {
    name: String,
    #[serde(default)]
    buy_budget: u64,
    buy_trigger_price: Price,
    #[serde(default)]
    buy_quantity: Quantity,
    #[serde(default)]
    sell_trigger_price: Price,
    #[serde(default)]
    sell_target_ratio: Option<f64>,
    trading_window_start: DateTime<FixedOffset>,
    trading_window_end: DateTime<FixedOffset>,
}

/// Seeds from a universe file: a JSON object keyed by symbol.
pub fn load_universe(path: &Path) -> Result<Vec<InstrumentSeed>, ConfigError> {
    let entries: BTreeMap<String, UniverseEntry> = read_json(path)?;
    entries
        .into_iter()
        .map(|(symbol, entry)| {
            if entry.trading_window_end <= entry.trading_window_start {
                return Err(ConfigError::Invalid(format!(
                    "{symbol}: trading window ends before it starts"
                )));
            }
            if entry.sell_target_ratio.is_some_and(|r| !r.is_finite() || r <= -1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{symbol}: sell_target_ratio out of range"
                )));
            }
            if entry.sell_trigger_price == 0 && entry.sell_target_ratio.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{symbol}: needs sell_trigger_price or sell_target_ratio"
                )));
            }
            Ok(InstrumentSeed {
                symbol,
                display_name: entry.name,
                buy_budget: entry.buy_budget,
                buy_trigger_price: entry.buy_trigger_price,
                buy_quantity_original: entry.buy_quantity,
                sell_trigger_price: entry.sell_trigger_price,
                sell_target_ratio: entry.sell_target_ratio,
                trading_window_start: entry.trading_window_start,
                trading_window_end: entry.trading_window_end,
            })
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_params_have_names() {
        for &param in ALL_PARAMS {
            assert!(!param_name(param).is_empty(), "ConfigParam::{param:?} has empty name");
            assert_eq!(param_from_name(param_name(param)), Some(param));
        }
    }

    #[test]
    fn all_params_listed_in_constant() {
        assert_eq!(
            ALL_PARAMS.len(),
            EXPECTED_PARAM_COUNT,
            "ALL_PARAMS length ({}) != EXPECTED_PARAM_COUNT ({}). \
             Did you add a ConfigParam variant without updating ALL_PARAMS?",
            ALL_PARAMS.len(),
            EXPECTED_PARAM_COUNT,
        );
        let mut names: Vec<&str> = ALL_PARAMS.iter().map(|&p| param_name(p)).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ALL_PARAMS.len(), "ALL_PARAMS has duplicate entries");
    }

    #[test]
    fn defaults_resolve() {
        let t = Tunables::resolve(&HashMap::new()).unwrap();
        assert_eq!(t.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(t.frame_poll_slice, Duration::from_secs(1));
        assert_eq!(t.liquidation_start, NaiveTime::from_hms_opt(15, 21, 0).unwrap());
    }
}
