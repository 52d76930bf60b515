//! Streaming connection seam.
//!
//! The dispatcher only sees [`StreamConnector`] and [`StreamConnection`];
//! the WebSocket implementation lives in [`ws`], tests plug in fakes.

pub mod ws;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use trader_core::codec::{QUOTE_TR_ID, TRADE_TR_ID, VI_TR_ID};

pub use ws::KisWsConnector;

/// Fill-notice channel for live accounts.
pub const FILL_TR_ID_LIVE: &str = "H0STCNI0";
/// Fill-notice channel for paper accounts.
pub const FILL_TR_ID_PAPER: &str = "H0STCNI9";

pub fn fill_tr_id(paper: bool) -> &'static str {
    if paper { FILL_TR_ID_PAPER } else { FILL_TR_ID_LIVE }
}

/// One channel registration: `tr_id` keyed by `tr_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub tr_id: String,
    pub tr_key: String,
}

impl Subscription {
    pub fn new(tr_id: impl Into<String>, tr_key: impl Into<String>) -> Self {
        Self {
            tr_id: tr_id.into(),
            tr_key: tr_key.into(),
        }
    }
}

/// Fill-notice channel first (its response carries the session key), then
/// quote, trade and VI channels per symbol.
pub fn build_subscriptions(fill_tr_id: &str, hts_id: &str, symbols: &[String]) -> Vec<Subscription> {
    let mut subscriptions = Vec::with_capacity(1 + symbols.len() * 3);
    subscriptions.push(Subscription::new(fill_tr_id, hts_id));
    for symbol in symbols {
        for tr_id in [QUOTE_TR_ID, TRADE_TR_ID, VI_TR_ID] {
            subscriptions.push(Subscription::new(tr_id, symbol.as_str()));
        }
    }
    subscriptions
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("no connection")]
    NotConnected,
    #[error("no frame within {0:?}")]
    HeartbeatTimeout(Duration),
}

/// Result of one bounded wait on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePoll {
    /// A text record to route.
    Frame(String),
    /// Transport-level liveness (ping/pong) with no record.
    KeepAlive,
    /// Nothing arrived within the wait.
    Idle,
}

#[async_trait]
pub trait StreamConnection: Send {
    /// Wait at most `wait` for the next record.
    async fn next_frame(&mut self, wait: Duration) -> Result<FramePoll, ConnectionError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Open a connection and register every subscription on it.
    async fn connect(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<Box<dyn StreamConnection>, ConnectionError>;
}
