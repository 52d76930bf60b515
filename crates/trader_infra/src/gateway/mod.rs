//! Brokerage REST seam: order submission, balance queries, stream approval.

pub mod kis;

use async_trait::async_trait;
use thiserror::Error;
use trader_core::instrument::{Holding, OrderIntent, SubmitOutcome};

pub use kis::KisRestGateway;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("broker returned {code}: {message}")]
    Broker { code: String, message: String },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("timed out")]
    Timeout,
}

/// Balance snapshot rendered by the periodic balance refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSummary {
    pub orderable_cash: i64,
    pub holdings: Vec<Holding>,
    pub total_profit: i64,
    pub total_evaluation: i64,
}

impl AccountSummary {
    pub fn render(&self) -> String {
        let mut out = format!("[BALANCE]\n{:<18}{:>20}\n", "Cash:", group_thousands(self.orderable_cash));
        for h in self.holdings.iter().filter(|h| h.quantity > 0) {
            let rate = h.profit_rate.map_or_else(|| "-".to_string(), |r| format!("{r:.2}"));
            out.push_str(&format!(
                "+ {}({}): {} shares {}%\n",
                h.display_name, h.symbol, h.quantity, rate
            ));
        }
        out.push_str(&format!("{:<18}{:>20}\n", "Profits:", group_thousands(self.total_profit)));
        out.push_str(&format!("{:<18}{:>20}", "Total Balance:", group_thousands(self.total_evaluation)));
        out
    }
}

fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if value < 0 {
        grouped.insert(0, '-');
    }
    grouped
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Stream approval key for the WebSocket subscribe header.
    async fn handshake(&self) -> Result<String, GatewayError>;

    /// Submit one cash order. A business refusal is `Ok(Rejected)`;
    /// `Err` means the outcome is unknown.
    async fn submit_order(&self, intent: &OrderIntent) -> Result<SubmitOutcome, GatewayError>;

    /// Positions with a non-zero quantity.
    async fn holdings(&self) -> Result<Vec<Holding>, GatewayError>;

    async fn account_summary(&self) -> Result<AccountSummary, GatewayError>;
}
