//! REST adapter for the brokerage's domestic-stock API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use trader_core::instrument::{Holding, OrderIntent, OrderPrice, Side, SubmitOutcome};

use super::{AccountSummary, GatewayError, OrderGateway};
use crate::config::AccountConfig;

const TOKEN_PATH: &str = "oauth2/tokenP";
const APPROVAL_PATH: &str = "oauth2/Approval";
const HASHKEY_PATH: &str = "uapi/hashkey";
const ORDER_PATH: &str = "uapi/domestic-stock/v1/trading/order-cash";
const BALANCE_PATH: &str = "uapi/domestic-stock/v1/trading/inquire-balance";
const ORDERABLE_PATH: &str = "uapi/domestic-stock/v1/trading/inquire-psbl-order";

/// Transaction ids: (live, paper).
const TR_BUY: (&str, &str) = ("TTTC0802U", "VTTC0802U");
const TR_SELL: (&str, &str) = ("TTTC0801U", "VTTC0801U");
const TR_BALANCE: (&str, &str) = ("TTTC8434R", "VTTC8434R");
const TR_ORDERABLE: (&str, &str) = ("TTTC8908R", "VTTC8908R");

/// Order division codes.
const ORD_DVSN_LIMIT: &str = "00";
const ORD_DVSN_MARKET: &str = "01";

pub struct KisRestGateway {
    client: Client,
    url_base: String,
    app_key: String,
    app_secret: String,
    access_token: String,
    approval_key: Option<String>,
    account_number: String,
    product_code: String,
    paper: bool,
}

impl std::fmt::Debug for KisRestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisRestGateway")
            .field("url_base", &self.url_base)
            .field("account_number", &self.account_number)
            .field("paper", &self.paper)
            .finish_non_exhaustive()
    }
}

// --- Wire types ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    approval_key: String,
}

#[derive(Debug, Deserialize)]
struct HashResponse {
    #[serde(rename = "HASH")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    rt_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default, alias = "output")]
    output1: Vec<BalanceRow>,
    #[serde(default)]
    output2: Vec<EvaluationRow>,
}

#[derive(Debug, Deserialize)]
struct BalanceRow {
    pdno: String,
    #[serde(default)]
    prdt_name: String,
    #[serde(default)]
    hldg_qty: String,
    #[serde(default)]
    pchs_avg_pric: String,
    #[serde(default)]
    prpr: String,
    #[serde(default)]
    evlu_pfls_rt: String,
    #[serde(default)]
    thdt_buyqty: String,
}

#[derive(Debug, Deserialize)]
struct EvaluationRow {
    #[serde(default)]
    tot_evlu_amt: String,
    #[serde(default)]
    evlu_pfls_smtl_amt: String,
}

#[derive(Debug, Deserialize)]
struct OrderableResponse {
    rt_cd: String,
    #[serde(default)]
    msg1: String,
    output: OrderableRow,
}

#[derive(Debug, Deserialize)]
struct OrderableRow {
    ord_psbl_cash: String,
}

// --- Construction -------------------------------------------------------

impl KisRestGateway {
    /// Build the client and obtain an access token unless the account
    /// file already carries one.
    pub async fn connect(account: &AccountConfig, http_timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let url_base = account.url_base.trim_end_matches('/').to_string();

        let access_token = match &account.access_token {
            Some(token) if !token.is_empty() => token.clone(),
            _ => {
                let response = client
                    .post(format!("{url_base}/{TOKEN_PATH}"))
                    .json(&json!({
                        "grant_type": "client_credentials",
                        "appkey": account.app_key,
                        "appsecret": account.app_secret,
                    }))
                    .send()
                    .await
                    .map_err(transport)?;
                let token: TokenResponse = read_json(response)
                    .await
                    .map_err(|e| GatewayError::Authentication(e.to_string()))?;
                info!(account = %account.name, "access token issued");
                token.access_token
            }
        };

        Ok(Self {
            client,
            url_base,
            app_key: account.app_key.clone(),
            app_secret: account.app_secret.clone(),
            access_token,
            approval_key: account.approval_key.clone().filter(|k| !k.is_empty()),
            account_number: account.account_number.clone(),
            product_code: account.account_product_code.clone(),
            paper: account.paper,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.url_base)
    }

    fn tr_id(&self, ids: (&'static str, &'static str)) -> &'static str {
        if self.paper { ids.1 } else { ids.0 }
    }

    fn authed(&self, request: RequestBuilder, tr_id: &str) -> RequestBuilder {
        request
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.access_token))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", "P")
    }

    async fn hashkey(&self, body: &serde_json::Value) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(self.url(HASHKEY_PATH))
            .header("content-type", "application/json")
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        let hash: HashResponse = read_json(response).await?;
        Ok(hash.hash)
    }

    async fn balance(&self) -> Result<BalanceResponse, GatewayError> {
        let request = self.client.get(self.url(BALANCE_PATH)).query(&[
            ("CANO", self.account_number.as_str()),
            ("ACNT_PRDT_CD", self.product_code.as_str()),
            ("AFHR_FLPR_YN", "N"),
            ("OFL_YN", ""),
            ("INQR_DVSN", "02"),
            ("UNPR_DVSN", "01"),
            ("FUND_STTL_ICLD_YN", "N"),
            ("FNCG_AMT_AUTO_RDPT_YN", "N"),
            ("PRCS_DVSN", "01"),
            ("CTX_AREA_FK100", ""),
            ("CTX_AREA_NK100", ""),
        ]);
        let response = self
            .authed(request, self.tr_id(TR_BALANCE))
            .send()
            .await
            .map_err(transport)?;
        let balance: BalanceResponse = read_json(response).await?;
        if balance.rt_cd != "0" {
            return Err(GatewayError::Broker {
                code: balance.rt_cd,
                message: balance.msg1,
            });
        }
        Ok(balance)
    }

    async fn orderable_cash(&self) -> Result<i64, GatewayError> {
        // Blank symbol and price: cash amount only.
        let request = self.client.get(self.url(ORDERABLE_PATH)).query(&[
            ("CANO", self.account_number.as_str()),
            ("ACNT_PRDT_CD", self.product_code.as_str()),
            ("PDNO", ""),
            ("ORD_UNPR", ""),
            ("ORD_DVSN", ORD_DVSN_MARKET),
            ("CMA_EVLU_AMT_ICLD_YN", "Y"),
            ("OVRS_ICLD_YN", "Y"),
        ]);
        let response = self
            .authed(request, self.tr_id(TR_ORDERABLE))
            .send()
            .await
            .map_err(transport)?;
        let orderable: OrderableResponse = read_json(response).await?;
        if orderable.rt_cd != "0" {
            return Err(GatewayError::Broker {
                code: orderable.rt_cd,
                message: orderable.msg1,
            });
        }
        parse_signed("ord_psbl_cash", &orderable.output.ord_psbl_cash)
    }
}

// --- OrderGateway -------------------------------------------------------

#[async_trait]
impl OrderGateway for KisRestGateway {
    async fn handshake(&self) -> Result<String, GatewayError> {
        if let Some(key) = &self.approval_key {
            return Ok(key.clone());
        }
        let response = self
            .client
            .post(self.url(APPROVAL_PATH))
            .json(&json!({
                "grant_type": "client_credentials",
                "appkey": self.app_key,
                "secretkey": self.app_secret,
            }))
            .send()
            .await
            .map_err(transport)?;
        let approval: ApprovalResponse = read_json(response)
            .await
            .map_err(|e| GatewayError::Authentication(e.to_string()))?;
        Ok(approval.approval_key)
    }

    async fn submit_order(&self, intent: &OrderIntent) -> Result<SubmitOutcome, GatewayError> {
        let body = order_body(&self.account_number, &self.product_code, intent);
        let hash = self.hashkey(&body).await?;
        let tr_id = match intent.side {
            Side::Buy => self.tr_id(TR_BUY),
            Side::Sell => self.tr_id(TR_SELL),
        };

        let response = self
            .authed(self.client.post(self.url(ORDER_PATH)), tr_id)
            .header("hashkey", hash)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        // Business refusals may arrive with a non-2xx status; the body decides.
        let status = response.status();
        let text = response.text().await.map_err(transport)?;
        let order: OrderResponse = match serde_json::from_str(&text) {
            Ok(order) => order,
            Err(_) if !status.is_success() => {
                return Err(GatewayError::Http {
                    status: status.as_u16(),
                    body: text,
                });
            }
            Err(e) => return Err(GatewayError::Decode(e.to_string())),
        };

        debug!(symbol = %intent.symbol, side = intent.side.as_str(), rt_cd = %order.rt_cd, msg_cd = %order.msg_cd, "order response");
        if order.rt_cd == "0" {
            Ok(SubmitOutcome::Accepted { message: order.msg1 })
        } else {
            warn!(symbol = %intent.symbol, side = intent.side.as_str(), msg_cd = %order.msg_cd, msg = %order.msg1, "order refused");
            Ok(SubmitOutcome::Rejected {
                message: format!("{} {}", order.msg_cd, order.msg1).trim().to_string(),
            })
        }
    }

    async fn holdings(&self) -> Result<Vec<Holding>, GatewayError> {
        let balance = self.balance().await?;
        to_holdings(&balance.output1)
    }

    async fn account_summary(&self) -> Result<AccountSummary, GatewayError> {
        let orderable_cash = self.orderable_cash().await?;
        let balance = self.balance().await?;
        let holdings = to_holdings(&balance.output1)?;
        let (total_profit, total_evaluation) = match balance.output2.first() {
            Some(row) => (
                parse_signed("evlu_pfls_smtl_amt", &row.evlu_pfls_smtl_amt)?,
                parse_signed("tot_evlu_amt", &row.tot_evlu_amt)?,
            ),
            None => (0, 0),
        };
        Ok(AccountSummary {
            orderable_cash,
            holdings,
            total_profit,
            total_evaluation,
        })
    }
}

// --- Helpers ------------------------------------------------------------

fn transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(err.to_string())
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::Http {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))
}

fn to_holdings(rows: &[BalanceRow]) -> Result<Vec<Holding>, GatewayError> {
    let mut holdings = Vec::new();
    for row in rows {
        let quantity = parse_unsigned("hldg_qty", &row.hldg_qty)?;
        if quantity == 0 {
            continue;
        }
        holdings.push(Holding {
            symbol: row.pdno.clone(),
            display_name: row.prdt_name.clone(),
            quantity,
            average_price: parse_decimal("pchs_avg_pric", &row.pchs_avg_pric)?.filter(|p| *p > 0.0),
            current_price: Some(parse_unsigned("prpr", &row.prpr)?).filter(|p| *p > 0),
            bought_today: parse_unsigned("thdt_buyqty", &row.thdt_buyqty)?,
            profit_rate: parse_decimal("evlu_pfls_rt", &row.evlu_pfls_rt)?,
        });
    }
    Ok(holdings)
}

/// Cash order body. Market orders carry a zero unit price.
fn order_body(account_number: &str, product_code: &str, intent: &OrderIntent) -> Value {
    let (division, unit_price) = match intent.price {
        OrderPrice::Market => (ORD_DVSN_MARKET, 0),
        OrderPrice::Limit(price) => (ORD_DVSN_LIMIT, price),
    };
    json!({
        "CANO": account_number,
        "ACNT_PRDT_CD": product_code,
        "PDNO": intent.symbol,
        "ORD_DVSN": division,
        "ORD_QTY": intent.quantity.to_string(),
        "ORD_UNPR": unit_price.to_string(),
    })
}

/// Blank numeric columns read as zero.
fn parse_unsigned(field: &str, raw: &str) -> Result<u64, GatewayError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse()
        .map_err(|_| GatewayError::Decode(format!("{field}: '{raw}' is not a quantity")))
}

fn parse_signed(field: &str, raw: &str) -> Result<i64, GatewayError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse()
        .map_err(|_| GatewayError::Decode(format!("{field}: '{raw}' is not an amount")))
}

fn parse_decimal(field: &str, raw: &str) -> Result<Option<f64>, GatewayError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| GatewayError::Decode(format!("{field}: '{raw}' is not a number")))
}
