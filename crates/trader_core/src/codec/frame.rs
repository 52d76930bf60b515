//! Stream record classification.
//!
//! Market-data records are `<flag>|<tr_id>|<count>|<body>` where `flag` is
//! `0` (plain) or `1` (encrypted) and `body` is `^`-delimited with the
//! 6-digit symbol at offset 0. Every other record is a JSON control
//! message. The first byte decides which of the two framings applies.

use serde::Deserialize;

use crate::error::DecodeError;
use crate::instrument::Price;

use super::cipher::{CipherMaterial, SessionCipherContext};
use super::fill::FillNotice;

pub const QUOTE_TR_ID: &str = "H0STASP0";
pub const TRADE_TR_ID: &str = "H0STCNT0";
pub const VI_TR_ID: &str = "H0STVI0";
pub const HEARTBEAT_TR_ID: &str = "PINGPONG";
/// Encrypted fill-notice channels (real / paper, KRX / KOSDAQ variants).
pub const FILL_NOTICE_TR_IDS: [&str; 4] = ["H0STCNI0", "H0STCNI9", "K0STCNI0", "K0STCNI9"];

const QUOTE_BEST_ASK: usize = 3;
const QUOTE_BEST_BID: usize = 13;
const TRADE_LAST_PRICE: usize = 2;
const VI_DIRECTION: usize = 1;
const VI_PRICE: usize = 2;

pub fn is_fill_notice_tr_id(tr_id: &str) -> bool {
    FILL_NOTICE_TR_IDS.contains(&tr_id)
}

// --- Typed events -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteUpdate {
    pub symbol: String,
    pub best_bid: Price,
    pub best_ask: Price,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeTick {
    pub symbol: String,
    pub last_price: Price,
}

/// Direction of a volatility interrupt's price band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolatilityEvent {
    pub symbol: String,
    pub direction: ViDirection,
    pub trigger_price: Price,
}

/// Plain market-data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    Quote(QuoteUpdate),
    Trade(TradeTick),
    Volatility(VolatilityEvent),
}

impl MarketEvent {
    /// Routing key.
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Quote(q) => &q.symbol,
            MarketEvent::Trade(t) => &t.symbol,
            MarketEvent::Volatility(v) => &v.symbol,
        }
    }
}

/// Fill notice still under session encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFillNotice {
    pub tr_id: String,
    pub ciphertext: String,
}

/// Session-level JSON message: subscription acks, errors, heartbeats and
/// the key-rotation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub tr_id: String,
    pub tr_key: Option<String>,
    pub return_code: Option<String>,
    pub message: Option<String>,
    pub cipher: Option<CipherMaterial>,
}

impl ControlMessage {
    pub fn is_heartbeat(&self) -> bool {
        self.tr_id == HEARTBEAT_TR_ID
    }

    /// A non-zero return code.
    pub fn is_error(&self) -> bool {
        self.return_code.as_deref().is_some_and(|rc| rc != "0")
    }

    /// Successful fill-channel subscription carrying fresh key/IV.
    pub fn is_key_rotation(&self) -> bool {
        is_fill_notice_tr_id(&self.tr_id)
            && self.return_code.as_deref() == Some("0")
            && self.cipher.is_some()
    }
}

/// Result of classifying one raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One or more records from a plain market-data frame, in wire order.
    Market(Vec<MarketEvent>),
    EncryptedFill(EncryptedFillNotice),
    Control(ControlMessage),
}

// --- Control envelope ---------------------------------------------------

#[derive(Debug, Deserialize)]
struct ControlEnvelope {
    header: ControlHeader,
    body: Option<ControlBody>,
}

#[derive(Debug, Deserialize)]
struct ControlHeader {
    tr_id: String,
    tr_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ControlBody {
    rt_cd: Option<String>,
    msg1: Option<String>,
    output: Option<ControlOutput>,
}

#[derive(Debug, Deserialize)]
struct ControlOutput {
    key: Option<String>,
    iv: Option<String>,
}

// --- Decoder ------------------------------------------------------------

/// Stateless classifier for stream records.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Classify one raw record.
    pub fn decode(&self, raw: &str) -> Result<Frame, DecodeError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        match raw.as_bytes().first() {
            None => Err(DecodeError::Empty),
            Some(b'0' | b'1') => self.decode_market(raw),
            Some(_) => self.decode_control(raw).map(Frame::Control),
        }
    }

    /// Decrypt and parse a fill notice with the connection's session key.
    pub fn decrypt_fill(
        &self,
        notice: &EncryptedFillNotice,
        cipher: &SessionCipherContext,
    ) -> Result<FillNotice, DecodeError> {
        let plaintext = cipher.decrypt(&notice.ciphertext)?;
        FillNotice::parse(&plaintext)
    }

    fn decode_market(&self, raw: &str) -> Result<Frame, DecodeError> {
        let mut parts = raw.splitn(4, '|');
        let flag = parts.next().unwrap_or_default();
        let (Some(tr_id), Some(count_raw), Some(body)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(DecodeError::Malformed(
                "expected <flag>|<tr_id>|<count>|<body>".to_string(),
            ));
        };

        if is_fill_notice_tr_id(tr_id) {
            if flag != "1" {
                return Err(DecodeError::Malformed(format!(
                    "fill notice {tr_id} without encryption flag"
                )));
            }
            return Ok(Frame::EncryptedFill(EncryptedFillNotice {
                tr_id: tr_id.to_string(),
                ciphertext: body.to_string(),
            }));
        }
        if flag != "0" || !matches!(tr_id, QUOTE_TR_ID | TRADE_TR_ID | VI_TR_ID) {
            return Err(DecodeError::UnknownTrId(tr_id.to_string()));
        }

        let count: usize = count_raw
            .trim()
            .parse()
            .map_err(|_| DecodeError::InvalidNumber {
                field: "count",
                value: count_raw.to_string(),
            })?;
        if count == 0 {
            return Err(DecodeError::Malformed("record count is zero".to_string()));
        }

        let fields: Vec<&str> = body.split('^').collect();
        if fields.len() % count != 0 {
            return Err(DecodeError::Malformed(format!(
                "{} fields do not split into {count} records",
                fields.len()
            )));
        }
        let width = fields.len() / count;

        let events = fields
            .chunks(width)
            .map(|record| decode_record(tr_id, record))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Frame::Market(events))
    }

    fn decode_control(&self, raw: &str) -> Result<ControlMessage, DecodeError> {
        let envelope: ControlEnvelope =
            serde_json::from_str(raw).map_err(|e| DecodeError::InvalidControl(e.to_string()))?;

        let (return_code, message, output) = match envelope.body {
            Some(body) => (body.rt_cd, body.msg1, body.output),
            None => (None, None, None),
        };
        let cipher = output.and_then(|o| match (o.key, o.iv) {
            (Some(key), Some(iv)) => Some(CipherMaterial::new(key, iv)),
            _ => None,
        });

        Ok(ControlMessage {
            tr_id: envelope.header.tr_id,
            tr_key: envelope.header.tr_key,
            return_code,
            message,
            cipher,
        })
    }
}

fn decode_record(tr_id: &str, record: &[&str]) -> Result<MarketEvent, DecodeError> {
    let symbol = required_field(record, 0, "symbol")?;
    if symbol.is_empty() {
        return Err(DecodeError::MissingField {
            field: "symbol",
            offset: 0,
        });
    }
    let symbol = symbol.to_string();

    match tr_id {
        QUOTE_TR_ID => Ok(MarketEvent::Quote(QuoteUpdate {
            symbol,
            best_ask: parse_number(record, QUOTE_BEST_ASK, "best_ask")?,
            best_bid: parse_number(record, QUOTE_BEST_BID, "best_bid")?,
        })),
        TRADE_TR_ID => Ok(MarketEvent::Trade(TradeTick {
            symbol,
            last_price: parse_number(record, TRADE_LAST_PRICE, "last_price")?,
        })),
        VI_TR_ID => {
            let direction = match required_field(record, VI_DIRECTION, "vi_direction")? {
                "1" => ViDirection::Up,
                "2" => ViDirection::Down,
                other => {
                    return Err(DecodeError::Malformed(format!(
                        "unknown vi direction {other:?}"
                    )));
                }
            };
            Ok(MarketEvent::Volatility(VolatilityEvent {
                symbol,
                direction,
                trigger_price: parse_number(record, VI_PRICE, "vi_price")?,
            }))
        }
        other => Err(DecodeError::UnknownTrId(other.to_string())),
    }
}

// --- Field helpers ------------------------------------------------------

pub(crate) fn required_field<'a>(
    fields: &[&'a str],
    offset: usize,
    field: &'static str,
) -> Result<&'a str, DecodeError> {
    fields
        .get(offset)
        .copied()
        .map(str::trim)
        .ok_or(DecodeError::MissingField { field, offset })
}

pub(crate) fn parse_number(
    fields: &[&str],
    offset: usize,
    field: &'static str,
) -> Result<u64, DecodeError> {
    let raw = required_field(fields, offset, field)?;
    raw.parse().map_err(|_| DecodeError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

pub(crate) fn parse_number_or_zero(
    fields: &[&str],
    offset: usize,
    field: &'static str,
) -> Result<u64, DecodeError> {
    if required_field(fields, offset, field)?.is_empty() {
        return Ok(0);
    }
    parse_number(fields, offset, field)
}
