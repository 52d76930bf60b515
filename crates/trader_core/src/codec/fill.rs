//! Decrypted order-fill notice.

use crate::error::DecodeError;
use crate::instrument::{Price, Quantity, Side};

use super::frame::{parse_number_or_zero, required_field};

const ORDER_NUMBER: usize = 2;
const SIDE: usize = 4;
const SYMBOL: usize = 8;
const FILLED_QUANTITY: usize = 9;
const FILLED_PRICE: usize = 10;
const FILL_TIME: usize = 11;
const REFUSED: usize = 12;
const KIND: usize = 14;
const ORDER_QUANTITY: usize = 16;

/// Accept (order booked) vs confirm (shares executed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillKind {
    Accept,
    Confirm,
}

impl FillKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FillKind::Accept => "accept",
            FillKind::Confirm => "confirm",
        }
    }
}

/// One broker notice about a submitted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillNotice {
    pub order_number: String,
    pub side: Side,
    pub symbol: String,
    pub filled_quantity: Quantity,
    pub filled_price: Price,
    pub fill_time: String,
    /// Exchange refused the order.
    pub refused: bool,
    pub kind: FillKind,
    pub order_quantity: Quantity,
}

impl FillNotice {
    /// Parse the `^`-delimited plaintext of a decrypted notice.
    ///
    /// Quantity and price columns are blank on some accept notices and
    /// read as zero.
    pub fn parse(plaintext: &str) -> Result<Self, DecodeError> {
        let fields: Vec<&str> = plaintext.trim().split('^').collect();

        let side_code = required_field(&fields, SIDE, "side")?;
        let side = Side::from_fill_code(side_code)
            .ok_or_else(|| DecodeError::Malformed(format!("unknown side code {side_code:?}")))?;

        let kind = match required_field(&fields, KIND, "kind")? {
            "1" => FillKind::Accept,
            "2" => FillKind::Confirm,
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unknown notice kind {other:?}"
                )));
            }
        };

        let symbol = required_field(&fields, SYMBOL, "symbol")?;
        if symbol.is_empty() {
            return Err(DecodeError::MissingField {
                field: "symbol",
                offset: SYMBOL,
            });
        }

        Ok(Self {
            order_number: required_field(&fields, ORDER_NUMBER, "order_number")?.to_string(),
            side,
            symbol: symbol.to_string(),
            filled_quantity: parse_number_or_zero(&fields, FILLED_QUANTITY, "filled_quantity")?,
            filled_price: parse_number_or_zero(&fields, FILLED_PRICE, "filled_price")?,
            fill_time: required_field(&fields, FILL_TIME, "fill_time")?.to_string(),
            refused: required_field(&fields, REFUSED, "refused")? == "1",
            kind,
            order_quantity: parse_number_or_zero(&fields, ORDER_QUANTITY, "order_quantity")?,
        })
    }
}
