//! Error taxonomy shared by the decoder, the router and the state machines.
//!
//! Decode and routing errors are always recoverable: the offending frame is
//! dropped and the stream keeps flowing. A [`PersistenceError`] is the only
//! error that escapes the router and it is fatal to the owning worker.

use thiserror::Error;

/// A frame that could not be turned into a typed event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown tr_id {0}")]
    UnknownTrId(String),
    #[error("field `{field}` missing at offset {offset}")]
    MissingField { field: &'static str, offset: usize },
    #[error("field `{field}` is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid control message: {0}")]
    InvalidControl(String),
    #[error("no session key installed")]
    NoSessionKey,
    #[error("invalid cipher material: {0}")]
    InvalidKeyMaterial(String),
    #[error("ciphertext is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    BlockLength(usize),
    #[error("invalid padding after decryption")]
    InvalidPadding,
    #[error("decrypted payload is not valid utf-8")]
    InvalidUtf8,
}

/// A decoded event that has no destination in this account.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("symbol {0} is not tracked by this account")]
    UnknownSymbol(String),
}

/// The instrument store refused a write (or a read on startup).
///
/// The in-memory state is left untouched when this is returned, so the
/// worker can stop without memory having run ahead of disk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("persistence failed for {symbol}: {reason}")]
pub struct PersistenceError {
    pub symbol: String,
    pub reason: String,
}

impl PersistenceError {
    pub fn new(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }
}
