//! Pure trading core: frame decoding, per-instrument lifecycle state
//! machines and the router that feeds one to the other.
//!
//! Nothing in this crate performs I/O. Async adapters (socket, REST
//! gateway, file store, notifier) live in `trader_infra`.

#![forbid(unsafe_code)]

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod idempotency;
pub mod instrument;
pub mod schedule;
