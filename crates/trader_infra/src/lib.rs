//! Async adapters around `trader_core`: broker REST gateway, streaming
//! connection, file store, notifier, and the per-account worker that ties
//! them together.

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod notify;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod worker;
