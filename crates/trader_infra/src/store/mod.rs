//! Durable storage: per-instrument JSON records.

pub mod json_store;

pub use json_store::JsonFileStore;
