//! Idempotency primitives: fill-notice fingerprints.

pub mod fingerprint;

pub use fingerprint::{compute_fill_fingerprint, format_fingerprint};
