//! Fill-notice fingerprint.
//!
//! `fingerprint = xxhash64(order_number + side + kind + fill_time + qty + price)`
//!
//! Two notices with the same fingerprint describe the same execution; the
//! second is a replay and must not move `held_quantity` again.

use xxhash_rust::xxh64::xxh64;

use crate::codec::FillNotice;

/// Compute the fingerprint of a decrypted fill notice.
pub fn compute_fill_fingerprint(notice: &FillNotice) -> u64 {
    // 0xFF never appears in UTF-8, so field boundaries stay unambiguous.
    let mut buf = Vec::with_capacity(96);

    buf.extend_from_slice(notice.order_number.as_bytes());
    buf.push(0xFF);
    buf.extend_from_slice(notice.side.as_str().as_bytes());
    buf.push(0xFF);
    buf.extend_from_slice(notice.kind.as_str().as_bytes());
    buf.push(0xFF);
    buf.extend_from_slice(notice.fill_time.as_bytes());
    buf.push(0xFF);
    buf.extend_from_slice(&notice.filled_quantity.to_le_bytes());
    buf.push(0xFF);
    buf.extend_from_slice(&notice.filled_price.to_le_bytes());

    xxh64(&buf, 0)
}

/// Format a fingerprint as fixed-width hex, the form stored in records.
pub fn format_fingerprint(fingerprint: u64) -> String {
    format!("{fingerprint:016x}")
}
