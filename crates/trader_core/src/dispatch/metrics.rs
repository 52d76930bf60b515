//! Per-account dispatch counters.

/// Observability counters for one router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    /// Raw records received.
    frames_total: u64,
    /// Market records decoded (one frame may carry several).
    market_events: u64,
    /// Fill notices decrypted.
    fill_notices: u64,
    /// Frames dropped by the decoder or the cipher.
    decode_drops: u64,
    /// Records dropped for an untracked symbol.
    routing_drops: u64,
    control_messages: u64,
    key_rotations: u64,
    /// Gateway verdicts fed back, accepted or not.
    submissions: u64,
    rejections: u64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self) {
        self.frames_total += 1;
    }

    pub fn record_market_event(&mut self) {
        self.market_events += 1;
    }

    pub fn record_fill_notice(&mut self) {
        self.fill_notices += 1;
    }

    pub fn record_decode_drop(&mut self) {
        self.decode_drops += 1;
    }

    pub fn record_routing_drop(&mut self) {
        self.routing_drops += 1;
    }

    pub fn record_control(&mut self) {
        self.control_messages += 1;
    }

    pub fn record_key_rotation(&mut self) {
        self.key_rotations += 1;
    }

    pub fn record_submission(&mut self) {
        self.submissions += 1;
    }

    pub fn record_rejection(&mut self) {
        self.rejections += 1;
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total
    }

    pub fn market_events(&self) -> u64 {
        self.market_events
    }

    pub fn fill_notices(&self) -> u64 {
        self.fill_notices
    }

    pub fn decode_drops(&self) -> u64 {
        self.decode_drops
    }

    pub fn routing_drops(&self) -> u64 {
        self.routing_drops
    }

    pub fn control_messages(&self) -> u64 {
        self.control_messages
    }

    pub fn key_rotations(&self) -> u64 {
        self.key_rotations
    }

    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    pub fn rejections(&self) -> u64 {
        self.rejections
    }
}
