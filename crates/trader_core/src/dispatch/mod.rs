//! Symbol-keyed routing of decoded frames to instrument machines.

pub mod metrics;
pub mod router;

pub use metrics::DispatchMetrics;
pub use router::{ControlOutcome, Delivery, DropReason, RouteOutcome, Router};
