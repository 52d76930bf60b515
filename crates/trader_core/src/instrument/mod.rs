//! Instrument domain: order value types, the persisted record, the
//! lifecycle machine and its store contract.

pub mod machine;
pub mod order;
pub mod state;
pub mod store;

pub use machine::{Effect, InstrumentEvent, InstrumentStateMachine};
pub use order::{Holding, OrderIntent, OrderPrice, Price, Quantity, Side, SubmitOutcome, TriggerReason};
pub use state::{
    APPLIED_FILL_HISTORY, InstrumentSeed, InstrumentState, LifecycleState, PendingOrder,
};
pub use store::{InstrumentStore, MemoryStore};
