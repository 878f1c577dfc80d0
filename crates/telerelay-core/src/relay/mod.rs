//! Bus → chat relay
//!
//! [`RelayController`] guarantees a single forwarding task and exactly-once cleanup of the
//! messages that task posted.

mod controller;
mod state;
mod worker;

pub use controller::RelayController;
pub use state::{
    RelayError, RelayState, RelayStats, RelayStatus, StartOutcome, StopOutcome, TransientRefs,
    TransientSlot,
};
