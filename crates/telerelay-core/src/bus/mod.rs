//! Message bus layer
//!
//! `MessageBus` is the publish/subscribe seam. `MqttBus` talks to a real broker,
//! `LocalBus` keeps everything in-process.

mod local;
pub mod mqtt;
pub mod topic;
mod traits;

pub use local::LocalBus;
pub use mqtt::{MqttBus, MqttConfig};
pub use traits::{BusError, MessageBus, PayloadStream};
