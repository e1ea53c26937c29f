// qbus_common
//
// Shared building blocks for the QBus message bus: the tagged payload value
// tree, the bus error kinds and a thin logging facade. Everything here is
// independent of the routing engine and usable from adapters and front-ends.

pub mod errors;
pub mod logging;
pub mod types;

pub use errors::QbusError;
pub use logging::{Component, Logger};
pub use types::Value;
