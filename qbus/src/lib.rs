// qbus
//
// A peer-to-peer RPC message bus. Every participant (a *module*) exposes
// methods callable by name and issues requests to methods on other modules.
// Requests are routed across a dynamically discovered overlay of TCP or
// local-socket links; responses travel back along the path they came in on.
// A handler may also *continue* a request to a third module while still
// owing a reply to its caller, yielding arbitrarily long call chains.
//
// The crate splits into the frame codec and transport glue (`network`), the
// routing core (`routing`), the method registry and handler contracts
// (`services`), the public node handle (`Qbus`) and the process façade
// (`instance`).

pub mod config;
pub mod instance;
pub mod message;
pub mod network;
pub mod services;

mod node;
mod routing;

pub use message::Message;
pub use node::Qbus;
pub use services::{HandlerResult, OnMessage, Outcome};

// Shared types, re-exported for convenience.
pub use qbus_common::{Component, Logger, QbusError, Value};
