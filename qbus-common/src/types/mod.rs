// Value types for qbus_common
//
// The tagged value tree is the only payload representation on the bus.
// Frames carry it JSON-encoded; messages and handlers own it in memory.

mod value;

pub use value::Value;
