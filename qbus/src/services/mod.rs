// Service layer: method registry and handler contracts.
//
// INTENTION: Hold the locally registered methods and define what a handler
// may answer. Handler state is owned by the registry through the closure; it
// is dropped when the entry is removed or replaced, which is the removal
// hook. No separate cleanup callback exists.

use std::sync::Arc;

use dashmap::DashMap;

use qbus_common::{QbusError, Value};

use crate::message::Message;
use crate::node::Qbus;

/// What a handler decided about the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The output message is the reply; send it now.
    Reply,
    /// A continuation was scheduled; the reply is owed by a later hop.
    Defer,
}

pub type HandlerResult = Result<Outcome, QbusError>;

/// Callback invoked with the incoming message and, for requests, an output
/// message to fill. Replies delivered to a `send` callback get `None` for
/// the output; anything it returns is ignored there.
pub type OnMessage =
    Arc<dyn Fn(&Qbus, &mut Message, Option<&mut Message>) -> HandlerResult + Send + Sync>;

/// Observer fired with a freshly built module list whenever the set of
/// reachable modules changes. Must not mutate the router.
pub type OnRouteChange = Arc<dyn Fn(&Qbus, &Value) + Send + Sync>;

struct MethodEntry {
    handler: OnMessage,
}

/// Lowercased method name -> handler. Lookup is case-insensitive by
/// construction: stored lowercase, compared lowercase.
#[derive(Default)]
pub(crate) struct MethodRegistry {
    methods: DashMap<String, MethodEntry>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing (and thereby dropping) any previous
    /// entry under the same name. A call already running on the old handler
    /// finishes on its own clone and releases the state afterwards.
    pub fn register(&self, name: &str, handler: OnMessage) {
        self.methods
            .insert(name.to_ascii_lowercase(), MethodEntry { handler });
    }

    pub fn remove(&self, name: &str) -> bool {
        self.methods.remove(&name.to_ascii_lowercase()).is_some()
    }

    /// Clone the handler out so no registry lock is held during dispatch.
    pub fn find(&self, name: &str) -> Option<OnMessage> {
        self.methods
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.handler.clone())
    }

    /// Drop every entry; runs the handlers' owned state destructors.
    pub fn clear(&self) {
        self.methods.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> OnMessage {
        Arc::new(|_, _, _| Ok(Outcome::Reply))
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = MethodRegistry::new();
        registry.register("FooBar", noop_handler());
        assert!(registry.find("foobar").is_some());
        assert!(registry.find("FOOBAR").is_some());
        assert!(registry.find("fOoBaR").is_some());
        assert!(registry.find("other").is_none());
    }

    #[test]
    fn re_registration_drops_the_old_handler_state() {
        struct Guard(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let guard = Guard(dropped.clone());

        let registry = MethodRegistry::new();
        registry.register("m", {
            Arc::new(move |_: &Qbus, _: &mut Message, _: Option<&mut Message>| {
                let _ = &guard;
                Ok(Outcome::Reply)
            })
        });
        assert!(!dropped.load(std::sync::atomic::Ordering::SeqCst));

        registry.register("M", noop_handler());
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
