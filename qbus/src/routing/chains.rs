// Chain registry
//
// Thread-safe mapping from in-flight chain keys to the record that must
// receive the reply. Entries go in on send/continue/forward and come out
// exactly once, when the matching response arrives. There is no timed
// garbage collection: an entry lives until a reply, or until shutdown.

use dashmap::DashMap;

use qbus_common::Value;

use crate::services::OnMessage;

/// Saved context of a continuation: the upstream request this node still
/// owes a reply to while the downstream call is in flight.
pub(crate) struct Continuation {
    pub chain_key: String,
    pub sender: String,
    pub rinfo: Value,
}

/// Where a forwarded request came from, so its reply can be rewritten and
/// returned along the original path.
pub(crate) struct ForwardData {
    pub chain_key: String,
    pub sender: String,
}

/// A pending reply hook.
pub(crate) enum ChainEntry {
    /// A local caller waits on this handler; with a continuation attached
    /// the reply walks back one more hop after the handler ran.
    Response {
        handler: OnMessage,
        continuation: Option<Continuation>,
    },
    /// The request merely passed through this node.
    Forward(ForwardData),
}

#[derive(Default)]
pub(crate) struct ChainRegistry {
    chains: DashMap<String, ChainEntry>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, chain_key: String, entry: ChainEntry) {
        self.chains.insert(chain_key, entry);
    }

    /// Find-and-remove; ownership of the entry passes to the caller, which
    /// runs the handler and then releases it.
    pub fn extract(&self, chain_key: &str) -> Option<ChainEntry> {
        self.chains.remove(chain_key).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn clear(&self) {
        self.chains.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::services::Outcome;

    #[test]
    fn extract_removes_the_entry() {
        let registry = ChainRegistry::new();
        registry.insert(
            "k".into(),
            ChainEntry::Forward(ForwardData {
                chain_key: "orig".into(),
                sender: "a".into(),
            }),
        );
        assert_eq!(registry.len(), 1);

        assert!(registry.extract("k").is_some());
        assert!(registry.extract("k").is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn response_entries_keep_their_continuation() {
        let registry = ChainRegistry::new();
        registry.insert(
            "k".into(),
            ChainEntry::Response {
                handler: Arc::new(|_, _, _| Ok(Outcome::Reply)),
                continuation: Some(Continuation {
                    chain_key: "upstream".into(),
                    sender: "a".into(),
                    rinfo: Value::Null,
                }),
            },
        );

        match registry.extract("k") {
            Some(ChainEntry::Response {
                continuation: Some(cont),
                ..
            }) => {
                assert_eq!(cont.chain_key, "upstream");
                assert_eq!(cont.sender, "a");
            }
            _ => panic!("expected a response entry with continuation"),
        }
    }
}
