// Messages
//
// The in-memory form of a call. A handler owns the input message for the
// duration of the dispatch; payload values move frame -> message -> handler
// -> frame without being copied.

use qbus_common::{QbusError, Value};
use uuid::Uuid;

/// One side of a request/response exchange as seen by handlers.
///
/// `cdata` is the structured content, `clist` an optional sequence next to
/// it, `rinfo` opaque request info threaded through continuations, `files`
/// attachment descriptors. Absent parts are `Value::Null`.
#[derive(Debug, Default)]
pub struct Message {
    /// Names the outstanding request/response pair this message belongs to.
    pub chain_key: String,
    /// Module the message came from, once it crossed a connection.
    pub sender: Option<String>,
    pub cdata: Value,
    pub clist: Value,
    pub rinfo: Value,
    pub files: Value,
    pub err: Option<QbusError>,
}

impl Message {
    /// A fresh message under a new chain key.
    pub fn new() -> Self {
        Self {
            chain_key: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }

    /// A message joining an existing chain; a missing key gets a fresh one.
    pub fn with_chain(chain_key: Option<String>, sender: Option<String>) -> Self {
        Self {
            chain_key: chain_key.unwrap_or_else(|| Uuid::new_v4().to_string()),
            sender,
            ..Self::default()
        }
    }

    /// A fresh request message carrying `cdata`.
    pub fn with_cdata(cdata: Value) -> Self {
        Self {
            cdata,
            ..Self::new()
        }
    }

    /// Drop content and error, keeping chain identity, request info and
    /// attachments. Used by handlers that reuse the input for a follow-up.
    pub fn clear(&mut self) {
        self.cdata = Value::Null;
        self.clist = Value::Null;
        self.err = None;
    }

    /// Move the whole message out, leaving an empty one (with a fresh chain
    /// key) behind.
    pub(crate) fn take(&mut self) -> Message {
        std::mem::replace(self, Message::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_messages_get_distinct_chain_keys() {
        let seen: std::collections::HashSet<String> =
            (0..64).map(|_| Message::new().chain_key).collect();
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn clear_keeps_chain_and_rinfo() {
        let mut msg = Message::with_chain(Some("k".into()), Some("a".into()));
        msg.cdata = Value::Bool(true);
        let mut rinfo = Value::node();
        rinfo.insert("user", "root");
        msg.rinfo = rinfo;
        msg.err = Some(QbusError::Runtime("boom".into()));

        msg.clear();
        assert_eq!(msg.chain_key, "k");
        assert!(msg.cdata.is_null());
        assert!(msg.err.is_none());
        assert_eq!(msg.rinfo.get("user"), Some(&Value::String("root".into())));
    }
}
