// Connections
//
// A live peer link as the router sees it: a stable integer handle, the peer
// module name once learned from the handshake, and the send queue. Framing,
// flushing and reconnects belong to the transport tasks in the parent
// module; the router never touches a socket.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;

use qbus_common::Logger;

use super::frame::Frame;

/// Transport flavour and direction of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    TcpInbound,
    TcpOutbound,
    LocalInbound,
    LocalOutbound,
}

/// Arena-owned handle to one peer link.
pub struct Connection {
    id: u64,
    kind: ConnKind,
    /// Remote address or socket path, for log lines.
    label: String,
    /// Peer module name; unknown until the peer's ROUTE_RES arrives.
    peer: ArcSwapOption<String>,
    tx: mpsc::UnboundedSender<Frame>,
    logger: Logger,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        kind: ConnKind,
        label: String,
        tx: mpsc::UnboundedSender<Frame>,
        logger: Logger,
    ) -> Self {
        Self {
            id,
            kind,
            label,
            peer: ArcSwapOption::empty(),
            tx,
            logger,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The learned peer module name, if the handshake completed.
    pub fn peer_name(&self) -> Option<String> {
        self.peer.load_full().map(|name| name.as_ref().clone())
    }

    pub(crate) fn set_peer_name(&self, name: &str) {
        self.peer.store(Some(Arc::new(name.to_string())));
    }

    /// Queue a frame for sending; the write task frames and flushes it.
    /// Frames queued after the link dropped are discarded.
    pub(crate) fn send(&self, frame: Frame) {
        if self.tx.send(frame).is_err() {
            self.logger
                .debug(format!("send on closed connection {}", self.label));
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("peer", &self.peer_name())
            .finish()
    }
}
