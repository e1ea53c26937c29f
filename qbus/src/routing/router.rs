// Router
//
// INTENTION: Drive the five-frame state machine that turns a mesh of raw
// connections into a named module graph. The router owns the route table,
// the chain registry, the method registry and the connection arena; the
// transport feeds it whole frames and calls back on connect and close.
//
// Connections live in an arena keyed by a stable integer handle and the
// route table stores handles, never references, so there is no cycle
// between router and connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use uuid::Uuid;

use qbus_common::{Component, Logger, QbusError, Value};

use crate::message::Message;
use crate::network::{Connection, Frame, FrameType};
use crate::services::{MethodRegistry, OnMessage, OnRouteChange, Outcome};

use super::chains::{ChainEntry, ChainRegistry, Continuation, ForwardData};
use super::route_table::RouteTable;

/// Where a reply to the frame under dispatch must go: back out on the
/// connection it arrived on, or straight into the local response path for
/// loopback calls.
pub(crate) enum ReplyPath<'a> {
    Conn(&'a Arc<Connection>),
    Local,
}

pub(crate) struct Router {
    name: String,
    logger: Logger,
    methods: MethodRegistry,
    chains: ChainRegistry,
    routes: RwLock<RouteTable>,
    connections: DashMap<u64, Arc<Connection>>,
    next_conn_id: AtomicU64,
    observers: Mutex<Vec<(u64, OnRouteChange)>>,
    next_observer_id: AtomicU64,
}

impl Router {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            logger: Logger::new_root(Component::Routing, name),
            methods: MethodRegistry::new(),
            chains: ChainRegistry::new(),
            routes: RwLock::new(RouteTable::new()),
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ---- connection arena ---------------------------------------------

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn track(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id(), conn);
    }

    fn conn_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// A fresh link, either direction: open the symmetric handshake.
    pub fn conn_reg(&self, conn: &Arc<Connection>) {
        self.logger
            .debug(format!("new connection {}", conn.label()));
        conn.send(Frame::new(FrameType::RouteReq, None, None, None, &self.name));
    }

    /// A link dropped: forget the peer and everything behind it, tell the
    /// other neighbours, fire the observers.
    pub fn conn_rm(&self, bus: &crate::node::Qbus, conn: &Arc<Connection>) {
        self.logger
            .debug(format!("connection dropped {}", conn.label()));
        self.connections.remove(&conn.id());
        if let Some(peer) = conn.peer_name() {
            self.routes
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&peer);
        }
        self.send_updates(Some(conn.id()));
        self.fire_on_change(bus);
    }

    // ---- frame dispatch -----------------------------------------------

    pub fn on_frame(&self, bus: &crate::node::Qbus, conn: &Arc<Connection>, frame: Frame) {
        match frame.ftype() {
            FrameType::RouteReq => self.on_route_request(conn, frame),
            FrameType::RouteRes => self.on_route_response(bus, conn, frame),
            FrameType::RouteUpd => self.on_route_update(bus, conn, frame),
            FrameType::MsgReq => self.on_msg_request(bus, ReplyPath::Conn(conn), frame),
            FrameType::MsgRes => self.on_msg_response(bus, frame),
        }
    }

    fn on_route_request(&self, conn: &Arc<Connection>, mut frame: Frame) {
        frame.set_type(FrameType::RouteRes, &self.name);
        let nodes = self.nodes();
        if let Err(err) = frame.set_value_payload(&nodes) {
            self.logger.error(format!("route response: {err}"));
            return;
        }
        conn.send(frame);
    }

    fn on_route_response(&self, bus: &crate::node::Qbus, conn: &Arc<Connection>, frame: Frame) {
        let Some(peer) = frame.sender().map(str::to_string) else {
            self.logger.warn("route response without sender".to_string());
            return;
        };
        let advertised = frame.value_payload();
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add(&self.name, &peer, conn.id(), advertised.as_ref());
        conn.set_peer_name(&peer);
        self.logger
            .debug(format!("route to [{peer}] learned on {}", conn.label()));

        // tell the others about the new nodes
        self.send_updates(Some(conn.id()));
        self.fire_on_change(bus);
    }

    fn on_route_update(&self, bus: &crate::node::Qbus, conn: &Arc<Connection>, frame: Frame) {
        // updates from links that never completed the handshake are ignored
        let Some(peer) = conn.peer_name() else {
            return;
        };
        if let Some(advertised) = frame.value_payload() {
            self.routes
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .update(&self.name, &peer, &advertised);
        }
        self.fire_on_change(bus);
    }

    /// Broadcast the current node set to every neighbour except `exclude`.
    fn send_updates(&self, exclude: Option<u64>) {
        let (handles, nodes) = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            (routes.conns(exclude), routes.nodes(&self.name))
        };
        for handle in handles {
            let Some(conn) = self.conn_by_id(handle) else {
                continue;
            };
            let mut frame = Frame::new(FrameType::RouteUpd, None, None, None, &self.name);
            if let Err(err) = frame.set_value_payload(&nodes) {
                self.logger.error(format!("route update: {err}"));
                return;
            }
            self.logger
                .debug(format!("send route update {nodes} -> {}", conn.label()));
            conn.send(frame);
        }
    }

    fn on_msg_request(&self, bus: &crate::node::Qbus, reply: ReplyPath, mut frame: Frame) {
        let target = frame.module().unwrap_or("").to_string();

        if target == self.name {
            self.on_msg_method(bus, reply, frame);
            return;
        }

        // not addressed to us: relay towards the destination
        let next = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&target)
            .and_then(|handle| self.conn_by_id(handle));
        match next {
            Some(next) => self.forward_request(&next, frame),
            None => {
                let err = QbusError::NotFound(format!("no route to {target}"));
                frame.set_type(FrameType::MsgRes, &self.name);
                if let Err(err) = frame.set_error_payload(&err) {
                    self.logger.error(format!("no-route reply: {err}"));
                    return;
                }
                self.send_reply(bus, reply, frame);
            }
        }
    }

    /// Relay a request one hop: park the caller's chain identity under a
    /// fresh key so the reply can be rewritten on its way back.
    fn forward_request(&self, next: &Arc<Connection>, mut frame: Frame) {
        let forward = ForwardData {
            chain_key: frame.chain_key().unwrap_or("").to_string(),
            sender: frame.sender().unwrap_or("").to_string(),
        };

        let relay_key = Uuid::new_v4().to_string();
        self.chains
            .insert(relay_key.clone(), ChainEntry::Forward(forward));

        frame.set_chain_key(relay_key);
        frame.set_sender(self.name.clone());
        next.send(frame);
    }

    /// A request addressed to this module: dispatch to the local method.
    fn on_msg_method(&self, bus: &crate::node::Qbus, reply: ReplyPath, mut frame: Frame) {
        let method = frame.method().unwrap_or("").to_string();

        let Some(handler) = self.methods.find(&method) else {
            let err = QbusError::NotFound(format!("method [{method}] not found"));
            frame.set_type(FrameType::MsgRes, &self.name);
            if let Err(err) = frame.set_error_payload(&err) {
                self.logger.error(format!("not-found reply: {err}"));
                return;
            }
            self.send_reply(bus, reply, frame);
            return;
        };

        let mut qin = match frame.to_message() {
            Ok(msg) => msg,
            Err(err) => {
                self.logger.error(format!("request dropped: {err}"));
                return;
            }
        };
        let mut qout = Message::new();

        match handler(bus, &mut qin, Some(&mut qout)) {
            Ok(Outcome::Defer) => {
                // the handler scheduled a continuation; the reply is owed by
                // the downstream chain entry it installed
            }
            Ok(Outcome::Reply) => {
                if let Err(err) = frame.set_message_payload(&mut qout, None) {
                    self.logger.error(format!("reply dropped: {err}"));
                    return;
                }
                frame.set_type(FrameType::MsgRes, &self.name);
                self.send_reply(bus, reply, frame);
            }
            Err(handler_err) => {
                if let Err(err) = frame.set_message_payload(&mut qout, Some(&handler_err)) {
                    self.logger.error(format!("error reply dropped: {err}"));
                    return;
                }
                frame.set_type(FrameType::MsgRes, &self.name);
                self.send_reply(bus, reply, frame);
            }
        }
    }

    fn send_reply(&self, bus: &crate::node::Qbus, reply: ReplyPath, frame: Frame) {
        match reply {
            ReplyPath::Conn(conn) => conn.send(frame),
            ReplyPath::Local => self.on_msg_response(bus, frame),
        }
    }

    fn on_msg_response(&self, bus: &crate::node::Qbus, mut frame: Frame) {
        let Some(chain_key) = frame.chain_key().map(str::to_string) else {
            return;
        };
        let Some(entry) = self.chains.extract(&chain_key) else {
            // late reply; its chain entry is long gone
            self.logger
                .debug(format!("dropped reply for unknown chain {chain_key}"));
            return;
        };

        match entry {
            ChainEntry::Response {
                handler,
                continuation: Some(cont),
            } => self.continue_chain(bus, frame, handler, cont),
            ChainEntry::Response {
                handler,
                continuation: None,
            } => {
                let mut qin = match frame.to_message() {
                    Ok(msg) => msg,
                    Err(err) => {
                        self.logger.error(format!("reply dropped: {err}"));
                        return;
                    }
                };
                let _ = handler(bus, &mut qin, None);
            }
            ChainEntry::Forward(forward) => self.return_forward(frame, forward),
        }
    }

    /// Walk a continued chain back one hop: hand the downstream reply to the
    /// saved handler under the upstream chain identity, then answer the
    /// upstream caller unless the handler continued once more.
    fn continue_chain(
        &self,
        bus: &crate::node::Qbus,
        mut frame: Frame,
        handler: OnMessage,
        cont: Continuation,
    ) {
        let mut qin = match frame.to_message() {
            Ok(msg) => msg,
            Err(err) => {
                self.logger.error(format!("continued reply dropped: {err}"));
                return;
            }
        };
        if qin.rinfo.is_null() {
            qin.rinfo = cont.rinfo;
        }
        // restore the upstream identity; this matters when the handler
        // issues yet another continuation from here
        qin.chain_key = cont.chain_key.clone();
        qin.sender = Some(cont.sender.clone());

        let mut qout = Message::new();
        match handler(bus, &mut qin, Some(&mut qout)) {
            Ok(Outcome::Defer) => {}
            Ok(Outcome::Reply) => {
                qout.chain_key = cont.chain_key;
                self.respond(bus, &cont.sender, &mut qout, None);
            }
            Err(err) => {
                qout.chain_key = cont.chain_key;
                self.respond(bus, &cont.sender, &mut qout, Some(&err));
            }
        }
    }

    /// Return a forwarded reply along the original path, restoring the chain
    /// key and sender it arrived with.
    fn return_forward(&self, mut frame: Frame, forward: ForwardData) {
        let back = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&forward.sender)
            .and_then(|handle| self.conn_by_id(handle));
        match back {
            Some(conn) => {
                frame.set_chain_key(forward.chain_key);
                frame.set_sender(forward.sender);
                conn.send(frame);
            }
            None => {
                self.logger
                    .error(format!("forwarded reply to [{}] undeliverable", forward.sender));
            }
        }
    }

    // ---- request issuance ---------------------------------------------

    /// Issue a request towards `module`. With `cont` set the current chain
    /// identity of `msg` is saved so the eventual reply walks back one more
    /// hop (a continuation).
    pub fn request(
        &self,
        bus: &crate::node::Qbus,
        module: &str,
        method: &str,
        mut msg: Message,
        handler: OnMessage,
        cont: bool,
    ) -> Result<(), QbusError> {
        if module == self.name {
            // loopback: no route entry exists for the local module
            let frame = self.build_request(module, method, &mut msg, handler, cont)?;
            self.on_msg_request(bus, ReplyPath::Local, frame);
            return Ok(());
        }

        let conn = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .and_then(|handle| self.conn_by_id(handle));
        match conn {
            Some(conn) => {
                let frame = self.build_request(module, method, &mut msg, handler, cont)?;
                conn.send(frame);
                Ok(())
            }
            None => {
                self.no_route(bus, module, msg, handler);
                Ok(())
            }
        }
    }

    fn build_request(
        &self,
        module: &str,
        method: &str,
        msg: &mut Message,
        handler: OnMessage,
        cont: bool,
    ) -> Result<Frame, QbusError> {
        let chain_key = Uuid::new_v4().to_string();
        let mut frame = Frame::new(
            FrameType::MsgReq,
            Some(chain_key.clone()),
            Some(module.to_string()),
            Some(method.to_string()),
            &self.name,
        );
        frame.set_message_payload(msg, None)?;

        let continuation = if cont && !msg.chain_key.is_empty() {
            self.logger.debug(format!(
                "saving chain [{}] for continue",
                msg.chain_key
            ));
            Some(Continuation {
                chain_key: std::mem::take(&mut msg.chain_key),
                sender: msg.sender.take().unwrap_or_default(),
                rinfo: msg.rinfo.take(),
            })
        } else {
            None
        };

        self.chains.insert(
            chain_key,
            ChainEntry::Response {
                handler,
                continuation,
            },
        );
        Ok(frame)
    }

    /// No connection can reach the module: answer the caller locally with a
    /// synthetic error reply. No chain entry is created.
    fn no_route(&self, bus: &crate::node::Qbus, module: &str, mut msg: Message, handler: OnMessage) {
        self.logger.warn(format!("no route to module {module}"));
        msg.err = Some(QbusError::NotFound("no route to module".to_string()));
        let _ = handler(bus, &mut msg, None);
    }

    /// Emit a response for `msg` towards `module`. Loopback responses join
    /// the local response path directly.
    pub fn respond(
        &self,
        bus: &crate::node::Qbus,
        module: &str,
        msg: &mut Message,
        err: Option<&QbusError>,
    ) {
        let mut frame = Frame::new(
            FrameType::MsgRes,
            Some(msg.chain_key.clone()),
            Some(module.to_string()),
            None,
            &self.name,
        );
        if let Err(encode_err) = frame.set_message_payload(msg, err) {
            self.logger.error(format!("response dropped: {encode_err}"));
            return;
        }

        if module == self.name {
            self.on_msg_response(bus, frame);
            return;
        }

        let conn = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .and_then(|handle| self.conn_by_id(handle));
        match conn {
            Some(conn) => conn.send(frame),
            None => {
                // the waiting chain entry on the caller stays pending
                self.logger
                    .error(format!("no route for response to [{module}]"));
            }
        }
    }

    // ---- registries and observers -------------------------------------

    pub fn register_method(&self, name: &str, handler: OnMessage) {
        self.methods.register(name, handler);
    }

    pub fn remove_method(&self, name: &str) -> bool {
        self.methods.remove(name)
    }

    pub fn add_observer(&self, observer: OnRouteChange) -> u64 {
        let handle = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle, observer));
        handle
    }

    pub fn remove_observer(&self, handle: u64) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|(id, _)| *id != handle);
        observers.len() != before
    }

    /// Run every observer with a freshly built node list. The list is
    /// cloned out of the lock first, so a callback may add or remove
    /// observers without deadlocking.
    fn fire_on_change(&self, bus: &crate::node::Qbus) {
        let observers: Vec<OnRouteChange> = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        if observers.is_empty() {
            return;
        }
        let nodes = self.nodes();
        for observer in observers {
            observer(bus, &nodes);
        }
    }

    pub fn nodes(&self) -> Value {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .nodes(&self.name)
    }

    /// Peer name of the next hop towards `module`, for introspection.
    pub fn route_via(&self, module: &str) -> Option<String> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .and_then(|handle| self.conn_by_id(handle))
            .and_then(|conn| conn.peer_name())
    }

    pub fn pending_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn pending_connections(&self) -> usize {
        self.connections.len()
    }

    /// Tear down: drop every method entry (running their state destructors)
    /// and every pending chain entry, forget all connections.
    pub fn shutdown(&self) {
        self.methods.clear();
        self.chains.clear();
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.connections.clear();
    }
}
