// Qbus node
//
// INTENTION: The public face of a bus participant. A `Qbus` registers local
// methods, issues requests towards named modules, continues requests on
// behalf of a caller, and opens the TCP / local-socket endpoints that knit
// the mesh together. Handlers receive a `&Qbus` so they can call back into
// the bus while running.
//
// The handle is cheap to clone; all state lives behind one `Arc`.

#[cfg(unix)]
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use qbus_common::{Component, Logger, QbusError, Value};

use crate::config;
use crate::message::Message;
use crate::network::{self, NetworkOptions};
use crate::routing::Router;
use crate::services::{HandlerResult, Outcome};

#[derive(Clone)]
pub struct Qbus {
    inner: Arc<QbusInner>,
}

struct QbusInner {
    name: String,
    logger: Logger,
    router: Router,
    options: NetworkOptions,
    config: RwLock<Value>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Qbus {
    /// A new, unconnected bus participant named `name`.
    pub fn new(name: &str) -> Self {
        Self::with_options(name, NetworkOptions::default())
    }

    pub fn with_options(name: &str, options: NetworkOptions) -> Self {
        Self {
            inner: Arc::new(QbusInner {
                name: name.to_string(),
                logger: Logger::new_root(Component::Node, name),
                router: Router::new(name),
                options,
                config: RwLock::new(Value::node()),
                token: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The local module name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn router(&self) -> &Router {
        &self.inner.router
    }

    // ---- methods and requests -----------------------------------------

    /// Register a method under `name` (lookup is case-insensitive). State
    /// captured by the handler is dropped when the entry is removed,
    /// replaced or the bus shuts down.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Qbus, &mut Message, Option<&mut Message>) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.router.register_method(name, Arc::new(handler));
    }

    /// Remove a method; its handler state is dropped.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.router.remove_method(name)
    }

    /// Send a request to `method` on `module`. The reply (a real response,
    /// an error response, or a synthetic no-route error) reaches
    /// `on_reply` at most once.
    pub fn send<F>(
        &self,
        module: &str,
        method: &str,
        msg: Message,
        on_reply: F,
    ) -> Result<(), QbusError>
    where
        F: Fn(&Qbus, &mut Message, Option<&mut Message>) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner
            .router
            .request(self, module, method, msg, Arc::new(on_reply), false)
    }

    /// Continue the request in `qin` towards a third module while the
    /// original caller keeps waiting. The current chain identity moves out
    /// of `qin` into the new chain entry; when the downstream reply arrives,
    /// `on_reply` shapes the response that walks back to the caller.
    ///
    /// Meant as a tail call inside a handler:
    /// `return bus.continue_request("C", "inner", qin, |_, qin, qout| ...);`
    pub fn continue_request<F>(
        &self,
        module: &str,
        method: &str,
        qin: &mut Message,
        on_reply: F,
    ) -> HandlerResult
    where
        F: Fn(&Qbus, &mut Message, Option<&mut Message>) -> HandlerResult + Send + Sync + 'static,
    {
        let msg = qin.take();
        self.inner
            .router
            .request(self, module, method, msg, Arc::new(on_reply), true)?;
        Ok(Outcome::Defer)
    }

    /// Emit a response for `msg` towards `module`, for handlers that kept a
    /// request and answer it later. With no route the response is logged and
    /// dropped.
    pub fn response(&self, module: &str, msg: &mut Message) {
        self.inner.router.respond(self, module, msg, None);
    }

    // ---- topology ------------------------------------------------------

    /// The local module name plus every currently reachable module, as a
    /// payload list.
    pub fn modules(&self) -> Value {
        self.inner.router.nodes()
    }

    /// Peer name of the next-hop connection towards `module`, if routed.
    pub fn route_via(&self, module: &str) -> Option<String> {
        self.inner.router.route_via(module)
    }

    /// Observe topology changes. The callback gets a freshly built module
    /// list and must not mutate the router. Returns a handle for removal.
    pub fn on_change<F>(&self, observer: F) -> u64
    where
        F: Fn(&Qbus, &Value) + Send + Sync + 'static,
    {
        self.inner.router.add_observer(Arc::new(observer))
    }

    pub fn remove_on_change(&self, handle: u64) -> bool {
        self.inner.router.remove_observer(handle)
    }

    /// Number of in-flight chain entries still waiting for a reply.
    pub fn pending_chains(&self) -> usize {
        self.inner.router.pending_chains()
    }

    // ---- endpoints -----------------------------------------------------

    /// Open an inbound TCP endpoint. Returns the bound port (useful with
    /// port 0).
    pub async fn listen(&self, host: &str, port: u16) -> Result<u16> {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let bound = listener.local_addr()?.port();
        self.inner
            .logger
            .info(format!("listening on {host}:{bound}"));
        let task = tokio::spawn(network::run_listener(
            self.clone(),
            listener,
            self.inner.token.child_token(),
        ));
        self.push_task(task);
        Ok(bound)
    }

    /// Dial an outbound TCP peer; the dialer re-connects after every
    /// disconnect until the bus stops.
    pub async fn connect(&self, host: &str, port: u16) {
        self.inner.logger.info(format!("dialing {host}:{port}"));
        let task = tokio::spawn(network::run_dialer(
            self.clone(),
            host.to_string(),
            port,
            self.inner.options.clone(),
            self.inner.token.child_token(),
        ));
        self.push_task(task);
    }

    /// Open an inbound local-socket endpoint at `path`.
    #[cfg(unix)]
    pub async fn listen_local(&self, path: &Path) -> Result<()> {
        // a stale socket file from a previous run blocks the bind
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path)?;
        self.inner
            .logger
            .info(format!("listening on {}", path.display()));
        let task = tokio::spawn(network::run_local_listener(
            self.clone(),
            listener,
            path.display().to_string(),
            self.inner.token.child_token(),
        ));
        self.push_task(task);
        Ok(())
    }

    /// Dial an outbound local-socket peer at `path`, with reconnects.
    #[cfg(unix)]
    pub async fn connect_local(&self, path: &Path) {
        self.inner
            .logger
            .info(format!("dialing {}", path.display()));
        let task = tokio::spawn(network::run_local_dialer(
            self.clone(),
            path.display().to_string(),
            self.inner.options.clone(),
            self.inner.token.child_token(),
        ));
        self.push_task(task);
    }

    fn push_task(&self, task: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Stop the bus: close every endpoint and connection (flushing queued
    /// frames), then drop all method entries and pending chains.
    pub async fn stop(&self) {
        self.inner.logger.info("stopping");
        self.inner.token.cancel();

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }

        // connection read tasks unregister themselves; give them a moment
        for _ in 0..20 {
            if self.inner.router.pending_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.inner.router.shutdown();
    }

    // ---- configuration -------------------------------------------------

    pub(crate) fn set_config(&self, value: Value) {
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner()) = value;
    }

    pub(crate) fn config_value(&self) -> Value {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Typed config access; an absent key inserts the default so it
    /// persists when the config is written back after init.
    pub fn config_str(&self, key: &str, default: &str) -> String {
        config::config_str(
            &mut self.inner.config.write().unwrap_or_else(|e| e.into_inner()),
            key,
            default,
        )
    }

    pub fn config_number(&self, key: &str, default: i64) -> i64 {
        config::config_number(
            &mut self.inner.config.write().unwrap_or_else(|e| e.into_inner()),
            key,
            default,
        )
    }

    pub fn config_float(&self, key: &str, default: f64) -> f64 {
        config::config_float(
            &mut self.inner.config.write().unwrap_or_else(|e| e.into_inner()),
            key,
            default,
        )
    }

    pub fn config_bool(&self, key: &str, default: bool) -> bool {
        config::config_bool(
            &mut self.inner.config.write().unwrap_or_else(|e| e.into_inner()),
            key,
            default,
        )
    }
}

impl std::fmt::Debug for Qbus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qbus")
            .field("name", &self.inner.name)
            .field("modules", &self.inner.router.nodes().to_string())
            .finish()
    }
}
