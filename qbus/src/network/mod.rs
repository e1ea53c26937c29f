// Network engines
//
// Byte-level transport for the router: TCP and local-socket listeners and
// dialers. Every established stream gets a read task (decode frames, feed
// the router) and a write task (drain the send queue, frame, flush).
// Reconnecting an outbound peer is owned here, not by the router: a
// successful reconnect registers a brand-new connection and the handshake
// restarts from scratch.

pub mod connection;
pub mod frame;

pub use connection::{ConnKind, Connection};
pub use frame::{Frame, FrameType};

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use qbus_common::{Component, Logger};

use crate::node::Qbus;

const READ_CHUNK: usize = 8 * 1024;

/// Options for the network engines.
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Delay between outbound reconnect attempts.
    pub reconnect_interval: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
        }
    }
}

impl NetworkOptions {
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

/// Find a free TCP port in the given range using a randomized approach
pub fn pick_free_port(port_range: Range<u16>) -> Option<u16> {
    use rand::Rng;
    let mut rng = rand::rng();
    let range_size = port_range.end - port_range.start;

    // Limit number of attempts to avoid infinite loops
    let max_attempts = 50;
    let mut attempts = 0;

    while attempts < max_attempts {
        let port = port_range.start + rng.random_range(0..range_size);

        if let Ok(listener) =
            StdTcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        {
            if let Ok(addr) = listener.local_addr() {
                return Some(addr.port());
            }
        }

        attempts += 1;
    }

    None // No free port found after max attempts
}

/// Accept inbound TCP links until cancelled.
pub(crate) async fn run_listener(
    bus: Qbus,
    listener: tokio::net::TcpListener,
    token: CancellationToken,
) {
    let logger = Logger::new_root(Component::Network, bus.name());
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    spawn_connection(
                        &bus,
                        stream,
                        ConnKind::TcpInbound,
                        addr.to_string(),
                        token.child_token(),
                    );
                }
                Err(err) => {
                    logger.warn(format!("accept failed: {err}"));
                }
            }
        }
    }
}

/// Dial an outbound TCP peer, re-dialling after every disconnect.
pub(crate) async fn run_dialer(
    bus: Qbus,
    host: String,
    port: u16,
    options: NetworkOptions,
    token: CancellationToken,
) {
    let label = format!("{host}:{port}");
    let logger = Logger::new_root(Component::Network, label.clone());
    loop {
        if token.is_cancelled() {
            return;
        }
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                logger.info("connected");
                let (_conn, done) = spawn_connection(
                    &bus,
                    stream,
                    ConnKind::TcpOutbound,
                    label.clone(),
                    token.child_token(),
                );
                let _ = done.await;
                logger.info("connection closed");
            }
            Err(err) => {
                logger.debug(format!("connect failed: {err}"));
            }
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(options.reconnect_interval) => {}
        }
    }
}

/// Accept inbound local-socket links until cancelled.
#[cfg(unix)]
pub(crate) async fn run_local_listener(
    bus: Qbus,
    listener: tokio::net::UnixListener,
    path: String,
    token: CancellationToken,
) {
    let logger = Logger::new_root(Component::Network, bus.name());
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    spawn_connection(
                        &bus,
                        stream,
                        ConnKind::LocalInbound,
                        path.clone(),
                        token.child_token(),
                    );
                }
                Err(err) => {
                    logger.warn(format!("accept failed on {path}: {err}"));
                }
            }
        }
    }
}

/// Dial an outbound local-socket peer, re-dialling after every disconnect.
#[cfg(unix)]
pub(crate) async fn run_local_dialer(
    bus: Qbus,
    path: String,
    options: NetworkOptions,
    token: CancellationToken,
) {
    let logger = Logger::new_root(Component::Network, path.clone());
    loop {
        if token.is_cancelled() {
            return;
        }
        match tokio::net::UnixStream::connect(&path).await {
            Ok(stream) => {
                logger.info("connected");
                let (_conn, done) = spawn_connection(
                    &bus,
                    stream,
                    ConnKind::LocalOutbound,
                    path.clone(),
                    token.child_token(),
                );
                let _ = done.await;
                logger.info("connection closed");
            }
            Err(err) => {
                logger.debug(format!("connect failed: {err}"));
            }
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(options.reconnect_interval) => {}
        }
    }
}

/// Wire one established stream into the router: register the connection in
/// the arena, start its write and read tasks, open the handshake. Returns
/// the connection and the read task handle (done = link closed and cleaned
/// up).
pub(crate) fn spawn_connection<S>(
    bus: &Qbus,
    stream: S,
    kind: ConnKind,
    label: String,
    token: CancellationToken,
) -> (Arc<Connection>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    let id = bus.router().next_conn_id();
    let logger = Logger::new_root(Component::Network, format!("{label}#{id}"));
    let conn = Arc::new(Connection::new(id, kind, label, tx, logger.clone()));
    bus.router().track(conn.clone());

    tokio::spawn(write_loop(writer, rx, logger.clone()));

    let read_bus = bus.clone();
    let read_conn = conn.clone();
    let handle = tokio::spawn(async move {
        read_loop(read_bus, read_conn, reader, token, logger).await;
    });

    (conn, handle)
}

/// Drain the send queue, encoding and flushing each frame. Ends when the
/// last sender is gone (queue flushed) or the peer went away.
async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Frame>, logger: Logger)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    while let Some(frame) = rx.recv().await {
        buf.clear();
        frame.encode(&mut buf);
        if let Err(err) = writer.write_all(&buf).await {
            logger.debug(format!("write failed: {err}"));
            return;
        }
        if let Err(err) = writer.flush().await {
            logger.debug(format!("flush failed: {err}"));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Read bytes, decode whole frames, hand them to the router. A malformed
/// frame drops the connection. Always unregisters the link on the way out.
async fn read_loop<R>(
    bus: Qbus,
    conn: Arc<Connection>,
    mut reader: R,
    token: CancellationToken,
    logger: Logger,
) where
    R: AsyncRead + Send + Unpin,
{
    bus.router().conn_reg(&conn);

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    'link: loop {
        tokio::select! {
            _ = token.cancelled() => break 'link,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break 'link,
                Ok(_) => loop {
                    match Frame::decode(&mut buf) {
                        Ok(Some(frame)) => bus.router().on_frame(&bus, &conn, frame),
                        Ok(None) => break,
                        Err(err) => {
                            logger.error(format!("dropping connection: {err}"));
                            break 'link;
                        }
                    }
                },
                Err(err) => {
                    logger.debug(format!("read failed: {err}"));
                    break 'link;
                }
            }
        }
    }

    bus.router().conn_rm(&bus, &conn);
}
