// Instance façade
//
// Process lifecycle for a module binary: parse arguments, load and merge the
// JSON config, set up logging, run init, open the configured endpoints,
// drive the event loop until a signal arrives, tear down, run done.
//
// The runtime is a current-thread tokio loop: all frame handling, route
// updates and method dispatch cooperate on one thread.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use qbus_common::{Component, Logger, Value};

use crate::config::{self, Endpoint, LogLevel, LoggingConfig};
use crate::node::Qbus;

#[derive(Parser, Debug)]
#[command(name = "qbus", about = "QBus module instance")]
struct Args {
    /// Bind endpoint for inbound links (host:port, socket:host:port or
    /// pipe:name:path); repeatable
    #[arg(short = 'b', long = "bind", value_name = "ENDPOINT")]
    bind: Vec<String>,

    /// Remote endpoint to dial (same forms as --bind); repeatable
    #[arg(short = 'd', long = "remote", value_name = "ENDPOINT")]
    remote: Vec<String>,

    /// Route log output to this file instead of stderr
    #[arg(short = 'l', long = "log-file", value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Config override as a key/value pair; repeatable
    #[arg(
        short = 'k',
        long = "set",
        value_names = ["KEY", "VALUE"],
        num_args = 2,
        action = clap::ArgAction::Append
    )]
    set: Vec<String>,
}

/// Run a module instance named `name` until SIGINT/SIGTERM.
///
/// `on_init` runs before any endpoint opens and registers the module's
/// methods; whatever it returns is handed to `on_done` after the loop ends.
/// An `Err` from `on_init` aborts with a non-zero exit; a trapped signal is
/// a clean shutdown.
pub fn run<S>(
    name: &str,
    on_init: impl FnOnce(&Qbus) -> Result<S>,
    on_done: impl FnOnce(&Qbus, S) -> Result<()>,
) -> Result<()> {
    run_with_args(name, std::env::args(), on_init, on_done)
}

/// Like [`run`], with an explicit argument vector.
pub fn run_with_args<S>(
    name: &str,
    argv: impl IntoIterator<Item = String>,
    on_init: impl FnOnce(&Qbus) -> Result<S>,
    on_done: impl FnOnce(&Qbus, S) -> Result<()>,
) -> Result<()> {
    let args = Args::parse_from(argv);

    // config file first, command line merged over it
    let mut params = config::load_config(Path::new("."), name);
    let mut overrides = Value::node();
    for pair in args.set.chunks_exact(2) {
        overrides.insert(pair[0].clone(), pair[1].clone());
    }
    if !args.bind.is_empty() {
        overrides.insert(
            "b",
            Value::List(args.bind.iter().map(|s| Value::from(s.as_str())).collect()),
        );
    }
    if !args.remote.is_empty() {
        overrides.insert(
            "d",
            Value::List(args.remote.iter().map(|s| Value::from(s.as_str())).collect()),
        );
    }
    if let Some(path) = &args.log_file {
        overrides.insert("l", path.display().to_string());
    }
    params.merge(overrides);

    let mut logging = LoggingConfig::new().with_default_level(
        params
            .get("log_level")
            .and_then(Value::as_str)
            .and_then(LogLevel::parse)
            .unwrap_or(LogLevel::Info),
    );
    if let Some(file) = params.get("l").and_then(Value::as_str) {
        logging = logging.with_file(file);
    }
    logging.apply();

    let logger = Logger::new_root(Component::Node, name);
    logger.info(format!("params: {params}"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the event loop")?;

    runtime.block_on(async move {
        let bus = Qbus::new(name);
        bus.set_config(params);

        let state = on_init(&bus)?;

        // persist the merged config, now holding any inserted defaults
        if let Err(err) = config::save_config(Path::new("."), name, &bus.config_value()) {
            logger.warn(format!("config not saved: {err}"));
        }

        let conf = bus.config_value();
        if let Some(binds) = conf.get("b") {
            for endpoint in Endpoint::from_value(binds) {
                open_bind(&bus, &logger, endpoint).await;
            }
        }
        if let Some(remotes) = conf.get("d") {
            for endpoint in Endpoint::from_value(remotes) {
                open_remote(&bus, &logger, endpoint).await;
            }
        }

        logger.info("start main loop");
        wait_for_shutdown(&logger).await;

        bus.stop().await;
        on_done(&bus, state)
    })
}

async fn open_bind(bus: &Qbus, logger: &Logger, endpoint: Endpoint) {
    match endpoint {
        Endpoint::Socket { host, port } => {
            if let Err(err) = bus.listen(&host, port).await {
                logger.error(format!("error in listen: {err}"));
            }
        }
        #[cfg(unix)]
        Endpoint::Pipe { path, .. } => {
            if let Err(err) = bus.listen_local(&path).await {
                logger.error(format!("error in listen: {err}"));
            }
        }
        #[cfg(not(unix))]
        Endpoint::Pipe { path, .. } => {
            logger.error(format!(
                "local sockets are not supported here: {}",
                path.display()
            ));
        }
    }
}

async fn open_remote(bus: &Qbus, _logger: &Logger, endpoint: Endpoint) {
    match endpoint {
        Endpoint::Socket { host, port } => bus.connect(&host, port).await,
        #[cfg(unix)]
        Endpoint::Pipe { path, .. } => bus.connect_local(&path).await,
        #[cfg(not(unix))]
        Endpoint::Pipe { path, .. } => {
            _logger.error(format!(
                "local sockets are not supported here: {}",
                path.display()
            ));
        }
    }
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown(logger: &Logger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(err) => {
                logger.warn(format!("cannot trap SIGTERM: {err}"));
                None
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => logger.info("interrupt received"),
            _ = async {
                match terminate.as_mut() {
                    Some(stream) => {
                        stream.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => logger.info("terminate received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        logger.info("interrupt received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("app").chain(args.iter().copied()))
    }

    #[test]
    fn bind_and_remote_repeat() {
        let args = parse(&[
            "-b",
            "127.0.0.1:8090",
            "-b",
            "socket:0.0.0.0:8091",
            "-d",
            "127.0.0.1:9000",
        ]);
        assert_eq!(args.bind, ["127.0.0.1:8090", "socket:0.0.0.0:8091"]);
        assert_eq!(args.remote, ["127.0.0.1:9000"]);
    }

    #[test]
    fn key_value_pairs_collect_in_order() {
        let args = parse(&["-k", "workers", "4", "-k", "mode", "fast"]);
        assert_eq!(args.set, ["workers", "4", "mode", "fast"]);
    }

    #[test]
    fn log_file_is_optional() {
        assert!(parse(&[]).log_file.is_none());
        assert_eq!(
            parse(&["-l", "/tmp/out.log"]).log_file,
            Some(PathBuf::from("/tmp/out.log"))
        );
    }
}
