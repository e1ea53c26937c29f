// Node configuration
//
// Logging setup, endpoint records and the per-module JSON config file. A
// module named NAME reads ./NAME.json, merges its command line over it and
// writes the merged tree back after init so inserted defaults persist.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use qbus_common::{QbusError, Value};

/// Log verbosity for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }

    pub fn parse(text: &str) -> Option<LogLevel> {
        match text.to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Process-wide logging configuration applied once at startup.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    default_level: Option<LogLevel>,
    file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_level(mut self, level: LogLevel) -> Self {
        self.default_level = Some(level);
        self
    }

    /// Route log output to a file instead of stderr.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Install the logger. Safe to call more than once; later calls lose
    /// (which is what tests want).
    pub fn apply(&self) {
        let mut builder = env_logger::Builder::from_default_env();
        if let Some(level) = self.default_level {
            builder.filter_level(level.to_filter());
        }
        if let Some(path) = &self.file {
            match File::create(path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(err) => {
                    eprintln!("cannot open log file {}: {err}", path.display());
                }
            }
        }
        let _ = builder.try_init();
    }
}

/// A bind or remote endpoint record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Socket { host: String, port: u16 },
    Pipe { name: String, path: PathBuf },
}

impl Endpoint {
    /// Parse an endpoint string: `host:port`, `socket:host:port` or
    /// `pipe:name:path`.
    pub fn parse(text: &str) -> Result<Endpoint, QbusError> {
        let parts: Vec<&str> = text.split(':').collect();
        match parts.as_slice() {
            [host, port] => Ok(Endpoint::Socket {
                host: host.to_string(),
                port: parse_port(port)?,
            }),
            ["socket", host, port] => Ok(Endpoint::Socket {
                host: host.to_string(),
                port: parse_port(port)?,
            }),
            ["pipe", name, path] => Ok(Endpoint::Pipe {
                name: name.to_string(),
                path: PathBuf::from(path),
            }),
            _ => Err(QbusError::MissingParam(format!(
                "endpoint [{text}] is not host:port, socket:host:port or pipe:name:path"
            ))),
        }
    }

    /// One endpoint out of a config record: either an endpoint string or a
    /// node `{type, host, port}` / `{type, name, path}`.
    fn from_record(value: &Value) -> Option<Endpoint> {
        if let Some(text) = value.as_str() {
            return Endpoint::parse(text).ok();
        }
        match value.get("type").and_then(Value::as_str) {
            Some("socket") => {
                let host = value.get("host")?.as_str()?.to_string();
                let port = u16::try_from(value.get("port")?.as_i64()?).ok()?;
                Some(Endpoint::Socket { host, port })
            }
            Some("pipe") => {
                let name = value.get("name")?.as_str()?.to_string();
                let path = PathBuf::from(value.get("path")?.as_str()?);
                Some(Endpoint::Pipe { name, path })
            }
            _ => None,
        }
    }

    /// All endpoints under a config entry, which may be a single record or
    /// a list of records. Malformed records are skipped.
    pub fn from_value(value: &Value) -> Vec<Endpoint> {
        match value {
            Value::List(items) => items.iter().filter_map(Endpoint::from_record).collect(),
            other => Endpoint::from_record(other).into_iter().collect(),
        }
    }
}

fn parse_port(text: &str) -> Result<u16, QbusError> {
    text.parse::<u16>()
        .map_err(|_| QbusError::MissingParam(format!("port [{text}] is not a number")))
}

fn config_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

/// Read `./{name}.json`; a missing or unreadable file yields an empty node.
pub fn load_config(dir: &Path, name: &str) -> Value {
    let path = config_path(dir, name);
    match std::fs::read(&path) {
        Ok(raw) => match serde_json::from_slice::<Value>(&raw) {
            Ok(value) if value.is_node() => value,
            _ => {
                log::warn!(target: "qbus", "[config] ignoring malformed {}", path.display());
                Value::node()
            }
        },
        Err(_) => Value::node(),
    }
}

/// Persist the merged config tree. Empty trees are not written.
pub fn save_config(dir: &Path, name: &str, config: &Value) -> Result<(), QbusError> {
    if !config.is_node() || config.is_empty() {
        return Ok(());
    }
    let text = serde_json::to_string_pretty(config)
        .map_err(|err| QbusError::Encode(err.to_string()))?;
    let path = config_path(dir, name);
    let mut file =
        File::create(&path).map_err(|err| QbusError::Runtime(err.to_string()))?;
    file.write_all(text.as_bytes())
        .map_err(|err| QbusError::Runtime(err.to_string()))?;
    Ok(())
}

// Typed getters over the merged config tree. An absent key inserts the
// default so the value persists when the tree is written back. Values that
// arrived as command-line strings are parsed into the requested type.

pub(crate) fn config_str(config: &mut Value, key: &str, default: &str) -> String {
    match config.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => {
            config.insert(key, default);
            default.to_string()
        }
    }
}

pub(crate) fn config_number(config: &mut Value, key: &str, default: i64) -> i64 {
    match config.get(key) {
        Some(Value::Int(n)) => *n,
        Some(Value::String(text)) => text.parse().unwrap_or(default),
        Some(_) => default,
        None => {
            config.insert(key, default);
            default
        }
    }
}

pub(crate) fn config_float(config: &mut Value, key: &str, default: f64) -> f64 {
    match config.get(key) {
        Some(value) => value
            .as_f64()
            .or_else(|| value.as_str().and_then(|t| t.parse().ok()))
            .unwrap_or(default),
        None => {
            config.insert(key, default);
            default
        }
    }
}

pub(crate) fn config_bool(config: &mut Value, key: &str, default: bool) -> bool {
    match config.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(text)) => match text.as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => default,
        },
        Some(_) => default,
        None => {
            config.insert(key, default);
            default
        }
    }
}
