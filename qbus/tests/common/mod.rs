#![allow(dead_code)]

// Shared fixtures for the integration tests: logging setup, free ports,
// topology helpers and a poll-until-settled wait.

use std::time::Duration;

use qbus::config::{LogLevel, LoggingConfig};
use qbus::network::pick_free_port;
use qbus::{Message, Qbus, Value};

pub fn init_logging() {
    LoggingConfig::new()
        .with_default_level(LogLevel::Warn)
        .apply();
}

/// Bind a listener for `bus` on a free local port, returning the port.
pub async fn listen_local_port(bus: &Qbus) -> u16 {
    let port = pick_free_port(50000..51000).unwrap_or(0);
    match bus.listen("127.0.0.1", port).await {
        Ok(bound) => bound,
        // the picked port raced with another process; let the OS choose
        Err(_) => bus.listen("127.0.0.1", 0).await.expect("bind"),
    }
}

pub fn names(nodes: &Value) -> Vec<String> {
    nodes
        .as_list()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn sees(bus: &Qbus, module: &str) -> bool {
    names(&bus.modules()).iter().any(|name| name == module)
}

/// Poll until `cond` holds; panics after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A request message whose content is a single-entry node.
pub fn request_with(key: &str, value: impl Into<Value>) -> Message {
    let mut cdata = Value::node();
    cdata.insert(key, value);
    Message::with_cdata(cdata)
}

/// A-B-C: B accepts, A and C dial in. Returns once everyone sees everyone.
pub async fn chain_of_three(a: &str, b: &str, c: &str) -> (Qbus, Qbus, Qbus) {
    let b_bus = Qbus::new(b);
    let port = listen_local_port(&b_bus).await;

    let a_bus = Qbus::new(a);
    a_bus.connect("127.0.0.1", port).await;
    let c_bus = Qbus::new(c);
    c_bus.connect("127.0.0.1", port).await;

    wait_until("the mesh to settle", || {
        sees(&a_bus, b)
            && sees(&a_bus, c)
            && sees(&b_bus, a)
            && sees(&b_bus, c)
            && sees(&c_bus, a)
    })
    .await;

    (a_bus, b_bus, c_bus)
}
