// Logging facade for qbus_common
//
// Thin wrapper over the `log` macros so every line carries the component and
// the scope (module name, connection label) it belongs to. Output routing and
// level filtering stay with the `env_logger` setup in the node crate.

/// Subsystem a log line originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Node,
    Network,
    Routing,
    Service,
    Config,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Node => "node",
            Component::Network => "network",
            Component::Routing => "routing",
            Component::Service => "service",
            Component::Config => "config",
        }
    }
}

/// A component-scoped logger handed down from the bus to its parts.
#[derive(Debug, Clone)]
pub struct Logger {
    component: Component,
    scope: String,
}

impl Logger {
    /// Create a root logger for a component, scoped to e.g. the module name.
    pub fn new_root(component: Component, scope: impl Into<String>) -> Self {
        Self {
            component,
            scope: scope.into(),
        }
    }

    /// Same scope, different component.
    pub fn with_component(&self, component: Component) -> Logger {
        Logger {
            component,
            scope: self.scope.clone(),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        log::debug!(target: "qbus", "[{}][{}] {}", self.component.as_str(), self.scope, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        log::info!(target: "qbus", "[{}][{}] {}", self.component.as_str(), self.scope, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        log::warn!(target: "qbus", "[{}][{}] {}", self.component.as_str(), self.scope, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        log::error!(target: "qbus", "[{}][{}] {}", self.component.as_str(), self.scope, message.into());
    }
}
