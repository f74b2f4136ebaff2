//! Thin logging wrapper shared by the broker core and the daemon binary.
//!
//! Mirrors the shape of the teacher's `runar_common::logging` module: a
//! `Component`-tagged `Logger` with `debug`/`info`/`warn`/`error` helpers,
//! and a `LoggingContext` trait for types that can hand out a scoped view of
//! themselves for log lines.

use std::fmt;
use std::sync::Arc;

/// Subsystem that is emitting a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Broker,
    Transport,
    Cluster,
    Cache,
    Dispatcher,
    Registry,
    Cli,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Broker => "broker",
            Component::Transport => "transport",
            Component::Cluster => "cluster",
            Component::Cache => "cache",
            Component::Dispatcher => "dispatcher",
            Component::Registry => "registry",
            Component::Cli => "cli",
        };
        write!(f, "{name}")
    }
}

/// A logger scoped to a component and, optionally, a server/endpoint name.
///
/// Cloning is cheap: the inner fields are plain strings, no shared state.
#[derive(Debug, Clone)]
pub struct Logger {
    component: Component,
    context: String,
}

impl Logger {
    /// Create a logger with no extra context beyond its component.
    pub fn new_root(component: Component, context: impl Into<String>) -> Self {
        Self {
            component,
            context: context.into(),
        }
    }

    /// Derive a logger with additional context appended, e.g. an endpoint id.
    pub fn with_context(&self, extra: impl fmt::Display) -> Self {
        Self {
            component: self.component,
            context: format!("{}/{}", self.context, extra),
        }
    }

    fn prefix(&self) -> String {
        format!("[{}:{}]", self.component, self.context)
    }

    pub fn debug(&self, message: impl Into<String>) {
        log::debug!("{} {}", self.prefix(), message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        log::info!("{} {}", self.prefix(), message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        log::warn!("{} {}", self.prefix(), message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        log::error!("{} {}", self.prefix(), message.into());
    }
}

/// Implemented by types that can hand out a `Logger` view of themselves.
pub trait LoggingContext {
    fn component(&self) -> Component;
    fn logger(&self) -> &Logger;
}

/// Log level understood by `LoggingConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// Builder that installs `env_logger` as the process-wide logger.
///
/// Matches the `LoggingConfig::new().with_default_level(..).apply()` shape
/// referenced by the teacher's network tests.
pub struct LoggingConfig {
    default_level: LogLevel,
    debug_all_messages: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: LogLevel::Info,
            debug_all_messages: false,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    /// Mirrors the daemon's `--debug-all-messages` flag: forces trace level
    /// regardless of the configured default.
    pub fn with_debug_all_messages(mut self, enabled: bool) -> Self {
        self.debug_all_messages = enabled;
        self
    }

    /// Install this configuration as the global logger. Safe to call once;
    /// subsequent calls are ignored by `env_logger`'s own guard.
    pub fn apply(&self) {
        let level = if self.debug_all_messages {
            log::LevelFilter::Trace
        } else {
            self.default_level.into()
        };
        let _ = env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp_millis()
            .try_init();
    }
}

/// Shared handle to a logger, used by types that are themselves `Clone`/`Arc`'d.
pub type SharedLogger = Arc<Logger>;
