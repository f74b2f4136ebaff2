//! Shared plumbing for the communicatord workspace: logging, error
//! conversion helpers, and small value-agnostic utilities used by more than
//! one downstream crate.

pub mod duration;
pub mod error;
pub mod logging;

pub use logging::{Component, Logger, LoggingConfig, LoggingContext, LogLevel};
