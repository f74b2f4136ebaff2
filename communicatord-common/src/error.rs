//! Error utilities shared across the workspace.

pub use anyhow::{anyhow, Result};
pub use thiserror::Error;

/// Small helper utilities for turning errors into log-friendly strings.
pub mod utils {
    /// Flatten any displayable error into a single-line string, trimming the
    /// causal chain noise that `anyhow`'s `Debug` impl would otherwise print.
    pub fn error_to_string(error: impl std::fmt::Display) -> String {
        error.to_string()
    }
}
