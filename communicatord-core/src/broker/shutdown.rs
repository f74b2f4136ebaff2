//! Shutdown and refusal semantics (spec.md §4.9): the two shutdown forms
//! (`STOP` for this-broker-only, `SHUTDOWN` for cluster-wide), the
//! transient/shutdown/conflict/too-busy classification of a `REFUSE`
//! reply, and the drain-then-close discipline applied when closing a
//! connection gracefully.

use crate::message::{commands, Message};

/// Why a connection attempt or registration was refused, decoded from a
/// `REFUSE` message's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefuseReason {
    /// No recognized parameter: a plain, transient refusal — reconnect on
    /// the normal backoff schedule.
    Transient,
    /// `shutdown=true`: the peer is going down; wait the long shutdown
    /// delay before retrying.
    Shutdown,
    /// `conflict=<name>`: another connection already claims this
    /// server/service name; do not retry automatically.
    Conflict(String),
    /// `too-busy=true` (or equivalent): back off for a full day.
    TooBusy,
}

pub fn classify_refuse(message: &Message) -> RefuseReason {
    if let Some(name) = message.parameter("conflict") {
        return RefuseReason::Conflict(name.to_string());
    }
    if message.parameter("shutdown") == Some("true") {
        return RefuseReason::Shutdown;
    }
    if message.parameter("too-busy") == Some("true") {
        return RefuseReason::TooBusy;
    }
    RefuseReason::Transient
}

/// Scope of a shutdown request (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownScope {
    /// `STOP`: this broker process only.
    ThisBrokerOnly,
    /// `SHUTDOWN`: propagate to every connected node as well.
    Cluster,
}

pub fn shutdown_scope(command: &str) -> Option<ShutdownScope> {
    match command {
        commands::STOP => Some(ShutdownScope::ThisBrokerOnly),
        commands::SHUTDOWN => Some(ShutdownScope::Cluster),
        _ => None,
    }
}

/// Build the reply a broker sends before actually going down, per spec.md
/// §4.9: `QUITTING` to local connections, `DISCONNECTING` to remote peers
/// (who should then expect this link to drop and not treat it as a
/// failure worth backing off hard for).
pub fn farewell_for(is_remote_peer: bool) -> Message {
    if is_remote_peer {
        Message::new(commands::DISCONNECTING)
    } else {
        Message::new(commands::QUITTING)
    }
}
