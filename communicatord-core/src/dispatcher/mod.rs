//! Command-name → handler map (spec.md §4.5, §9 DESIGN NOTES).
//!
//! Built once at startup as a `HashMap<&'static str, Handler>`, replacing
//! the member-function-pointer table the original C++ dispatcher uses.
//! Handlers receive the originating endpoint and the message, plus a
//! `HandlerContext` giving them access to the broker's registry, cache,
//! neighbor store and cluster state — without the dispatcher itself
//! depending on the concrete `Broker` type.

use std::collections::HashMap;

use crate::message::Message;
use crate::registry::EndpointId;

/// Result of handling one message, replacing exception-based signaling on
/// the broker path (spec.md §9): every handler either delivers, caches,
/// drops, or refuses — the dispatcher logs uniformly and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Cached,
    Dropped,
    Refused,
}

/// What a command handler is allowed to see and do. Implemented by the
/// broker; kept as a trait so the dispatcher table does not need to know
/// about `Broker` directly.
pub trait HandlerContext {
    fn handle_command(&mut self, command: &str, origin: EndpointId, message: Message) -> Outcome;
}

type Handler = Box<dyn Fn(&mut dyn HandlerContext, EndpointId, Message) -> Outcome + Send + Sync>;

/// Table-driven matcher from incoming command name to a handler.
pub struct Dispatcher {
    handlers: HashMap<&'static str, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, command: &'static str, handler: Handler) {
        self.handlers.insert(command, handler);
    }

    pub fn is_known_command(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Dispatch `message` to the registered handler for its command, or
    /// `None` if the command is not one the broker itself handles (the
    /// caller should then reply `UNKNOWN` or forward per spec.md §4.6).
    pub fn dispatch(
        &self,
        context: &mut dyn HandlerContext,
        origin: EndpointId,
        message: Message,
    ) -> Option<Outcome> {
        let handler = self.handlers.get(message.command.as_str())?;
        Some(handler(context, origin, message))
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
