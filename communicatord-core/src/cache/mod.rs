//! Bounded TTL cache of messages waiting for their destination service to
//! register (spec.md §4.4).
//!
//! Grounded on `original_source/daemon/cache.cpp`: the `cache` message
//! parameter is tokenized on `;` into `name[=value]` pairs (a segment with
//! no name, e.g. a bare leading `=`, is logged and ignored rather than
//! rejecting the whole message); `no` suppresses caching, `reply` asks for
//! an undeliverable notification, `ttl=<duration>` bounds the entry's life
//! (clamped to the original's accepted range of 10 s .. 24 h, default 60 s).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use communicatord_common::logging::Logger;

use crate::message::Message;

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const MIN_TTL: Duration = Duration::from_secs(10);
const MAX_TTL: Duration = Duration::from_secs(86_400);

/// Result of attempting to cache a message, per spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Cached,
    Reply,
    Ignore,
}

struct CacheEntry {
    deadline: Instant,
    message: Message,
}

/// Per-broker (not per-service) bounded cache.
pub struct Cache {
    entries: HashMap<String, VecDeque<CacheEntry>>,
    logger: Logger,
}

impl Cache {
    pub fn new(logger: Logger) -> Self {
        Self {
            entries: HashMap::new(),
            logger,
        }
    }

    /// Parse the message's `cache` parameter and either enqueue the message
    /// under `destination_service` or report why it was not queued.
    pub fn cache_message(
        &mut self,
        destination_service: &str,
        message: Message,
        now: Instant,
    ) -> CacheOutcome {
        let params = parse_cache_parameter(message.parameter("cache").unwrap_or(""), &self.logger);

        let reply_requested = params.contains_key("reply");
        let outcome_if_not_cached = if reply_requested {
            CacheOutcome::Reply
        } else {
            CacheOutcome::Ignore
        };

        if params.contains_key("no") {
            return outcome_if_not_cached;
        }

        let ttl = params
            .get("ttl")
            .and_then(|raw| communicatord_common::duration::parse_duration(raw).ok())
            .map(|d| d.clamp(MIN_TTL, MAX_TTL))
            .unwrap_or(DEFAULT_TTL);

        let deadline = now + ttl;
        self.entries
            .entry(destination_service.to_string())
            .or_default()
            .push_back(CacheEntry { deadline, message });

        CacheOutcome::Cached
    }

    /// Deliver every non-expired, cached message for `destination_service`
    /// to `deliver`, in FIFO (insertion) order, removing them from the
    /// cache as they are handed off. Matches the REGISTER-drains-cache
    /// behavior in spec.md §4.5/§8 invariant 6.
    pub fn drain_into<F: FnMut(Message)>(&mut self, destination_service: &str, now: Instant, mut deliver: F) {
        if let Some(queue) = self.entries.get_mut(destination_service) {
            while let Some(entry) = queue.pop_front() {
                if entry.deadline > now {
                    deliver(entry.message);
                }
            }
        }
        self.entries.remove(destination_service);
    }

    /// Remove every entry whose deadline has passed across all services.
    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|_, queue| {
            queue.retain(|entry| entry.deadline > now);
            !queue.is_empty()
        });
    }

    /// Visit every still-live entry, calling `predicate`; an entry is
    /// removed if the predicate returns `true` or it has expired. Matches
    /// `process_messages()` in the original cache implementation.
    pub fn drain<F: FnMut(&Message) -> bool>(&mut self, now: Instant, mut predicate: F) {
        self.entries.retain(|_, queue| {
            queue.retain(|entry| entry.deadline > now && !predicate(&entry.message));
            !queue.is_empty()
        });
    }

    #[cfg(test)]
    fn len_for(&self, service: &str) -> usize {
        self.entries.get(service).map(|q| q.len()).unwrap_or(0)
    }
}

fn parse_cache_parameter(raw: &str, logger: &Logger) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if raw.is_empty() {
        return params;
    }
    for segment in raw.split(';') {
        if segment.is_empty() {
            continue;
        }
        match segment.find('=') {
            Some(0) => {
                logger.warn(format!(
                    "invalid cache parameter \"{segment}\"; name cannot be empty"
                ));
            }
            Some(pos) => {
                params.insert(segment[..pos].to_string(), segment[pos + 1..].to_string());
            }
            None => {
                params.insert(segment.to_string(), "true".to_string());
            }
        }
    }
    params
}
