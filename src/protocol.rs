//! Invalidation wire protocol
//!
//! Messages are raw UTF-8 strings published to a fanout exchange: `reset`
//! clears a peer's cache, `del:<key>` drops one entry. Every message
//! carries the originator's cache id in the `x-cache-id` header so
//! instances can discard their own echoes.

/// Header naming the originating instance on every published message
pub(crate) const CACHE_ID_HEADER: &str = "x-cache-id";

const EXCHANGE_PREFIX: &str = "rabbit-lru-cache-";
const DELETE_PREFIX: &str = "del:";
const RESET_MESSAGE: &str = "reset";

/// Exchange name for an invalidation domain
pub(crate) fn exchange_name(name: &str) -> String {
    format!("{EXCHANGE_PREFIX}{name}")
}

/// Per-instance queue name; exists only while the instance is attached
pub(crate) fn queue_name(exchange: &str, cache_id: &str) -> String {
    format!("{exchange}-{cache_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InvalidationMessage {
    Reset,
    Delete(String),
    /// Anything else on the exchange; observed but never mutates state
    Unknown(String),
}

impl InvalidationMessage {
    pub fn delete(key: &str) -> Self {
        Self::Delete(key.to_string())
    }

    pub fn parse(content: &str) -> Self {
        if content == RESET_MESSAGE {
            Self::Reset
        } else if let Some(key) = content.strip_prefix(DELETE_PREFIX) {
            Self::Delete(key.to_string())
        } else {
            Self::Unknown(content.to_string())
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Reset => RESET_MESSAGE.to_string(),
            Self::Delete(key) => format!("{DELETE_PREFIX}{key}"),
            Self::Unknown(content) => content.clone(),
        }
    }
}
