//! Local event registry
//!
//! Three observable events: `invalidation-message-received`,
//! `reconnecting`, and `reconnected`. Dispatch is synchronous and in
//! registration order; removal is by listener identity. A panicking
//! listener is isolated and logged so it cannot break the emitter or
//! starve later listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::error;

/// Listener for `invalidation-message-received`
///
/// Receives the raw message content and the publisher's cache id. Fires
/// for every inbound message that did not originate locally.
pub type InvalidationMessageListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Listener for `reconnecting` and `reconnected`
///
/// Receives the transport error that started the episode, the attempt
/// counter, and the retry interval in effect for that attempt.
pub type ReconnectionListener = Arc<dyn Fn(&lapin::Error, u64, Duration) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventRegistry {
    invalidation_message_received: Mutex<Vec<InvalidationMessageListener>>,
    reconnecting: Mutex<Vec<ReconnectionListener>>,
    reconnected: Mutex<Vec<ReconnectionListener>>,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown panic".to_string()
    }
}

impl EventRegistry {
    pub fn add_invalidation_message_received(&self, listener: InvalidationMessageListener) {
        self.invalidation_message_received
            .lock()
            .unwrap()
            .push(listener);
    }

    pub fn remove_invalidation_message_received(&self, listener: &InvalidationMessageListener) {
        self.invalidation_message_received
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    pub fn add_reconnecting(&self, listener: ReconnectionListener) {
        self.reconnecting.lock().unwrap().push(listener);
    }

    pub fn remove_reconnecting(&self, listener: &ReconnectionListener) {
        self.reconnecting
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    pub fn add_reconnected(&self, listener: ReconnectionListener) {
        self.reconnected.lock().unwrap().push(listener);
    }

    pub fn remove_reconnected(&self, listener: &ReconnectionListener) {
        self.reconnected
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    pub fn emit_invalidation_message_received(&self, content: &str, publisher_cache_id: &str) {
        let listeners = self.invalidation_message_received.lock().unwrap().clone();
        for listener in listeners {
            if let Err(panic) =
                catch_unwind(AssertUnwindSafe(|| listener(content, publisher_cache_id)))
            {
                error!(
                    event = "invalidation-message-received",
                    panic = %panic_message(panic.as_ref()),
                    "Event listener panicked"
                );
            }
        }
    }

    pub fn emit_reconnecting(&self, error: &lapin::Error, attempt: u64, retry_interval: Duration) {
        let listeners = self.reconnecting.lock().unwrap().clone();
        for listener in listeners {
            if let Err(panic) =
                catch_unwind(AssertUnwindSafe(|| listener(error, attempt, retry_interval)))
            {
                error!(
                    event = "reconnecting",
                    panic = %panic_message(panic.as_ref()),
                    "Event listener panicked"
                );
            }
        }
    }

    pub fn emit_reconnected(&self, error: &lapin::Error, attempt: u64, retry_interval: Duration) {
        let listeners = self.reconnected.lock().unwrap().clone();
        for listener in listeners {
            if let Err(panic) =
                catch_unwind(AssertUnwindSafe(|| listener(error, attempt, retry_interval)))
            {
                error!(
                    event = "reconnected",
                    panic = %panic_message(panic.as_ref()),
                    "Event listener panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            registry.add_invalidation_message_received(Arc::new(move |_, _| {
                log.lock().unwrap().push(tag);
            }));
        }

        registry.emit_invalidation_message_received("reset", "peer");
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_by_identity() {
        let registry = EventRegistry::default();
        let count = Arc::new(Mutex::new(0u32));

        let kept: InvalidationMessageListener = {
            let count = Arc::clone(&count);
            Arc::new(move |_, _| *count.lock().unwrap() += 1)
        };
        let removed: InvalidationMessageListener = {
            let count = Arc::clone(&count);
            Arc::new(move |_, _| *count.lock().unwrap() += 10)
        };

        registry.add_invalidation_message_received(kept.clone());
        registry.add_invalidation_message_received(removed.clone());
        registry.remove_invalidation_message_received(&removed);

        registry.emit_invalidation_message_received("del:k", "peer");
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = EventRegistry::default();
        let reached = Arc::new(Mutex::new(false));

        registry.add_invalidation_message_received(Arc::new(|_, _| {
            panic!("listener exploded");
        }));
        {
            let reached = Arc::clone(&reached);
            registry.add_invalidation_message_received(Arc::new(move |_, _| {
                *reached.lock().unwrap() = true;
            }));
        }

        registry.emit_invalidation_message_received("reset", "peer");
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn test_reconnection_listener_receives_arguments() {
        let registry = EventRegistry::default();
        let seen = Arc::new(Mutex::new(None));

        {
            let seen = Arc::clone(&seen);
            registry.add_reconnecting(Arc::new(move |_, attempt, retry_interval| {
                *seen.lock().unwrap() = Some((attempt, retry_interval));
            }));
        }

        registry.emit_reconnecting(
            &lapin::Error::ChannelsLimitReached,
            3,
            Duration::from_millis(2_000),
        );
        assert_eq!(
            *seen.lock().unwrap(),
            Some((3, Duration::from_millis(2_000)))
        );
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let registry = EventRegistry::default();
        registry.emit_invalidation_message_received("reset", "peer");
        registry.emit_reconnected(&lapin::Error::ChannelsLimitReached, 1, Duration::ZERO);
    }
}
