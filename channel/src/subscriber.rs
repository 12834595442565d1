//! Per-command message fan-out.

use crate::error::Error;
use bitcoin::p2p::message::NetworkMessage;
use std::collections::HashMap;
use std::sync::Mutex;

/// A subscriber callback.
///
/// Invoked with `Ok(message)` for each delivery and once with `Err(code)`
/// when the registry stops. Returning `true` keeps the subscription,
/// returning `false` removes it.
pub type MessageHandler = Box<dyn FnMut(Result<&NetworkMessage, Error>) -> bool + Send>;

struct Inner {
    stopped: Option<Error>,
    handlers: HashMap<String, Vec<MessageHandler>>,
}

/// A per-channel registry of message handlers, keyed by wire command.
///
/// Handlers for one command are invoked in subscription order. Once the
/// registry stops, every registered handler is invoked exactly once with the
/// stop code and the registry empties; late subscriptions are invoked
/// immediately with the same code.
///
/// Handlers run on the owning channel's reader task and must complete
/// promptly; long work belongs in a task the handler posts to.
pub struct MessageSubscriber {
    inner: Mutex<Inner>,
}

impl MessageSubscriber {
    /// Create an empty registry.
    pub fn new() -> Self {
        MessageSubscriber {
            inner: Mutex::new(Inner {
                stopped: None,
                handlers: HashMap::new(),
            }),
        }
    }

    /// Append a handler for `command`.
    ///
    /// If the registry has already stopped, the handler is invoked
    /// immediately with the stop code and discarded.
    pub fn subscribe(&self, command: &str, mut handler: MessageHandler) {
        let stopped = {
            let mut inner = self.inner.lock().expect("subscriber lock");
            match inner.stopped.clone() {
                Some(code) => Some(code),
                None => {
                    inner
                        .handlers
                        .entry(command.to_string())
                        .or_default()
                        .push(handler);
                    return;
                }
            }
        };
        if let Some(code) = stopped {
            handler(Err(code));
        }
    }

    /// Deliver `message` to every handler subscribed to `command`.
    ///
    /// Handlers are taken out of the registry while they run, so a handler
    /// may subscribe (itself or others) without deadlocking; subscriptions
    /// made during delivery are appended after the surviving handlers.
    pub fn notify(&self, command: &str, message: &NetworkMessage) {
        let handlers = {
            let mut inner = self.inner.lock().expect("subscriber lock");
            if inner.stopped.is_some() {
                return;
            }
            match inner.handlers.remove(command) {
                Some(handlers) => handlers,
                None => return,
            }
        };

        let mut retained: Vec<MessageHandler> = Vec::with_capacity(handlers.len());
        for mut handler in handlers {
            if handler(Ok(message)) {
                retained.push(handler);
            }
        }

        let mut inner = self.inner.lock().expect("subscriber lock");
        if let Some(code) = inner.stopped.clone() {
            // Stopped while handlers ran; give the survivors their stop call.
            drop(inner);
            for mut handler in retained {
                handler(Err(code.clone()));
            }
            return;
        }
        let appended = inner.handlers.remove(command).unwrap_or_default();
        retained.extend(appended);
        if !retained.is_empty() {
            inner.handlers.insert(command.to_string(), retained);
        }
    }

    /// Stop the registry: every handler is invoked once with `code` and the
    /// registry empties. Subsequent stops are no-ops.
    pub fn stop(&self, code: Error) {
        let drained = {
            let mut inner = self.inner.lock().expect("subscriber lock");
            if inner.stopped.is_some() {
                return;
            }
            inner.stopped = Some(code.clone());
            std::mem::take(&mut inner.handlers)
        };

        for (_, handlers) in drained {
            for mut handler in handlers {
                handler(Err(code.clone()));
            }
        }
    }

    /// Whether the registry has stopped.
    pub fn stopped(&self) -> bool {
        self.inner.lock().expect("subscriber lock").stopped.is_some()
    }
}

impl Default for MessageSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("subscriber lock");
        f.debug_struct("MessageSubscriber")
            .field("stopped", &inner.stopped)
            .field("commands", &inner.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_handler(hits: Arc<AtomicUsize>, keep: bool) -> MessageHandler {
        Box::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            keep
        })
    }

    #[test]
    fn test_notify_in_subscription_order() {
        let subscriber = MessageSubscriber::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            subscriber.subscribe(
                "ping",
                Box::new(move |_| {
                    order.lock().unwrap().push(tag);
                    true
                }),
            );
        }

        subscriber.notify("ping", &NetworkMessage::Ping(1));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_returning_false_unsubscribes() {
        let subscriber = MessageSubscriber::new();
        let hits = Arc::new(AtomicUsize::new(0));
        subscriber.subscribe("ping", counting_handler(hits.clone(), false));

        subscriber.notify("ping", &NetworkMessage::Ping(1));
        subscriber.notify("ping", &NetworkMessage::Ping(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notify_is_scoped_to_command() {
        let subscriber = MessageSubscriber::new();
        let hits = Arc::new(AtomicUsize::new(0));
        subscriber.subscribe("pong", counting_handler(hits.clone(), true));

        subscriber.notify("ping", &NetworkMessage::Ping(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        subscriber.notify("pong", &NetworkMessage::Pong(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_invokes_every_handler_once() {
        let subscriber = MessageSubscriber::new();
        let stops = Arc::new(AtomicUsize::new(0));

        for command in ["ping", "pong", "addr"] {
            let stops = stops.clone();
            subscriber.subscribe(
                command,
                Box::new(move |event| {
                    assert_eq!(event.unwrap_err(), Error::ChannelStopped);
                    stops.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            );
        }

        subscriber.stop(Error::ChannelStopped);
        assert_eq!(stops.load(Ordering::SeqCst), 3);

        // Second stop delivers nothing further.
        subscriber.stop(Error::ServiceStopped);
        assert_eq!(stops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_subscribe_after_stop_fires_immediately() {
        let subscriber = MessageSubscriber::new();
        subscriber.stop(Error::ChannelStopped);

        let hits = Arc::new(AtomicUsize::new(0));
        let observed = hits.clone();
        subscriber.subscribe(
            "ping",
            Box::new(move |event| {
                assert_eq!(event.unwrap_err(), Error::ChannelStopped);
                observed.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Discarded after the immediate invocation.
        subscriber.notify("ping", &NetworkMessage::Ping(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_subscribe_during_delivery() {
        let subscriber = Arc::new(MessageSubscriber::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let nested = subscriber.clone();
        let nested_hits = hits.clone();
        subscriber.subscribe(
            "ping",
            Box::new(move |_| {
                nested.subscribe("ping", counting_handler(nested_hits.clone(), true));
                false
            }),
        );

        subscriber.notify("ping", &NetworkMessage::Ping(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        subscriber.notify("ping", &NetworkMessage::Ping(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
