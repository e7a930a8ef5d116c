//! Inbound event routing
//!
//! Frames whose `ref` belongs to an outstanding request are replies and go
//! to the correlator only. A frame with a `ref` and a `status` that matches
//! nothing is a reply that arrived too late and is dropped. Everything else
//! is a push and goes to the listeners registered for its event name. Listeners are called in
//! registration order on the connection task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use crate::correlator::Correlator;
use crate::error::Error;
use crate::frame::Frame;

/// Handle returned by a subscription, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type PushListener = Arc<dyn Fn(&Value) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Default)]
struct Registry {
    push: HashMap<String, Vec<(ListenerId, PushListener)>>,
    error: Vec<(ListenerId, ErrorListener)>,
}

/// Subscription table shared by the client handle and the connection task
#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    registry: RwLock<Registry>,
}

/// Where an inbound frame goes
#[derive(Debug)]
pub(crate) enum Route {
    Reply { reference: String, frame: Frame },
    Late(Frame),
    Push(Frame),
}

/// Decide whether a frame answers an outstanding request
pub(crate) fn classify(frame: Frame, correlator: &Correlator) -> Route {
    match &frame.reference {
        Some(reference) if correlator.contains(reference) => Route::Reply {
            reference: reference.clone(),
            frame,
        },
        // Hub pushes such as `restart` carry a ref but never a status
        Some(_) if frame.status.is_some() => Route::Late(frame),
        _ => Route::Push(frame),
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a listener for a push event
    pub fn on<F>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry
            .push
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for asynchronous errors
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.error.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);

        let before = registry.error.len();
        registry.error.retain(|(lid, _)| *lid != id);
        if registry.error.len() != before {
            return true;
        }

        for listeners in registry.push.values_mut() {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            if listeners.len() != before {
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, event: &str) -> usize {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.push.get(event).map(Vec::len).unwrap_or(0)
    }

    /// Deliver a push payload. Returns how many listeners ran.
    pub(crate) fn emit(&self, event: &str, payload: &Value) -> usize {
        // Snapshot so listeners may (un)subscribe without deadlocking
        let listeners: Vec<PushListener> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            match registry.push.get(event) {
                Some(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
                None => Vec::new(),
            }
        };

        if listeners.is_empty() {
            debug!(event = %event, "No listeners, dropping event");
        }
        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    /// Deliver an error to the `error` listeners
    pub(crate) fn emit_error(&self, error: &Error) {
        let listeners: Vec<ErrorListener> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry.error.iter().map(|(_, l)| l.clone()).collect()
        };

        if listeners.is_empty() {
            warn!(error = %error, "Unobserved client error");
        }
        for listener in &listeners {
            listener(error);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventDispatcher")
            .field("events", &registry.push.keys().collect::<Vec<_>>())
            .field("error_listeners", &registry.error.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{Completion, Step};
    use crate::frame::Status;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_listeners_run_in_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            dispatcher.on("channels/broadcast", move |payload| {
                seen.lock().unwrap().push(format!("{}:{}", tag, payload["message"]));
            });
        }

        let delivered = dispatcher.emit("channels/broadcast", &json!({"message": "hi"}));

        assert_eq!(delivered, 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:\"hi\"".to_string(), "second:\"hi\"".to_string()]
        );
    }

    #[test]
    fn test_unmatched_event_dropped() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on("tells/receive", |_| panic!("wrong event"));
        assert_eq!(dispatcher.emit("achievements/sync", &json!({})), 0);
    }

    #[test]
    fn test_off() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.on("tells/receive", |_| {});
        let err_id = dispatcher.on_error(|_| {});

        assert_eq!(dispatcher.listener_count("tells/receive"), 1);
        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        assert!(dispatcher.off(err_id));
        assert_eq!(dispatcher.emit("tells/receive", &json!({})), 0);
    }

    #[test]
    fn test_listener_can_subscribe_during_emit() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = dispatcher.clone();
        dispatcher.on("games/connect", move |_| {
            inner.on("games/connect", |_| {});
        });

        dispatcher.emit("games/connect", &json!({"game": "X"}));
        assert_eq!(dispatcher.listener_count("games/connect"), 2);
    }

    #[test]
    fn test_error_listeners() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.on_error(move |e| sink.lock().unwrap().push(e.clone()));

        dispatcher.emit_error(&Error::Protocol("bad frame".into()));

        assert_eq!(*seen.lock().unwrap(), vec![Error::Protocol("bad frame".into())]);
    }

    #[test]
    fn test_classify() {
        let mut correlator = Correlator::new();
        let reference = correlator.register(
            "players/status",
            Completion::Internal(Step::Snapshot),
            Duration::from_secs(5),
        );

        let reply = Frame::request("players/status", reference.clone(), json!({}));
        assert!(matches!(
            classify(reply, &correlator),
            Route::Reply { reference: r, .. } if r == reference
        ));

        // Unknown references are pushes (e.g. hub-initiated restart)
        let restart = Frame::request("restart", "hub-ref", json!({"downtime": 15}));
        assert!(matches!(classify(restart, &correlator), Route::Push(_)));

        let mut late = Frame::request("players/sign-in", "expired-ref", Value::Null);
        late.status = Some(Status::Success);
        assert!(matches!(classify(late, &correlator), Route::Late(_)));

        let push = Frame::push("channels/broadcast", json!({}));
        assert!(matches!(classify(push, &correlator), Route::Push(_)));
    }
}
