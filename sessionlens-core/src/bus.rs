//! Multicast event bus fanning telemetry out to sinks and observers
//!
//! Sinks run synchronously, in registration order, inside [`EventBus::emit`].
//! Observers are deferred: each emit that finds at least one observer spawns
//! a single task that calls every observer registered at the time the task
//! runs. On tokio's current-thread scheduler spawned tasks run FIFO, so
//! observer callbacks for distinct emits arrive in emit order; that ordering
//! is a property of the scheduler, not something the bus enforces. On the
//! multi-thread scheduler observer tasks may interleave in any order.
//!
//! Without a tokio runtime there is nothing to defer to, and observers are
//! called inline right after the sinks.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::types::LogLevel;

/// Event delivered to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub namespace: String,
    pub level: LogLevel,
    pub payload: Value,
}

/// Synchronous subscriber
pub trait LogSink: Send + Sync {
    fn emit(&self, namespace: &str, level: LogLevel, payload: &Value);
}

/// Mirrors bus traffic into `tracing` under the `sessionlens::bus` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, namespace: &str, level: LogLevel, payload: &Value) {
        let tag = namespace.to_uppercase();
        match level {
            LogLevel::Error => tracing::error!(target: "sessionlens::bus", "[{}] {}", tag, payload),
            LogLevel::Warn => tracing::warn!(target: "sessionlens::bus", "[{}] {}", tag, payload),
            LogLevel::Debug => tracing::debug!(target: "sessionlens::bus", "[{}] {}", tag, payload),
            LogLevel::Trace => tracing::trace!(target: "sessionlens::bus", "[{}] {}", tag, payload),
            LogLevel::Log | LogLevel::Info => {
                tracing::info!(target: "sessionlens::bus", "[{}] {}", tag, payload)
            }
        }
    }
}

type Observer = Arc<dyn Fn(&BusEvent) + Send + Sync>;
type ObserverList = RwLock<Vec<(u64, Observer)>>;

/// Publish/subscribe channel shared by every capture channel
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn LogSink>>>,
    observers: Arc<ObserverList>,
    next_observer: AtomicU64,
}

impl EventBus {
    /// Bus with the [`TracingSink`] mirror already registered
    pub fn new() -> Self {
        let bus = Self::empty();
        bus.use_sink(Arc::new(TracingSink));
        bus
    }

    /// Bus with no sinks
    pub fn empty() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            observers: Arc::new(RwLock::new(Vec::new())),
            next_observer: AtomicU64::new(0),
        }
    }

    /// Register a synchronous sink. Registering the same sink twice is a no-op.
    pub fn use_sink(&self, sink: Arc<dyn LogSink>) {
        let mut sinks = self.sinks.write();
        if !sinks.iter().any(|existing| Arc::ptr_eq(existing, &sink)) {
            sinks.push(sink);
        }
    }

    /// Register an observer; keep the returned handle to unsubscribe later
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, Arc::new(observer)));
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Fan an event out to sinks now and to observers on the next task turn
    pub fn emit(&self, namespace: &str, level: LogLevel, payload: Value) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            let delivered = catch_unwind(AssertUnwindSafe(|| sink.emit(namespace, level, &payload)));
            if delivered.is_err() {
                tracing::warn!(namespace, "bus sink panicked; event skipped for that sink");
            }
        }

        if self.observers.read().is_empty() {
            return;
        }

        let event = BusEvent {
            namespace: namespace.to_string(),
            level,
            payload,
        };
        let observers = self.observers.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { notify_observers(&observers, &event) });
            }
            Err(_) => notify_observers(&observers, &event),
        }
    }

    /// Serialize `payload` and emit it; values that fail to serialize are dropped
    pub fn publish<T: Serialize>(&self, namespace: &str, level: LogLevel, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit(namespace, level, value),
            Err(e) => tracing::warn!(namespace, error = %e, "failed to serialize bus payload"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.read().len())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

fn notify_observers(observers: &ObserverList, event: &BusEvent) {
    let current: Vec<Observer> = observers
        .read()
        .iter()
        .map(|(_, observer)| observer.clone())
        .collect();
    for observer in current {
        if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
            tracing::warn!(namespace = %event.namespace, "bus observer panicked");
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    observers: Weak<ObserverList>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the observer. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(observers) = self.observers.upgrade() else {
            return false;
        };
        let mut observers = observers.write();
        let before = observers.len();
        observers.retain(|(id, _)| *id != self.id);
        observers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(String, LogLevel, Value)>>,
    }

    impl LogSink for Collect {
        fn emit(&self, namespace: &str, level: LogLevel, payload: &Value) {
            self.seen
                .lock()
                .push((namespace.to_string(), level, payload.clone()));
        }
    }

    struct Explode;

    impl LogSink for Explode {
        fn emit(&self, _: &str, _: LogLevel, _: &Value) {
            panic!("sink failure");
        }
    }

    #[test]
    fn test_sinks_run_synchronously_in_order() {
        let bus = EventBus::empty();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl LogSink for Tagged {
            fn emit(&self, _: &str, _: LogLevel, _: &Value) {
                self.1.lock().push(self.0);
            }
        }

        bus.use_sink(Arc::new(Tagged("first", order.clone())));
        bus.use_sink(Arc::new(Tagged("second", order.clone())));
        bus.emit("console", LogLevel::Info, json!("hello"));

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_same_sink_registered_once() {
        let bus = EventBus::empty();
        let sink = Arc::new(Collect::default());
        bus.use_sink(sink.clone());
        bus.use_sink(sink.clone());
        bus.emit("dom", LogLevel::Info, json!(1));
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[test]
    fn test_panicking_sink_does_not_reach_caller() {
        let bus = EventBus::empty();
        let after = Arc::new(Collect::default());
        bus.use_sink(Arc::new(Explode));
        bus.use_sink(after.clone());

        bus.emit("network", LogLevel::Error, json!({"status": 500}));

        assert_eq!(after.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_observers_are_deferred() {
        let bus = EventBus::empty();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(move |event| seen_clone.lock().push(event.clone()));

        bus.emit("console", LogLevel::Warn, json!("low disk"));
        assert!(seen.lock().is_empty());

        tokio::task::yield_now().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].namespace, "console");
        assert_eq!(seen[0].level, LogLevel::Warn);
        assert_eq!(seen[0].payload, json!("low disk"));
    }

    #[tokio::test]
    async fn test_observer_delivery_follows_emit_order() {
        let bus = EventBus::empty();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(move |event| seen_clone.lock().push(event.payload.clone()));

        for i in 0..5 {
            bus.emit("dom", LogLevel::Info, json!(i));
        }
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(*seen.lock(), vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::empty();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        let sub = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.clone().unsubscribe());
        assert!(!sub.unsubscribe());
        assert_eq!(bus.observer_count(), 0);

        bus.emit("rrweb", LogLevel::Info, json!({}));
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_observers_inline_without_runtime() {
        let bus = EventBus::empty();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        let _sub = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("session", LogLevel::Info, json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
