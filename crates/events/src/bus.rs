//! Subscription registry and dispatch

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use crate::types::{Envelope, EventKind};

/// A consumer of dispatched envelopes
pub trait Handler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self(envelope)
    }
}

/// Shared handler reference. Identity (for duplicate suppression and
/// `unsubscribe`) is the allocation, so keep a clone to unsubscribe later.
pub type HandlerRef = Arc<dyn Handler>;

/// Wrap a closure as a [`HandlerRef`]
pub fn handler<F>(f: F) -> HandlerRef
where
    F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_handler(a: &HandlerRef, b: &HandlerRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Clone)]
struct Entry {
    id: u64,
    handler: HandlerRef,
}

#[derive(Default)]
struct Registry {
    handlers: Mutex<HashMap<EventKind, Vec<Entry>>>,
    next_id: AtomicU64,
    dispatched: AtomicUsize,
    handler_failures: AtomicUsize,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Entry>>> {
        // handlers never run under the lock, so a poisoned map is still consistent
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_id(&self, kind: &EventKind, id: u64) -> bool {
        let mut handlers = self.lock();
        let Some(entries) = handlers.get_mut(kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(kind);
        }
        removed
    }
}

/// Outcome of a single [`EventBus::dispatch`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that completed successfully
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

/// Cancellation handle returned by [`EventBus::subscribe`].
///
/// Dropping it leaves the handler registered; call [`Subscription::cancel`]
/// to remove it.
#[derive(Debug)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn cancel(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove_id(&self.kind, self.id),
            None => false,
        }
    }
}

/// Typed publish/subscribe registry.
///
/// Handlers are kept per [`EventKind`] in registration order. Cloning the bus
/// shares the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    ///
    /// Subscribing a handler that is already registered for `kind` is a
    /// no-op and returns a handle to the existing registration.
    pub fn subscribe(&self, kind: impl Into<EventKind>, handler: HandlerRef) -> Subscription {
        let kind = kind.into();
        let mut handlers = self.registry.lock();
        let entries = handlers.entry(kind.clone()).or_default();

        let id = match entries.iter().find(|entry| same_handler(&entry.handler, &handler)) {
            Some(existing) => {
                debug!(kind = %kind, "Handler already subscribed");
                existing.id
            }
            None => {
                let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
                entries.push(Entry { id, handler });
                id
            }
        };

        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Register a closure for `kind`
    pub fn on<F>(&self, kind: impl Into<EventKind>, f: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(kind, handler(f))
    }

    /// Remove `handler` from `kind`. Returns false if it was not registered.
    pub fn unsubscribe(&self, kind: &EventKind, handler: &HandlerRef) -> bool {
        let mut handlers = self.registry.lock();
        let Some(entries) = handlers.get_mut(kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| !same_handler(&entry.handler, handler));
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(kind);
        }
        removed
    }

    /// Invoke every handler registered for `envelope.kind`, in registration
    /// order.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe while the dispatch is running; changes apply to the next
    /// dispatch. A handler that errors or panics is logged and counted, the
    /// remaining handlers still run and it stays registered.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        self.registry.dispatched.fetch_add(1, Ordering::Relaxed);

        let snapshot = match self.registry.lock().get(&envelope.kind) {
            Some(entries) => entries.clone(),
            None => {
                debug!(kind = %envelope.kind, id = %envelope.id, "No handlers for event");
                return DispatchReport::default();
            }
        };

        let mut report = DispatchReport::default();
        for entry in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.handler.handle(envelope)));
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(kind = %envelope.kind, id = %envelope.id, error = %e, "Event handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    warn!(
                        kind = %envelope.kind,
                        id = %envelope.id,
                        panic = panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }

        if report.failed > 0 {
            self.registry
                .handler_failures
                .fetch_add(report.failed, Ordering::Relaxed);
        }
        report
    }

    /// Remove every handler of every kind
    pub fn clear(&self) {
        self.registry.lock().clear();
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: &EventKind) -> usize {
        self.registry.lock().get(kind).map_or(0, Vec::len)
    }

    /// Total number of envelopes dispatched
    pub fn dispatch_count(&self) -> usize {
        self.registry.dispatched.load(Ordering::Relaxed)
    }

    /// Total number of handler invocations that failed
    pub fn handler_failure_count(&self) -> usize {
        self.registry.handler_failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("kinds", &self.registry.lock().len())
            .field("dispatch_count", &self.dispatch_count())
            .field("handler_failure_count", &self.handler_failure_count())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
