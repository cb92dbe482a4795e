//! In-process event bus.
//!
//! Listeners run synchronously in registration order. A listener that
//! returns an error or panics is logged and skipped; the emitter never sees
//! it. Listeners with async work spawn it with [`spawn_detached`].

use eyre::eyre;
use hive_core::events::EngineEvent;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::warn;

/// Receives engine events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent) -> eyre::Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&EngineEvent) -> eyre::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) -> eyre::Result<()> {
        self(event)
    }
}

type Entry = (u64, Arc<dyn EventListener>);

#[derive(Default)]
struct BusInner {
    listeners: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle to a shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned handle's
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe(&self, listener: impl EventListener + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver `event` to every listener.
    pub fn emit(&self, event: &EngineEvent) {
        // Snapshot so listeners may subscribe or unsubscribe while handling.
        let listeners: Vec<Entry> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = id, event = event.event.as_str(), error = %e, "event listener failed");
                }
                Err(_) => {
                    warn!(listener = id, event = event.event.as_str(), "event listener panicked");
                }
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    /// Remove the listener. No-op if the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Spawn `fut` on the current tokio runtime without awaiting it.
pub fn spawn_detached<F>(fut: F) -> eyre::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| eyre!("no tokio runtime for listener task: {e}"))?;
    handle.spawn(fut);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::events::EventType;
    use hive_core::Id;
    use std::sync::Mutex;

    fn event() -> EngineEvent {
        EngineEvent::new(EventType::StepPending, Id::from_string("run-1"), "wf")
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_: &EngineEvent| -> eyre::Result<()> {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }
        bus.emit(&event());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_listener_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        bus.subscribe(|_: &EngineEvent| -> eyre::Result<()> { Err(eyre!("boom")) });
        bus.subscribe(|_: &EngineEvent| -> eyre::Result<()> { panic!("listener panic") });
        let counter = Arc::clone(&seen);
        bus.subscribe(move |_: &EngineEvent| -> eyre::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        bus.emit(&event());
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        let sub = bus.subscribe(move |_: &EngineEvent| -> eyre::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        bus.emit(&event());
        sub.unsubscribe();
        bus.emit(&event());
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn spawn_detached_requires_runtime() {
        assert!(spawn_detached(async {}).is_err());
    }
}
