//! Delegate Multiplexer: fans radio adapter events out to many listeners
//!
//! The radio adapter holds a single delegate. The multiplexer is that
//! delegate and forwards every event to every registered listener; each
//! listener decides on its own whether an event concerns it.

use crate::transport::abstraction::{AdapterDelegate, AdapterState, Advertisement, PeripheralId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Opaque handle returned by [`DelegateMultiplexer::register`]
///
/// Tokens are never reused within a multiplexer, so two registrations can
/// never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationToken(u64);

impl fmt::Display for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Registration {
    label: String,
    listener: Arc<dyn AdapterDelegate>,
}

/// Registry of live adapter listeners
pub struct DelegateMultiplexer {
    /// Ordered by token, which is registration order
    listeners: RwLock<BTreeMap<RegistrationToken, Registration>>,
    next_token: AtomicU64,
}

impl DelegateMultiplexer {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a listener. `label` only shows up in logs.
    pub fn register(
        &self,
        label: impl Into<String>,
        listener: Arc<dyn AdapterDelegate>,
    ) -> RegistrationToken {
        let token = RegistrationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let label = label.into();
        debug!("Listener registered: {} ({})", token, label);
        self.listeners
            .write()
            .insert(token, Registration { label, listener });
        token
    }

    /// Remove a listener. Returns false if the token was not registered.
    pub fn deregister(&self, token: RegistrationToken) -> bool {
        match self.listeners.write().remove(&token) {
            Some(registration) => {
                debug!("Listener deregistered: {} ({})", token, registration.label);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, token: RegistrationToken) -> bool {
        self.listeners.read().contains_key(&token)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Labels of the live listeners, in registration order
    pub fn labels(&self) -> Vec<String> {
        self.listeners
            .read()
            .values()
            .map(|registration| registration.label.clone())
            .collect()
    }

    /// Copy of the listener list so callbacks run without the registry lock.
    /// Listeners may deregister themselves (or others) from inside a callback.
    fn snapshot(&self) -> Vec<Arc<dyn AdapterDelegate>> {
        self.listeners
            .read()
            .values()
            .map(|registration| registration.listener.clone())
            .collect()
    }
}

impl Default for DelegateMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterDelegate for DelegateMultiplexer {
    fn on_located(&self, advertisement: &Advertisement) {
        for listener in self.snapshot() {
            listener.on_located(advertisement);
        }
    }

    fn on_connected(&self, peripheral: PeripheralId) {
        debug!("Fan-out: connected {}", peripheral);
        for listener in self.snapshot() {
            listener.on_connected(peripheral);
        }
    }

    fn on_could_not_connect(&self, peripheral: PeripheralId) {
        debug!("Fan-out: could not connect {}", peripheral);
        for listener in self.snapshot() {
            listener.on_could_not_connect(peripheral);
        }
    }

    fn on_disconnected(&self, peripheral: PeripheralId) {
        debug!("Fan-out: disconnected {}", peripheral);
        for listener in self.snapshot() {
            listener.on_disconnected(peripheral);
        }
    }

    fn on_state_changed(&self, state: AdapterState) {
        debug!("Fan-out: adapter state {}", state);
        for listener in self.snapshot() {
            listener.on_state_changed(state);
        }
    }

    fn on_timeout(&self) {
        debug!("Fan-out: adapter timeout");
        for listener in self.snapshot() {
            listener.on_timeout();
        }
    }
}
