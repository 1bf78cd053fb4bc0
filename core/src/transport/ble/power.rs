/// Power-On Agent
///
/// Drives the adapter from whatever state it is in to `PoweredOn`, resolving a
/// single result. Many connection attempts can share one agent; each
/// `power_on` call is independent and registers its own listener.

use crate::sync::Completion;
use crate::transport::abstraction::{AdapterDelegate, AdapterState, RadioAdapter};
use crate::transport::multiplexer::{DelegateMultiplexer, RegistrationToken};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors for adapter power-up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowerError {
    #[error("Could not power on adapter")]
    CouldNotPowerOnAdapter,
}

/// Listener registered for the duration of one `power_on` call
struct PowerListener {
    completion: Completion<(), PowerError>,
    multiplexer: Arc<DelegateMultiplexer>,
    token: Mutex<Option<RegistrationToken>>,
}

impl PowerListener {
    fn resolve(&self, result: Result<(), PowerError>) -> bool {
        self.completion.resolve_with(result, || {
            if let Some(token) = self.token.lock().take() {
                self.multiplexer.deregister(token);
            }
        })
    }
}

impl AdapterDelegate for PowerListener {
    fn on_state_changed(&self, state: AdapterState) {
        match state {
            AdapterState::PoweredOn => {
                self.resolve(Ok(()));
            }
            state if state.is_transient() => {
                debug!("Adapter {} while powering on, still waiting", state);
            }
            state => {
                if self.resolve(Err(PowerError::CouldNotPowerOnAdapter)) {
                    warn!("Adapter settled on {} while powering on", state);
                }
            }
        }
    }
}

/// Resolves the listener if the `power_on` future is dropped early
struct AbandonOnDrop(Arc<PowerListener>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.0.resolve(Err(PowerError::CouldNotPowerOnAdapter)) {
            debug!("Power-on abandoned by caller");
        }
    }
}

/// Brings the shared radio adapter to `PoweredOn`
#[derive(Clone)]
pub struct PowerOnAgent {
    adapter: Arc<dyn RadioAdapter>,
    multiplexer: Arc<DelegateMultiplexer>,
}

impl PowerOnAgent {
    pub fn new(adapter: Arc<dyn RadioAdapter>, multiplexer: Arc<DelegateMultiplexer>) -> Self {
        Self {
            adapter,
            multiplexer,
        }
    }

    /// Power the adapter on
    ///
    /// Returns immediately, without registering anything, if the adapter is
    /// already powered on. Fails at once if the adapter is unsupported or
    /// unauthorized. Otherwise asks the adapter to enable and waits for a
    /// terminal state change.
    pub async fn power_on(&self) -> Result<(), PowerError> {
        if self.adapter.state() == AdapterState::PoweredOn {
            return Ok(());
        }

        let (completion, receiver) = Completion::new();
        let listener = Arc::new(PowerListener {
            completion,
            multiplexer: self.multiplexer.clone(),
            token: Mutex::new(None),
        });
        let _abandon = AbandonOnDrop(listener.clone());

        {
            let mut token = listener.token.lock();
            *token = Some(self.multiplexer.register("power-on", listener.clone()));
        }

        // The adapter may have changed between the first check and registration
        match self.adapter.state() {
            AdapterState::PoweredOn => {
                listener.resolve(Ok(()));
            }
            state @ (AdapterState::Unsupported | AdapterState::Unauthorized) => {
                // No state change will ever follow
                if listener.resolve(Err(PowerError::CouldNotPowerOnAdapter)) {
                    warn!("Adapter is {}, cannot power on", state);
                }
            }
            state => {
                debug!("Enabling adapter (state {})", state);
                self.adapter.enable();
            }
        }

        let result = receiver
            .await
            .unwrap_or(Err(PowerError::CouldNotPowerOnAdapter));
        if result.is_ok() {
            info!("Adapter powered on");
        }
        result
    }
}
