/// Connection Agent
///
/// Drives one connect attempt for one device: scan if the radio address is
/// unknown, connect, and resolve exactly once on success, failure or timeout.
/// Every resolution path cancels the timer, deregisters from the multiplexer
/// and stops the shared scan.
///
/// An agent is consumed by [`ConnectionAgent::connect`]. Concurrent connects
/// to different devices use independent agents.

use crate::device::DeviceIdentity;
use crate::sync::{Completion, TimerHandle};
use crate::transport::abstraction::{AdapterDelegate, Advertisement, PeripheralId, RadioAdapter};
use crate::transport::multiplexer::{DelegateMultiplexer, RegistrationToken};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Connect timeout used when the caller does not give one
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors for a connect attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection timed out")]
    TimedOut,
    #[error("Not connected")]
    NotConnected,
}

/// Listener registered for the duration of one connect attempt
struct ConnectListener {
    device: Arc<DeviceIdentity>,
    adapter: Arc<dyn RadioAdapter>,
    multiplexer: Arc<DelegateMultiplexer>,
    completion: Completion<(), ConnectionError>,
    token: Mutex<Option<RegistrationToken>>,
    timer: Mutex<Option<TimerHandle>>,
    /// Serializes adapter events, the timer and radio commands for this
    /// attempt. Reentrant: adapters may call back from inside `connect`.
    events: ReentrantMutex<()>,
}

impl ConnectListener {
    fn resolve(&self, result: Result<(), ConnectionError>) -> bool {
        let _serial = self.events.lock();
        self.completion.resolve_with(result, || self.release())
    }

    /// Issue `command` only while the attempt is still pending
    fn while_pending(&self, command: impl FnOnce()) -> bool {
        let _serial = self.events.lock();
        if self.completion.is_resolved() {
            return false;
        }
        command();
        true
    }

    /// Runs once, on the winning resolution
    fn release(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        if let Some(token) = self.token.lock().take() {
            self.multiplexer.deregister(token);
        }
        // Scanning is adapter-wide; stopping is idempotent even if we never scanned
        self.adapter.stop_scan();
    }

    fn arm_timer(self: &Arc<Self>, after: Duration) {
        let listener: Weak<Self> = Arc::downgrade(self);
        let timer = TimerHandle::schedule(after, move || {
            if let Some(listener) = listener.upgrade() {
                if listener.resolve(Err(ConnectionError::TimedOut)) {
                    warn!("Connect to {} timed out after {:?}", listener.device.id(), after);
                }
            }
        });

        let mut slot = self.timer.lock();
        if self.completion.is_resolved() {
            timer.cancel();
        } else {
            *slot = Some(timer);
        }
    }

    /// Event concerns the peripheral this attempt is bound to
    fn owns(&self, peripheral: PeripheralId) -> bool {
        self.device.peripheral() == Some(peripheral)
    }
}

impl AdapterDelegate for ConnectListener {
    fn on_located(&self, advertisement: &Advertisement) {
        if !self.device.matches(advertisement) {
            return;
        }
        self.while_pending(|| {
            if self.device.bind_if_unbound(advertisement.peripheral) {
                debug!(
                    "Located {} as {}, connecting",
                    self.device.id(),
                    advertisement.peripheral
                );
                self.adapter.connect(advertisement.peripheral);
            }
        });
    }

    fn on_connected(&self, peripheral: PeripheralId) {
        if self.owns(peripheral) {
            self.resolve(Ok(()));
        }
    }

    fn on_could_not_connect(&self, peripheral: PeripheralId) {
        if self.owns(peripheral) && self.resolve(Err(ConnectionError::NotConnected)) {
            warn!("Could not connect to {} ({})", self.device.id(), peripheral);
        }
    }

    fn on_timeout(&self) {
        // Only meaningful while still looking for the device
        if !self.device.is_bound() && self.resolve(Err(ConnectionError::TimedOut)) {
            warn!("Scan for {} timed out", self.device.id());
        }
    }
}

/// Resolves the listener if the `connect` future is dropped early
struct AbandonOnDrop(Arc<ConnectListener>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.0.resolve(Err(ConnectionError::NotConnected)) {
            debug!("Connect to {} abandoned by caller", self.0.device.id());
        }
    }
}

/// One connect attempt against the shared radio adapter
pub struct ConnectionAgent {
    adapter: Arc<dyn RadioAdapter>,
    multiplexer: Arc<DelegateMultiplexer>,
    device: Arc<DeviceIdentity>,
    default_timeout: Duration,
}

impl ConnectionAgent {
    pub fn new(
        adapter: Arc<dyn RadioAdapter>,
        multiplexer: Arc<DelegateMultiplexer>,
        device: Arc<DeviceIdentity>,
    ) -> Self {
        Self {
            adapter,
            multiplexer,
            device,
            default_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Timeout applied when `connect` is called without one
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Connect to the device
    ///
    /// Succeeds at once, without touching the adapter, if the device is
    /// already connected or connecting. The adapter should be powered on
    /// before calling this.
    pub async fn connect(self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        let timeout = timeout.unwrap_or(self.default_timeout);

        if let Some(peripheral) = self.device.peripheral() {
            let state = self.adapter.peripheral_state(peripheral);
            if state.is_linked_or_linking() {
                debug!("{} already {:?}", self.device.id(), state);
                return Ok(());
            }
        }

        let (completion, receiver) = Completion::new();
        let listener = Arc::new(ConnectListener {
            device: self.device.clone(),
            adapter: self.adapter.clone(),
            multiplexer: self.multiplexer.clone(),
            completion,
            token: Mutex::new(None),
            timer: Mutex::new(None),
            events: ReentrantMutex::new(()),
        });
        let _abandon = AbandonOnDrop(listener.clone());

        {
            let mut token = listener.token.lock();
            *token = Some(
                self.multiplexer
                    .register(format!("connect:{}", self.device.id()), listener.clone()),
            );
        }

        if timeout.is_zero() {
            listener.resolve(Err(ConnectionError::TimedOut));
        } else {
            listener.arm_timer(timeout);
            listener.while_pending(|| match self.device.peripheral() {
                Some(peripheral) => {
                    debug!("Connecting to {} at {}", self.device.id(), peripheral);
                    self.adapter.connect(peripheral);
                }
                None => {
                    debug!(
                        "Scanning for {} ({})",
                        self.device.id(),
                        self.device.signature()
                    );
                    self.adapter.scan();
                }
            });
        }

        let result = receiver
            .await
            .unwrap_or(Err(ConnectionError::NotConnected));
        match &result {
            Ok(()) => info!("Connected to {}", self.device.id()),
            Err(e) => warn!("Connect to {} failed: {}", self.device.id(), e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, DeviceSignature};
    use crate::transport::abstraction::{AdapterState, MockRadioAdapter, PeripheralState};
    use crate::transport::fake::{AdapterCall, FakeRadioAdapter};
    use uuid::Uuid;

    struct Harness {
        adapter: Arc<FakeRadioAdapter>,
        multiplexer: Arc<DelegateMultiplexer>,
    }

    impl Harness {
        fn new() -> Self {
            let adapter = Arc::new(FakeRadioAdapter::new(AdapterState::PoweredOn));
            let multiplexer = Arc::new(DelegateMultiplexer::new());
            adapter.set_delegate(multiplexer.clone());
            Self {
                adapter,
                multiplexer,
            }
        }

        fn agent(&self, device: &Arc<DeviceIdentity>) -> ConnectionAgent {
            ConnectionAgent::new(self.adapter.clone(), self.multiplexer.clone(), device.clone())
        }

        async fn wait_for_listeners(&self, count: usize) {
            while self.multiplexer.listener_count() != count {
                tokio::task::yield_now().await;
            }
        }
    }

    fn unbound_device(major: u16, minor: u16) -> Arc<DeviceIdentity> {
        Arc::new(DeviceIdentity::new(
            DeviceId::new(format!("tag-{}-{}", major, minor)),
            DeviceSignature::major_minor(major, minor),
        ))
    }

    /// Listener driven directly, without an agent or multiplexer around it
    fn detached_listener(
        adapter: &Arc<FakeRadioAdapter>,
        device: &Arc<DeviceIdentity>,
    ) -> (
        Arc<ConnectListener>,
        tokio::sync::oneshot::Receiver<Result<(), ConnectionError>>,
    ) {
        let (completion, receiver) = Completion::new();
        let listener = Arc::new(ConnectListener {
            device: device.clone(),
            adapter: adapter.clone(),
            multiplexer: Arc::new(DelegateMultiplexer::new()),
            completion,
            token: Mutex::new(None),
            timer: Mutex::new(None),
            events: ReentrantMutex::new(()),
        });
        (listener, receiver)
    }

    fn advertisement_for(major: u16, minor: u16, peripheral: PeripheralId) -> Advertisement {
        let mut bytes = [0u8; 16];
        bytes[..2].copy_from_slice(&major.to_be_bytes());
        bytes[2..4].copy_from_slice(&minor.to_be_bytes());
        Advertisement::new(peripheral).with_service_uuid(Uuid::from_bytes(bytes))
    }

    #[tokio::test]
    async fn test_already_connected_touches_nothing() {
        let peripheral = PeripheralId::random();
        let mut adapter = MockRadioAdapter::new();
        adapter
            .expect_peripheral_state()
            .returning(|_| PeripheralState::Connected);
        adapter.expect_scan().never();
        adapter.expect_connect().never();
        adapter.expect_stop_scan().never();

        let multiplexer = Arc::new(DelegateMultiplexer::new());
        let device = Arc::new(DeviceIdentity::with_peripheral(
            DeviceId::new("tag-1"),
            DeviceSignature::major_minor(1, 1),
            peripheral,
        ));
        let agent = ConnectionAgent::new(Arc::new(adapter), multiplexer.clone(), device);

        assert_eq!(agent.connect(None).await, Ok(()));
        assert_eq!(multiplexer.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_connecting_state_is_success() {
        let harness = Harness::new();
        let peripheral = PeripheralId::random();
        harness
            .adapter
            .set_peripheral_state(peripheral, PeripheralState::Connecting);
        let device = Arc::new(DeviceIdentity::with_peripheral(
            DeviceId::new("tag-1"),
            DeviceSignature::major_minor(1, 1),
            peripheral,
        ));

        assert_eq!(harness.agent(&device).connect(None).await, Ok(()));
        assert!(harness.adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_known_address_connects_directly() {
        let harness = Harness::new();
        let peripheral = PeripheralId::random();
        let device = Arc::new(DeviceIdentity::with_peripheral(
            DeviceId::new("tag-1"),
            DeviceSignature::major_minor(1, 1),
            peripheral,
        ));

        let task = tokio::spawn(harness.agent(&device).connect(None));
        harness.wait_for_listeners(1).await;

        assert_eq!(harness.adapter.calls(), vec![AdapterCall::Connect(peripheral)]);
        harness.adapter.emit_connected(peripheral);

        assert_eq!(task.await.expect("join"), Ok(()));
        assert_eq!(harness.multiplexer.listener_count(), 0);
        assert_eq!(harness.adapter.count(AdapterCall::Scan), 0);
        assert_eq!(harness.adapter.count(AdapterCall::StopScan), 1);
    }

    #[tokio::test]
    async fn test_unknown_address_scans_then_binds() {
        let harness = Harness::new();
        let device = unbound_device(7, 42);
        let peripheral = PeripheralId::random();

        let task = tokio::spawn(harness.agent(&device).connect(None));
        harness.wait_for_listeners(1).await;
        assert_eq!(harness.adapter.calls(), vec![AdapterCall::Scan]);

        // Someone else's advertisement
        harness
            .adapter
            .emit_located(advertisement_for(7, 43, PeripheralId::random()));
        assert!(!device.is_bound());

        harness
            .adapter
            .emit_located(advertisement_for(7, 42, peripheral));
        assert_eq!(device.peripheral(), Some(peripheral));
        assert_eq!(harness.adapter.count(AdapterCall::Connect(peripheral)), 1);

        // A repeated advertisement does not trigger a second connect
        harness
            .adapter
            .emit_located(advertisement_for(7, 42, peripheral));
        assert_eq!(harness.adapter.count(AdapterCall::Connect(peripheral)), 1);

        harness.adapter.emit_connected(peripheral);
        assert_eq!(task.await.expect("join"), Ok(()));
        assert_eq!(harness.adapter.calls().last(), Some(&AdapterCall::StopScan));
        assert_eq!(harness.multiplexer.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_could_not_connect_fails() {
        let harness = Harness::new();
        let peripheral = PeripheralId::random();
        let device = Arc::new(DeviceIdentity::with_peripheral(
            DeviceId::new("tag-1"),
            DeviceSignature::major_minor(1, 1),
            peripheral,
        ));

        let task = tokio::spawn(harness.agent(&device).connect(None));
        harness.wait_for_listeners(1).await;

        harness.adapter.emit_could_not_connect(PeripheralId::random());
        assert_eq!(harness.multiplexer.listener_count(), 1);

        harness.adapter.emit_could_not_connect(peripheral);
        assert_eq!(
            task.await.expect("join"),
            Err(ConnectionError::NotConnected)
        );
        assert_eq!(harness.multiplexer.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_and_late_success_is_ignored() {
        let harness = Harness::new();
        let device = unbound_device(1, 2);

        let result = harness
            .agent(&device)
            .connect(Some(Duration::from_secs(30)))
            .await;

        assert_eq!(result, Err(ConnectionError::TimedOut));
        assert_eq!(harness.multiplexer.listener_count(), 0);
        assert_eq!(harness.adapter.count(AdapterCall::StopScan), 1);

        // Late events find no listener
        let peripheral = PeripheralId::random();
        harness
            .adapter
            .emit_located(advertisement_for(1, 2, peripheral));
        harness.adapter.emit_connected(peripheral);
        assert!(!device.is_bound());
        assert_eq!(harness.adapter.count(AdapterCall::Connect(peripheral)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_from_builder() {
        let harness = Harness::new();
        let device = unbound_device(1, 3);

        let started = tokio::time::Instant::now();
        let result = harness
            .agent(&device)
            .with_default_timeout(Duration::from_secs(5))
            .connect(None)
            .await;

        assert_eq!(result, Err(ConnectionError::TimedOut));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_zero_timeout_resolves_timed_out_without_radio_work() {
        let harness = Harness::new();
        harness.adapter.set_auto_connect(true);
        let peripheral = PeripheralId::random();
        let device = Arc::new(DeviceIdentity::with_peripheral(
            DeviceId::new("tag-1"),
            DeviceSignature::major_minor(1, 1),
            peripheral,
        ));

        let result = harness.agent(&device).connect(Some(Duration::ZERO)).await;

        assert_eq!(result, Err(ConnectionError::TimedOut));
        assert_eq!(harness.adapter.count(AdapterCall::Connect(peripheral)), 0);
        assert_eq!(harness.multiplexer.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_success_cancels_timer() {
        let harness = Harness::new();
        harness.adapter.set_auto_connect(true);
        let device = Arc::new(DeviceIdentity::with_peripheral(
            DeviceId::new("tag-1"),
            DeviceSignature::major_minor(1, 1),
            PeripheralId::random(),
        ));

        let result = harness
            .agent(&device)
            .connect(Some(Duration::from_millis(50)))
            .await;
        assert_eq!(result, Ok(()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.adapter.count(AdapterCall::StopScan), 1);
    }

    #[tokio::test]
    async fn test_adapter_timeout_while_scanning() {
        let harness = Harness::new();
        let device = unbound_device(3, 3);

        let task = tokio::spawn(harness.agent(&device).connect(None));
        harness.wait_for_listeners(1).await;

        harness.adapter.emit_timeout();
        assert_eq!(task.await.expect("join"), Err(ConnectionError::TimedOut));
        assert_eq!(harness.multiplexer.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_adapter_timeout_ignored_once_bound() {
        let harness = Harness::new();
        let peripheral = PeripheralId::random();
        let device = Arc::new(DeviceIdentity::with_peripheral(
            DeviceId::new("tag-1"),
            DeviceSignature::major_minor(1, 1),
            peripheral,
        ));

        let task = tokio::spawn(harness.agent(&device).connect(None));
        harness.wait_for_listeners(1).await;

        harness.adapter.emit_timeout();
        assert_eq!(harness.multiplexer.listener_count(), 1);

        harness.adapter.emit_connected(peripheral);
        assert_eq!(task.await.expect("join"), Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_connect_cleans_up() {
        let harness = Harness::new();
        let device = unbound_device(4, 4);

        let task = tokio::spawn(harness.agent(&device).connect(None));
        harness.wait_for_listeners(1).await;

        task.abort();
        let _ = task.await;

        assert_eq!(harness.multiplexer.listener_count(), 0);
        assert_eq!(harness.adapter.count(AdapterCall::StopScan), 1);
    }

    #[test]
    fn test_located_after_resolution_does_not_bind() {
        let adapter = Arc::new(FakeRadioAdapter::new(AdapterState::PoweredOn));
        let device = unbound_device(8, 8);
        let (listener, mut receiver) = detached_listener(&adapter, &device);

        assert!(listener.resolve(Err(ConnectionError::TimedOut)));
        let peripheral = PeripheralId::random();
        listener.on_located(&advertisement_for(8, 8, peripheral));

        assert!(!device.is_bound());
        assert_eq!(adapter.count(AdapterCall::Connect(peripheral)), 0);
        assert_eq!(receiver.try_recv(), Ok(Err(ConnectionError::TimedOut)));
    }

    #[test]
    fn test_timeout_waits_for_in_flight_event() {
        let adapter = Arc::new(FakeRadioAdapter::new(AdapterState::PoweredOn));
        let device = unbound_device(9, 9);
        let (listener, mut receiver) = detached_listener(&adapter, &device);
        let peripheral = PeripheralId::random();

        let serial = listener.events.lock();
        let timer = std::thread::spawn({
            let listener = listener.clone();
            move || listener.resolve(Err(ConnectionError::TimedOut))
        });

        // The other thread cannot resolve while this event is being handled
        listener.on_located(&advertisement_for(9, 9, peripheral));
        assert_eq!(device.peripheral(), Some(peripheral));
        assert!(!listener.completion.is_resolved());
        drop(serial);

        assert!(timer.join().expect("join"));
        assert_eq!(
            adapter.calls(),
            vec![AdapterCall::Connect(peripheral), AdapterCall::StopScan]
        );
        assert_eq!(receiver.try_recv(), Ok(Err(ConnectionError::TimedOut)));
    }
}
