use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, WearableError},
    service::WearableService,
    subscription::Subscription,
    types::{
        ConnectionStatus, ControllerConfig, Device, DeviceFilter, FitnessData, FitnessGoals,
        UserProfile,
    },
};

/// Stateful façade over a [`WearableService`]
///
/// `ConnectivityController` turns transport operations into a connection
/// lifecycle with a single observable [`ConnectionStatus`], collects decoded
/// samples into an append-only sequence and guarantees cleanup when the
/// consumer loses interest.
///
/// # Lifecycle
///
/// - `Idle → Searching → Idle` around [`request_device`](Self::request_device)
/// - `Idle → Connecting → Connected` or `→ Error` around [`connect`](Self::connect)
/// - `Connected → Disconnected → Idle` on [`disconnect`](Self::disconnect) or
///   when the hardware drops the session
/// - `Error → Idle` on [`clear_error`](Self::clear_error)
///
/// Overlapping operations are rejected, never queued. Only one device may
/// hold a session at a time.
///
/// # Teardown
///
/// [`teardown`](Self::teardown), or dropping the controller inside a Tokio
/// runtime, invalidates every pending operation and disconnects all
/// connected devices on a best-effort basis. Results arriving afterwards are
/// discarded.
///
/// # Examples
///
/// ```no_run
/// use wearlink::{BleTransport, ConnectivityController};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let controller = ConnectivityController::new(BleTransport::new().await);
///
///     let device = controller.request_device().await?;
///     controller.connect(&device.id).await?;
///
///     for sample in controller.fitness_data().await {
///         println!("{:?} bpm", sample.heart_rate);
///     }
///
///     controller.teardown().await;
///     Ok(())
/// }
/// ```
pub struct ConnectivityController<S: WearableService + 'static> {
    inner: Arc<Inner<S>>,
}

/// Point-in-time copy of everything a UI renders from
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    /// Whether the transport exists on this host
    pub is_supported: bool,
    /// Current status
    pub status: ConnectionStatus,
    /// Most recent failure, until cleared
    pub error: Option<WearableError>,
    /// Known devices
    pub devices: Vec<Device>,
    /// The device holding the session, derived from `devices`
    pub connected_device: Option<Device>,
    /// Samples received so far
    pub fitness_data: Vec<FitnessData>,
}

struct Inner<S> {
    service: Arc<S>,
    config: ControllerConfig,
    state: RwLock<ControllerState>,
    status_tx: watch::Sender<ConnectionStatus>,
    generation: AtomicU64,
    torn_down: AtomicBool,
    next_token: AtomicU64,
    forwarding: StdMutex<Option<Forwarding>>,
    session_watch: StdMutex<Option<Subscription>>,
}

#[derive(Default)]
struct ControllerState {
    status: ConnectionStatus,
    error: Option<WearableError>,
    devices: Vec<Device>,
    fitness_data: Vec<FitnessData>,
    pending_connect: Option<String>,
    /// The host dropped the pending connect's link before it resolved
    pending_lost: bool,
    forwarding: Option<ForwardingToken>,
    /// Bumped on every entry into `Disconnected`
    settle_epoch: u64,
}

/// Identifies the one forwarding path allowed to append samples
struct ForwardingToken {
    device_id: String,
    token: u64,
}

struct Forwarding {
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl Forwarding {
    fn cancel(self) {
        self.subscription.unsubscribe();
        self.task.abort();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ControllerState {
    fn connected_device(&self) -> Option<&Device> {
        self.devices.iter().find(|device| device.connected)
    }

    /// Replace the device list, forcing `device_id` (if any) to disconnected
    fn reconcile_devices(&mut self, devices: Vec<Device>, ended: Option<&str>) {
        self.devices = devices;
        if let Some(ended) = ended {
            for device in self.devices.iter_mut().filter(|d| d.id == ended) {
                device.connected = false;
            }
        }
    }
}

impl<S: WearableService + 'static> ConnectivityController<S> {
    /// Create a controller with default settings
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(service: S) -> Self {
        Self::with_config(Arc::new(service), ControllerConfig::default())
    }

    /// Create a controller over a shared service with custom settings
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_config(service: Arc<S>, config: ControllerConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Idle);

        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<String>();
        let session_watch = service.watch_sessions(Arc::new(move |device_id: &str| {
            let _ = lost_tx.send(device_id.to_string());
        }));

        let inner = Arc::new(Inner {
            service,
            config,
            state: RwLock::new(ControllerState::default()),
            status_tx,
            generation: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
            next_token: AtomicU64::new(0),
            forwarding: StdMutex::new(None),
            session_watch: StdMutex::new(Some(session_watch)),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(device_id) = lost_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_session_lost(&device_id).await;
            }
        });

        Self { inner }
    }

    /// Whether the underlying transport exists on this host
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.inner.service.is_available()
    }

    /// Current status
    pub async fn status(&self) -> ConnectionStatus {
        self.inner.state.read().await.status
    }

    /// Receiver that observes every status change
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Most recent failure, until cleared
    pub async fn error(&self) -> Option<WearableError> {
        self.inner.state.read().await.error.clone()
    }

    /// Known devices as of the last refresh
    pub async fn devices(&self) -> Vec<Device> {
        self.inner.state.read().await.devices.clone()
    }

    /// The device currently holding the session
    pub async fn connected_device(&self) -> Option<Device> {
        self.inner.state.read().await.connected_device().cloned()
    }

    /// Samples received so far, oldest first
    pub async fn fitness_data(&self) -> Vec<FitnessData> {
        self.inner.state.read().await.fitness_data.clone()
    }

    /// Everything a UI needs in one read
    pub async fn snapshot(&self) -> ControllerSnapshot {
        let state = self.inner.state.read().await;
        ControllerSnapshot {
            is_supported: self.is_supported(),
            status: state.status,
            error: state.error.clone(),
            devices: state.devices.clone(),
            connected_device: state.connected_device().cloned(),
            fitness_data: state.fitness_data.clone(),
        }
    }

    /// Open the device chooser with the transport's default filter
    ///
    /// Status is `Searching` while the chooser is open and `Idle` afterwards,
    /// whatever the outcome. Failures are also kept in the error slot.
    ///
    /// # Errors
    ///
    /// [`WearableError::NoDeviceSelected`] if the user cancelled,
    /// [`WearableError::TransportUnavailable`] without Bluetooth,
    /// [`WearableError::OperationInProgress`] if a request or connect is pending,
    /// [`WearableError::Detached`] after teardown.
    pub async fn request_device(&self) -> Result<Device> {
        self.request_device_with(None).await
    }

    /// Open the device chooser narrowed by `filter`
    ///
    /// # Errors
    ///
    /// Same as [`request_device`](Self::request_device).
    pub async fn request_device_with(&self, filter: Option<&DeviceFilter>) -> Result<Device> {
        let inner = &self.inner;
        let generation = inner.begin()?;

        {
            let mut state = inner.state.write().await;
            if state.status == ConnectionStatus::Searching {
                return Err(WearableError::OperationInProgress {
                    operation: "request_device",
                });
            }
            if state.pending_connect.is_some() {
                return Err(WearableError::OperationInProgress { operation: "connect" });
            }
            if !inner.service.is_available() {
                state.error = Some(WearableError::TransportUnavailable);
                inner.set_status(&mut state, ConnectionStatus::Idle);
                return Err(WearableError::TransportUnavailable);
            }
            state.error = None;
            inner.set_status(&mut state, ConnectionStatus::Searching);
        }

        let result = inner.service.request_device(filter).await;
        let devices = inner.service.get_devices().await;

        let mut state = inner.state.write().await;
        if !inner.is_current(generation) {
            debug!("Discarding device request result after teardown");
            return Err(WearableError::Detached);
        }

        state.reconcile_devices(devices, None);
        match &result {
            Ok(device) => info!("Selected device: {} ({})", device.display_name(), device.id),
            Err(e) if e.is_user_cancellation() => info!("Device selection cancelled"),
            Err(e) => warn!("Device request failed: {}", e),
        }
        if let Err(e) = &result {
            state.error = Some(e.clone());
        }
        inner.set_status(&mut state, ConnectionStatus::Idle);
        result
    }

    /// Open a session and start collecting samples
    ///
    /// Returns `true` once connected. Connecting to the device that already
    /// holds the session is a no-op returning `true`.
    ///
    /// # Errors
    ///
    /// [`WearableError::OperationInProgress`] while another connect or device
    /// request is pending, [`WearableError::SessionBusy`] while a different
    /// device is connected, [`WearableError::Detached`] after teardown, or the
    /// transport's error, which is also retained with status `Error`.
    pub async fn connect(&self, device_id: &str) -> Result<bool> {
        let inner = &self.inner;
        let generation = inner.begin()?;

        {
            let mut state = inner.state.write().await;
            if let Some(pending) = &state.pending_connect {
                warn!(
                    "Ignoring connect to {}: connect to {} still pending",
                    device_id, pending
                );
                return Err(WearableError::OperationInProgress { operation: "connect" });
            }
            if state.status == ConnectionStatus::Searching {
                return Err(WearableError::OperationInProgress {
                    operation: "request_device",
                });
            }
            if let Some(active) = state.connected_device() {
                if active.id == device_id {
                    debug!("Device {} is already connected", device_id);
                    return Ok(true);
                }
                return Err(WearableError::SessionBusy {
                    device_id: active.id.clone(),
                });
            }
            if !inner.service.is_available() {
                state.error = Some(WearableError::TransportUnavailable);
                inner.set_status(&mut state, ConnectionStatus::Error);
                return Err(WearableError::TransportUnavailable);
            }

            state.pending_connect = Some(device_id.to_string());
            state.pending_lost = false;
            state.error = None;
            inner.set_status(&mut state, ConnectionStatus::Connecting);
        }

        info!("Connecting to device: {}", device_id);
        let result = inner
            .service
            .connect(device_id, &inner.config.connect_options)
            .await
            .and_then(|live| {
                if live {
                    Ok(())
                } else {
                    Err(WearableError::ConnectionFailed(
                        "transport reported no live session".to_string(),
                    ))
                }
            });

        if !inner.is_current(generation) {
            if result.is_ok() {
                warn!("Connect to {} resolved after teardown, closing it", device_id);
                if let Err(e) = inner.service.disconnect(device_id).await {
                    warn!("Failed to close late session with {}: {}", device_id, e);
                }
            }
            return Err(WearableError::Detached);
        }

        let devices = inner.service.get_devices().await;
        let mut state = inner.state.write().await;
        if !inner.is_current(generation) {
            return Err(WearableError::Detached);
        }

        let result = if result.is_ok() && std::mem::take(&mut state.pending_lost) {
            drop(state);
            warn!("Session with {} was lost before connect resolved", device_id);
            if let Err(e) = inner.service.disconnect(device_id).await {
                warn!("Failed to close lost session with {}: {}", device_id, e);
            }
            let devices = inner.service.get_devices().await;

            state = inner.state.write().await;
            if !inner.is_current(generation) {
                return Err(WearableError::Detached);
            }
            state.reconcile_devices(devices, Some(device_id));
            Err(WearableError::SessionLost {
                device_id: device_id.to_string(),
            })
        } else {
            state.reconcile_devices(devices, None);
            result
        };
        state.pending_connect = None;
        state.pending_lost = false;

        match result {
            Ok(()) => {
                inner.start_forwarding(&mut state, device_id);
                inner.set_status(&mut state, ConnectionStatus::Connected);
                info!("Connected to device: {}", device_id);
                Ok(true)
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", device_id, e);
                state.error = Some(e.clone());
                inner.set_status(&mut state, ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    /// Stop collecting samples from `device_id` and close its session
    ///
    /// Sample forwarding is torn down before the transport is asked to
    /// disconnect. Disconnecting a device that is not connected only
    /// refreshes the device list.
    ///
    /// # Errors
    ///
    /// [`WearableError::Detached`] after teardown, or the transport's error,
    /// which is also retained with status `Error`.
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let inner = &self.inner;
        let generation = inner.begin()?;

        let was_active = {
            let mut state = inner.state.write().await;
            if let Some(forwarding) = inner.detach_forwarding(&mut state, Some(device_id)) {
                forwarding.cancel();
            }
            state
                .connected_device()
                .is_some_and(|device| device.id == device_id)
        };

        info!("Disconnecting from device: {}", device_id);
        let result = inner.service.disconnect(device_id).await;
        let devices = inner.service.get_devices().await;

        let mut state = inner.state.write().await;
        if !inner.is_current(generation) {
            debug!("Discarding disconnect result after teardown");
            return result;
        }

        match result {
            Ok(()) => {
                state.reconcile_devices(devices, Some(device_id));
                if was_active {
                    inner.enter_disconnected(&mut state, generation);
                }
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", device_id, e);
                state.reconcile_devices(devices, None);
                state.error = Some(e.clone());
                inner.set_status(&mut state, ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    /// Re-read the transport's device list
    ///
    /// # Errors
    ///
    /// [`WearableError::Detached`] after teardown.
    pub async fn refresh_devices(&self) -> Result<Vec<Device>> {
        let inner = &self.inner;
        let generation = inner.begin()?;

        let devices = inner.service.get_devices().await;

        let mut state = inner.state.write().await;
        if !inner.is_current(generation) {
            return Err(WearableError::Detached);
        }
        state.reconcile_devices(devices.clone(), None);
        Ok(devices)
    }

    /// Clear the error slot; leaves `Error` for `Idle`
    pub async fn clear_error(&self) {
        let mut state = self.inner.state.write().await;
        state.error = None;
        if state.status == ConnectionStatus::Error {
            self.inner.set_status(&mut state, ConnectionStatus::Idle);
        }
    }

    /// Drop every collected sample
    pub async fn reset_samples(&self) {
        self.inner.state.write().await.fitness_data.clear();
    }

    /// Pass the user profile to the transport
    pub async fn set_user_profile(&self, profile: UserProfile) {
        self.inner.service.set_user_profile(profile).await;
    }

    /// Pass the fitness goals to the transport
    pub async fn set_fitness_goals(&self, goals: FitnessGoals) {
        self.inner.service.set_fitness_goals(goals).await;
    }

    /// Invalidate pending work and disconnect every connected device
    ///
    /// Disconnect failures are logged, never returned. Calling this more
    /// than once is harmless.
    pub async fn teardown(&self) {
        self.inner.teardown().await;
    }
}

impl<S: WearableService + 'static> Drop for ConnectivityController<S> {
    fn drop(&mut self) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { inner.teardown().await });
            }
            Err(_) => {
                warn!("Controller dropped outside a Tokio runtime; devices were left connected");
            }
        }
    }
}

impl<S: WearableService + 'static> Inner<S> {
    /// Generation to compare against once the operation resolves
    fn begin(&self) -> Result<u64> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(WearableError::Detached);
        }
        Ok(self.generation.load(Ordering::SeqCst))
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.torn_down.load(Ordering::SeqCst)
            && self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_status(&self, state: &mut ControllerState, status: ConnectionStatus) {
        if state.status != status {
            debug!("Connection status {} -> {}", state.status, status);
            state.status = status;
            self.status_tx.send_replace(status);
        }
    }

    /// Install the single sample-forwarding path for `device_id`
    fn start_forwarding(self: &Arc<Self>, state: &mut ControllerState, device_id: &str) {
        if let Some(previous) = self.detach_forwarding(state, None) {
            previous.cancel();
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<FitnessData>();
        let subscription = self.service.subscribe(
            device_id,
            Arc::new(move |sample: FitnessData| {
                let _ = tx.send(sample);
            }),
        );

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let mut state = inner.state.write().await;
                // A detached path must never append, even with samples in flight
                if state.forwarding.as_ref().map(|f| f.token) != Some(token) {
                    break;
                }
                state.fitness_data.push(sample);
            }
        });

        state.forwarding = Some(ForwardingToken {
            device_id: device_id.to_string(),
            token,
        });
        *lock(&self.forwarding) = Some(Forwarding { subscription, task });
    }

    /// Detach forwarding, for `device_id` only when given
    fn detach_forwarding(
        &self,
        state: &mut ControllerState,
        device_id: Option<&str>,
    ) -> Option<Forwarding> {
        let matches = state
            .forwarding
            .as_ref()
            .is_some_and(|f| device_id.is_none_or(|id| f.device_id == id));
        if !matches {
            return None;
        }
        state.forwarding = None;
        lock(&self.forwarding).take()
    }

    /// `Disconnected` now, `Idle` after the settle delay
    fn enter_disconnected(self: &Arc<Self>, state: &mut ControllerState, generation: u64) {
        self.set_status(state, ConnectionStatus::Disconnected);
        state.settle_epoch += 1;
        let epoch = state.settle_epoch;

        let weak = Arc::downgrade(self);
        let settle = Duration::from_millis(self.config.disconnect_settle_ms);
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.write().await;
            // Only the timer of the latest disconnect may settle it
            if inner.is_current(generation)
                && state.settle_epoch == epoch
                && state.status == ConnectionStatus::Disconnected
            {
                inner.set_status(&mut state, ConnectionStatus::Idle);
            }
        });
    }

    /// Same cleanup as an explicit disconnect, started by the hardware
    async fn handle_session_lost(self: &Arc<Self>, device_id: &str) {
        let Ok(generation) = self.begin() else {
            return;
        };

        let devices = self.service.get_devices().await;

        let mut state = self.state.write().await;
        if !self.is_current(generation) {
            return;
        }

        if state.pending_connect.as_deref() == Some(device_id) {
            debug!("Session with {} lost while connecting", device_id);
            state.pending_lost = true;
        }

        if let Some(forwarding) = self.detach_forwarding(&mut state, Some(device_id)) {
            forwarding.cancel();
        }

        let was_active = state
            .connected_device()
            .is_some_and(|device| device.id == device_id);
        state.reconcile_devices(devices, Some(device_id));

        if was_active {
            warn!("Session with {} lost", device_id);
            self.enter_disconnected(&mut state, generation);
        } else {
            debug!("Session loss for inactive device {}", device_id);
        }
    }

    async fn teardown(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if self.torn_down.swap(true, Ordering::SeqCst) {
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);

            if let Some(forwarding) = self.detach_forwarding(&mut state, None) {
                forwarding.cancel();
            }
            state.pending_connect = None;
            state.pending_lost = false;
            state.fitness_data.clear();
        }

        let session_watch = lock(&self.session_watch).take();
        drop(session_watch);

        info!("Tearing down connectivity controller");
        for device in self.service.get_devices().await {
            if !device.connected {
                continue;
            }
            if let Err(e) = self.service.disconnect(&device.id).await {
                warn!("Failed to disconnect {} during teardown: {}", device.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        service::{SampleCallback, SessionLostCallback},
        subscription::ListenerSet,
        types::{ConnectOptions, DeviceType},
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct MockService {
        available: bool,
        devices: StdMutex<Vec<Device>>,
        request_result: StdMutex<Result<Device>>,
        connect_error: StdMutex<Option<WearableError>>,
        disconnect_error: StdMutex<Option<WearableError>>,
        connect_gate: Option<Arc<Notify>>,
        connect_calls: AtomicUsize,
        disconnect_calls: AtomicUsize,
        listeners_at_disconnect: AtomicUsize,
        samples: ListenerSet<SampleCallback>,
        sessions: ListenerSet<SessionLostCallback>,
        profile: StdMutex<Option<UserProfile>>,
        goals: StdMutex<Option<FitnessGoals>>,
    }

    impl MockService {
        fn new() -> Self {
            let devices = vec![
                Device::new("hr-1", Some("Polar H10".to_string()), DeviceType::HeartRateMonitor),
                Device::new("hr-2", Some("Garmin HRM".to_string()), DeviceType::HeartRateMonitor),
            ];
            Self {
                available: true,
                devices: StdMutex::new(devices),
                request_result: StdMutex::new(Err(WearableError::NoDeviceSelected)),
                connect_error: StdMutex::new(None),
                disconnect_error: StdMutex::new(None),
                connect_gate: None,
                connect_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
                listeners_at_disconnect: AtomicUsize::new(usize::MAX),
                samples: ListenerSet::new(),
                sessions: ListenerSet::new(),
                profile: StdMutex::new(None),
                goals: StdMutex::new(None),
            }
        }

        fn gated() -> Self {
            Self {
                connect_gate: Some(Arc::new(Notify::new())),
                ..Self::new()
            }
        }

        fn release_connect(&self) {
            if let Some(gate) = &self.connect_gate {
                gate.notify_one();
            }
        }

        fn set_connected(&self, device_id: &str, connected: bool) {
            for device in self.devices.lock().unwrap().iter_mut() {
                if device.id == device_id {
                    device.connected = connected;
                }
            }
        }

        fn emit(&self, device_id: &str, bpm: u16) {
            let sample = FitnessData {
                heart_rate: Some(bpm),
                ..FitnessData::new(device_id)
            };
            for listener in self.samples.matching(device_id) {
                listener(sample.clone());
            }
        }

        fn lose_session(&self, device_id: &str) {
            self.set_connected(device_id, false);
            for listener in self.sessions.all() {
                listener(device_id);
            }
        }
    }

    #[async_trait]
    impl WearableService for MockService {
        fn is_available(&self) -> bool {
            self.available
        }

        async fn request_device(&self, _filter: Option<&DeviceFilter>) -> Result<Device> {
            self.request_result.lock().unwrap().clone()
        }

        async fn connect(&self, device_id: &str, _options: &ConnectOptions) -> Result<bool> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.connect_gate {
                gate.notified().await;
            }
            let failure = self.connect_error.lock().unwrap().clone();
            if let Some(e) = failure {
                return Err(e);
            }
            self.set_connected(device_id, true);
            Ok(true)
        }

        async fn disconnect(&self, device_id: &str) -> Result<()> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            self.listeners_at_disconnect
                .store(self.samples.matching(device_id).len(), Ordering::SeqCst);
            let failure = self.disconnect_error.lock().unwrap().clone();
            if let Some(e) = failure {
                return Err(e);
            }
            self.set_connected(device_id, false);
            Ok(())
        }

        async fn get_devices(&self) -> Vec<Device> {
            self.devices.lock().unwrap().clone()
        }

        fn subscribe(&self, device_id: &str, callback: Arc<SampleCallback>) -> Subscription {
            self.samples.add(Some(device_id), callback)
        }

        fn watch_sessions(&self, callback: Arc<SessionLostCallback>) -> Subscription {
            self.sessions.add(None, callback)
        }

        async fn set_user_profile(&self, profile: UserProfile) {
            *self.profile.lock().unwrap() = Some(profile);
        }

        async fn set_fitness_goals(&self, goals: FitnessGoals) {
            *self.goals.lock().unwrap() = Some(goals);
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            disconnect_settle_ms: 100,
            ..ControllerConfig::default()
        }
    }

    fn controller(service: &Arc<MockService>) -> ConnectivityController<MockService> {
        ConnectivityController::with_config(Arc::clone(service), test_config())
    }

    async fn wait_for_status(
        receiver: &mut watch::Receiver<ConnectionStatus>,
        expected: ConnectionStatus,
    ) {
        tokio::time::timeout(
            Duration::from_secs(2),
            receiver.wait_for(|status| *status == expected),
        )
        .await
        .expect("timed out waiting for status")
        .map(|_| ())
        .expect("status channel closed");
    }

    async fn wait_for_samples(controller: &ConnectivityController<MockService>, count: usize) {
        for _ in 0..200 {
            if controller.fitness_data().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} samples");
    }

    #[tokio::test]
    async fn test_connect_success() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        assert!(controller.is_supported());
        assert_eq!(controller.status().await, ConnectionStatus::Idle);

        tokio_test::assert_ok!(controller.connect("hr-1").await);

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.connected_device.map(|d| d.id).as_deref(), Some("hr-1"));
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(service.samples.len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_connect_reaches_transport_once() {
        let service = Arc::new(MockService::gated());
        let controller = Arc::new(controller(&service));
        let mut status = controller.watch_status();

        let first = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.connect("hr-1").await }
        });
        wait_for_status(&mut status, ConnectionStatus::Connecting).await;

        let second = controller.connect("hr-1").await;
        assert!(matches!(
            second,
            Err(WearableError::OperationInProgress { operation: "connect" })
        ));

        service.release_connect();
        assert!(first.await.unwrap().unwrap());
        assert_eq!(service.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.status().await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_connect_to_connected_device_is_noop() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        assert!(controller.connect("hr-1").await.unwrap());
        assert!(controller.connect("hr-1").await.unwrap());

        assert_eq!(service.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.samples.len(), 1);
    }

    #[tokio::test]
    async fn test_second_device_is_rejected_while_connected() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        controller.connect("hr-1").await.unwrap();
        let result = controller.connect("hr-2").await;

        match result {
            Err(WearableError::SessionBusy { device_id }) => assert_eq!(device_id, "hr-1"),
            other => panic!("expected SessionBusy, got {other:?}"),
        }
        assert_eq!(service.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.status().await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_samples_are_forwarded() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        controller.connect("hr-1").await.unwrap();
        service.emit("hr-1", 72);
        service.emit("hr-1", 75);
        wait_for_samples(&controller, 2).await;

        let samples = controller.fitness_data().await;
        assert_eq!(samples[0].heart_rate, Some(72));
        assert_eq!(samples[1].heart_rate, Some(75));
        assert!(samples.iter().all(|s| s.steps.is_none()));

        controller.reset_samples().await;
        assert!(controller.fitness_data().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_stops_forwarding_first() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);
        let mut status = controller.watch_status();

        controller.connect("hr-1").await.unwrap();
        service.emit("hr-1", 70);
        wait_for_samples(&controller, 1).await;

        tokio_test::assert_ok!(controller.disconnect("hr-1").await);
        assert_eq!(service.listeners_at_disconnect.load(Ordering::SeqCst), 0);
        assert_eq!(controller.status().await, ConnectionStatus::Disconnected);
        assert!(controller.connected_device().await.is_none());

        service.emit("hr-1", 99);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.fitness_data().await.len(), 1);

        wait_for_status(&mut status, ConnectionStatus::Idle).await;
    }

    #[tokio::test]
    async fn test_disconnect_of_inactive_device_keeps_status() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        tokio_test::assert_ok!(controller.disconnect("hr-2").await);
        assert_eq!(controller.status().await, ConnectionStatus::Idle);
    }

    #[tokio::test]
    async fn test_connect_failure_then_clear_error() {
        let service = Arc::new(MockService::new());
        *service.connect_error.lock().unwrap() = Some(WearableError::RequiredServiceMissing {
            service: "Heart Rate",
        });
        let controller = controller(&service);

        let result = controller.connect("hr-1").await;
        assert!(matches!(
            result,
            Err(WearableError::RequiredServiceMissing { .. })
        ));
        assert_eq!(controller.status().await, ConnectionStatus::Error);
        assert!(matches!(
            controller.error().await,
            Some(WearableError::RequiredServiceMissing { .. })
        ));
        assert!(controller.connected_device().await.is_none());

        controller.clear_error().await;
        assert_eq!(controller.status().await, ConnectionStatus::Idle);
        assert!(controller.error().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_error_outside_error_status_keeps_status() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        controller.connect("hr-1").await.unwrap();
        controller.clear_error().await;
        assert_eq!(controller.status().await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_unsolicited_session_loss() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);
        let mut status = controller.watch_status();

        controller.connect("hr-1").await.unwrap();
        service.lose_session("hr-1");

        wait_for_status(&mut status, ConnectionStatus::Disconnected).await;
        assert!(controller.connected_device().await.is_none());
        assert!(service.samples.is_empty());
        assert!(controller.error().await.is_none());

        wait_for_status(&mut status, ConnectionStatus::Idle).await;
        assert_eq!(service.disconnect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_session_lost_while_connecting() {
        let service = Arc::new(MockService::gated());
        let controller = Arc::new(controller(&service));
        let mut status = controller.watch_status();

        let pending = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.connect("hr-1").await }
        });
        wait_for_status(&mut status, ConnectionStatus::Connecting).await;

        service.lose_session("hr-1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.release_connect();

        match pending.await.unwrap() {
            Err(WearableError::SessionLost { device_id }) => assert_eq!(device_id, "hr-1"),
            other => panic!("expected SessionLost, got {other:?}"),
        }
        assert_eq!(service.disconnect_calls.load(Ordering::SeqCst), 1);
        assert!(service.samples.is_empty());

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.status, ConnectionStatus::Error);
        assert!(snapshot.connected_device.is_none());
        assert!(matches!(
            snapshot.error,
            Some(WearableError::SessionLost { .. })
        ));

        // The next attempt starts clean
        service.release_connect();
        tokio_test::assert_ok!(controller.connect("hr-1").await);
    }

    #[tokio::test]
    async fn test_settle_timer_belongs_to_its_own_disconnect() {
        let service = Arc::new(MockService::new());
        let controller = ConnectivityController::with_config(
            Arc::clone(&service),
            ControllerConfig {
                disconnect_settle_ms: 200,
                ..ControllerConfig::default()
            },
        );
        let mut status = controller.watch_status();

        controller.connect("hr-1").await.unwrap();
        controller.disconnect("hr-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        controller.connect("hr-1").await.unwrap();
        controller.disconnect("hr-1").await.unwrap();

        // Past the first timer, short of the second
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(controller.status().await, ConnectionStatus::Disconnected);

        wait_for_status(&mut status, ConnectionStatus::Idle).await;
    }

    #[tokio::test]
    async fn test_request_device_cancelled() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        let result = controller.request_device().await;
        assert!(matches!(result, Err(WearableError::NoDeviceSelected)));
        assert_eq!(controller.status().await, ConnectionStatus::Idle);
        assert!(matches!(
            controller.error().await,
            Some(WearableError::NoDeviceSelected)
        ));
    }

    #[tokio::test]
    async fn test_request_device_never_reports_connected() {
        let service = Arc::new(MockService::new());
        let device = service.devices.lock().unwrap()[1].clone();
        *service.request_result.lock().unwrap() = Ok(device);
        let controller = controller(&service);

        controller.connect("hr-1").await.unwrap();
        let chosen = controller.request_device().await.unwrap();

        assert_eq!(chosen.id, "hr-2");
        assert_eq!(controller.status().await, ConnectionStatus::Idle);
        assert!(controller.error().await.is_none());
        assert_eq!(controller.devices().await.len(), 2);
        // The session itself is untouched
        assert_eq!(
            controller.connected_device().await.map(|d| d.id).as_deref(),
            Some("hr-1")
        );
    }

    #[tokio::test]
    async fn test_unsupported_transport() {
        let service = Arc::new(MockService {
            available: false,
            ..MockService::new()
        });
        let controller = controller(&service);

        assert!(!controller.is_supported());
        let result = controller.request_device().await;
        assert!(matches!(result, Err(WearableError::TransportUnavailable)));
        assert_eq!(controller.status().await, ConnectionStatus::Idle);
        assert!(matches!(
            controller.error().await,
            Some(WearableError::TransportUnavailable)
        ));
        assert_eq!(service.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_teardown_disconnects_and_detaches() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        controller.connect("hr-1").await.unwrap();
        controller.teardown().await;

        assert_eq!(service.disconnect_calls.load(Ordering::SeqCst), 1);
        assert!(service.samples.is_empty());
        assert!(service.sessions.is_empty());
        assert!(matches!(
            controller.connect("hr-1").await,
            Err(WearableError::Detached)
        ));

        // Idempotent
        controller.teardown().await;
        assert_eq!(service.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_resolving_after_teardown_is_discarded() {
        let service = Arc::new(MockService::gated());
        let controller = Arc::new(controller(&service));
        let mut status = controller.watch_status();

        let pending = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.connect("hr-1").await }
        });
        wait_for_status(&mut status, ConnectionStatus::Connecting).await;

        controller.teardown().await;
        service.release_connect();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(WearableError::Detached)));
        assert_eq!(service.disconnect_calls.load(Ordering::SeqCst), 1);
        assert!(service.samples.is_empty());
        assert_eq!(controller.status().await, ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn test_teardown_swallows_disconnect_failures() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        controller.connect("hr-1").await.unwrap();
        *service.disconnect_error.lock().unwrap() =
            Some(WearableError::Other("adapter gone".to_string()));

        controller.teardown().await;
        assert_eq!(service.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_tears_down() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        controller.connect("hr-1").await.unwrap();
        drop(controller);

        for _ in 0..200 {
            if service.disconnect_calls.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dropping the controller did not disconnect the device");
    }

    #[tokio::test]
    async fn test_profile_and_goals_pass_through() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        controller
            .set_user_profile(UserProfile {
                max_heart_rate: Some(190),
                ..Default::default()
            })
            .await;
        controller
            .set_fitness_goals(FitnessGoals {
                weekly_workouts: Some(4),
                ..Default::default()
            })
            .await;

        assert_eq!(
            service.profile.lock().unwrap().as_ref().unwrap().max_heart_rate,
            Some(190)
        );
        assert_eq!(
            service.goals.lock().unwrap().as_ref().unwrap().weekly_workouts,
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_refresh_devices() {
        let service = Arc::new(MockService::new());
        let controller = controller(&service);

        assert!(controller.devices().await.is_empty());
        let devices = controller.refresh_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(controller.devices().await, devices);
    }
}
