use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
        ScanFilter, ValueNotification,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{Stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap},
    pin::Pin,
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{Mutex, MutexGuard, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, WearableError},
    protocol::{
        decode_battery_level, decode_heart_rate, decode_info_string, BATTERY_LEVEL_UUID,
        BATTERY_SERVICE_UUID, DEVICE_INFORMATION_SERVICE_UUID, FIRMWARE_REVISION_UUID,
        HARDWARE_REVISION_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
        MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID, SERIAL_NUMBER_UUID, SOFTWARE_REVISION_UUID,
    },
    service::{
        BatteryLevelCallback, DeviceChooser, HeartRateCallback, SampleCallback,
        SessionLostCallback, StrongestSignalChooser, WearableService,
    },
    subscription::{CallbackSlot, ListenerSet, Subscription},
    types::{
        ConnectOptions, Device, DeviceFilter, DeviceInformation, DeviceType, FitnessData,
        FitnessGoals, HeartRateMeasurement, TransportConfig, UserProfile,
    },
};

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// Bluetooth Low Energy transport for heart-rate wearables
///
/// Owns the hardware handles: discovered peripherals, live sessions and
/// their subscribed characteristics. Every live session has one task
/// pumping its notification stream through the decoders in
/// [`crate::protocol`]; decoded events go to the single-slot callbacks and
/// to sample subscribers.
///
/// Session loss reported by the host marks the device disconnected and
/// notifies [`WearableService::watch_sessions`] listeners. The transport
/// never reconnects or resubscribes on its own.
pub struct BleTransport {
    _manager: Option<Manager>,
    central: Option<Adapter>,
    config: TransportConfig,
    chooser: Box<dyn DeviceChooser>,
    shared: Arc<Shared>,
    session_watcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    peripherals: Mutex<HashMap<String, Peripheral>>,
    devices: RwLock<HashMap<String, Device>>,
    sessions: Mutex<HashMap<String, Session>>,
    /// Connects in flight; `true` once the host reported the link down
    pending: Mutex<HashMap<String, bool>>,
    heart_rate_callback: CallbackSlot<HeartRateCallback>,
    battery_callback: CallbackSlot<BatteryLevelCallback>,
    sample_listeners: ListenerSet<SampleCallback>,
    session_listeners: ListenerSet<SessionLostCallback>,
    user_profile: RwLock<Option<UserProfile>>,
    fitness_goals: RwLock<Option<FitnessGoals>>,
}

/// A live hardware session
struct Session {
    peripheral: Peripheral,
    heart_rate: Characteristic,
    battery: Option<Characteristic>,
    pump: JoinHandle<()>,
}

impl BleTransport {
    /// Create a transport on the first Bluetooth adapter with default settings
    ///
    /// Never fails: on a host without Bluetooth the transport reports
    /// [`WearableService::is_available`] as `false`.
    pub async fn new() -> Self {
        Self::with_config(TransportConfig::default()).await
    }

    /// Create a transport with custom settings
    pub async fn with_config(config: TransportConfig) -> Self {
        let manager = match Manager::new().await {
            Ok(manager) => manager,
            Err(e) => {
                warn!("Bluetooth manager unavailable: {}", e);
                return Self::unavailable(config);
            }
        };

        let central = match manager.adapters().await {
            Ok(adapters) => adapters.into_iter().next(),
            Err(e) => {
                warn!("Failed to enumerate Bluetooth adapters: {}", e);
                None
            }
        };

        let shared = Arc::new(Shared::default());
        let session_watcher = match &central {
            Some(central) => spawn_session_watcher(central, &shared).await,
            None => {
                warn!("No Bluetooth adapter found - transport unavailable");
                None
            }
        };

        Self {
            _manager: Some(manager),
            central,
            config,
            chooser: Box::new(StrongestSignalChooser),
            shared,
            session_watcher,
        }
    }

    fn unavailable(config: TransportConfig) -> Self {
        Self {
            _manager: None,
            central: None,
            config,
            chooser: Box::new(StrongestSignalChooser),
            shared: Arc::new(Shared::default()),
            session_watcher: None,
        }
    }

    /// Replace the device chooser used by `request_device`
    #[must_use]
    pub fn with_chooser(mut self, chooser: impl DeviceChooser + 'static) -> Self {
        self.chooser = Box::new(chooser);
        self
    }

    /// Transport configuration
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Register the heart rate sink, replacing any earlier one
    pub fn set_heart_rate_callback(&self, callback: Arc<HeartRateCallback>) {
        self.shared.heart_rate_callback.set(callback);
    }

    /// Register the battery level sink, replacing any earlier one
    pub fn set_battery_level_callback(&self, callback: Arc<BatteryLevelCallback>) {
        self.shared.battery_callback.set(callback);
    }

    /// Profile stored by the last `set_user_profile`
    pub async fn user_profile(&self) -> Option<UserProfile> {
        self.shared.user_profile.read().await.clone()
    }

    /// Goals stored by the last `set_fitness_goals`
    pub async fn fitness_goals(&self) -> Option<FitnessGoals> {
        self.shared.fitness_goals.read().await.clone()
    }

    fn central(&self) -> Result<&Adapter> {
        self.central
            .as_ref()
            .ok_or(WearableError::TransportUnavailable)
    }

    /// Scan and collect every peripheral matching `filter`
    async fn scan(&self, central: &Adapter, filter: &DeviceFilter) -> Result<Vec<Device>> {
        info!("Starting scan for heart rate devices...");

        central
            .start_scan(ScanFilter {
                services: filter.required_services(),
            })
            .await?;

        tokio::time::sleep(Duration::from_millis(self.config.scan_duration_ms)).await;

        central.stop_scan().await?;

        let mut candidates = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };

            // Not every backend honours the scan filter
            if !filter.matches(properties.local_name.as_deref(), &properties.services) {
                continue;
            }

            let device_id = peripheral.id().to_string();
            let device = self.shared.remember(&device_id, peripheral, &properties).await;
            info!("Found device: {} ({})", device.display_name(), device.id);
            candidates.push(device);
        }

        info!("Scan completed. Found {} candidate device(s)", candidates.len());
        Ok(candidates)
    }

    async fn peripheral(&self, central: &Adapter, device_id: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.shared.peripherals.lock().await.get(device_id) {
            return Ok(peripheral.clone());
        }

        // The host may still know the device from an earlier scan
        let peripheral = central
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| WearableError::DeviceNotFound {
                device_id: device_id.to_string(),
            })?;

        let properties = peripheral.properties().await.ok().flatten().unwrap_or_default();
        self.shared
            .remember(device_id, peripheral.clone(), &properties)
            .await;
        Ok(peripheral)
    }

    /// Discover services and subscribe; the link is already up
    async fn open_session(
        &self,
        device_id: &str,
        peripheral: &Peripheral,
        options: &ConnectOptions,
    ) -> Result<(Session, Option<u8>, DeviceInformation)> {
        peripheral.discover_services().await?;
        let characteristics = peripheral.characteristics();
        let plan = ServicePlan::select(&characteristics)?;

        // Take the stream before subscribing so the first values are not missed
        let notifications = peripheral.notifications().await?;

        peripheral.subscribe(&plan.heart_rate).await.map_err(|e| {
            warn!("Heart rate subscription failed on {}: {}", device_id, e);
            WearableError::RequiredServiceMissing {
                service: "Heart Rate",
            }
        })?;

        let (battery, battery_level) = match plan.battery {
            Some(battery) if options.subscribe_battery => {
                open_battery(device_id, peripheral, battery).await
            }
            Some(_) => (None, None),
            None => {
                debug!(
                    "{} on {}",
                    WearableError::OptionalServiceUnavailable { service: "Battery" },
                    device_id
                );
                (None, None)
            }
        };

        let information = if !options.read_device_information {
            DeviceInformation::default()
        } else if plan.device_information {
            read_device_information(device_id, peripheral, &characteristics).await
        } else {
            debug!(
                "{} on {}",
                WearableError::OptionalServiceUnavailable {
                    service: "Device Information"
                },
                device_id
            );
            DeviceInformation::default()
        };

        let pump = tokio::spawn(pump_notifications(
            Arc::downgrade(&self.shared),
            device_id.to_string(),
            notifications,
        ));

        let session = Session {
            peripheral: peripheral.clone(),
            heart_rate: plan.heart_rate,
            battery,
            pump,
        };
        Ok((session, battery_level, information))
    }

    /// Bring the link up and open the session on it
    async fn establish(
        &self,
        device_id: &str,
        peripheral: &Peripheral,
        options: &ConnectOptions,
    ) -> Result<(Session, Option<u8>, DeviceInformation)> {
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .connect()
                .await
                .map_err(|e| WearableError::ConnectionFailed(e.to_string()))?;
        }
        self.open_session(device_id, peripheral, options).await
    }
}

/// Characteristics a session is built from
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServicePlan {
    heart_rate: Characteristic,
    battery: Option<Characteristic>,
    device_information: bool,
}

impl ServicePlan {
    /// Heart Rate Measurement is mandatory; everything else is optional
    fn select(characteristics: &BTreeSet<Characteristic>) -> Result<Self> {
        let heart_rate = find_characteristic(
            characteristics,
            HEART_RATE_SERVICE_UUID,
            HEART_RATE_MEASUREMENT_UUID,
        )
        .ok_or(WearableError::RequiredServiceMissing {
            service: "Heart Rate",
        })?;

        Ok(Self {
            heart_rate,
            battery: find_characteristic(characteristics, BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID),
            device_information: characteristics
                .iter()
                .any(|c| c.service_uuid == DEVICE_INFORMATION_SERVICE_UUID),
        })
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(watcher) = self.session_watcher.take() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl WearableService for BleTransport {
    fn is_available(&self) -> bool {
        self.central.is_some()
    }

    async fn request_device(&self, filter: Option<&DeviceFilter>) -> Result<Device> {
        let central = self.central()?;
        let filter = filter.unwrap_or(&self.config.default_filter);

        let candidates = self.scan(central, filter).await?;

        let Some(chosen) = self.chooser.choose(&candidates).await else {
            info!("No device selected");
            return Err(WearableError::NoDeviceSelected);
        };

        candidates
            .into_iter()
            .find(|device| device.id == chosen)
            .ok_or(WearableError::NoDeviceSelected)
    }

    async fn connect(&self, device_id: &str, options: &ConnectOptions) -> Result<bool> {
        let central = self.central()?;

        if self.shared.sessions.lock().await.contains_key(device_id) {
            debug!("Device {} already has a live session", device_id);
            return Ok(true);
        }

        let peripheral = self.peripheral(central, device_id).await?;

        info!("Connecting to device: {}", device_id);
        self.shared.begin_pending(device_id).await;

        let (session, battery_level, information) =
            match self.establish(device_id, &peripheral, options).await {
                Ok(opened) => opened,
                Err(e) => {
                    error!("Failed to open session with {}: {}", device_id, e);
                    self.shared.pending.lock().await.remove(device_id);
                    if let Err(close_error) = peripheral.disconnect().await {
                        warn!(
                            "Failed to close partial session with {}: {}",
                            device_id, close_error
                        );
                    }
                    return Err(e);
                }
            };

        match self.shared.claim_pending(device_id).await {
            Ok(mut sessions) => {
                sessions.insert(device_id.to_string(), session);
                // Still holding the table, so a loss event cannot slip in between
                self.shared
                    .update_device(device_id, |device| {
                        device.connected = true;
                        device.battery_level = battery_level.or(device.battery_level);
                        if !information.is_empty() {
                            device.information = information;
                        }
                    })
                    .await;
                drop(sessions);
            }
            Err(e) => {
                error!("Link to {} dropped while the session was opening", device_id);
                session.pump.abort();
                if let Err(close_error) = peripheral.disconnect().await {
                    warn!(
                        "Failed to close dead session with {}: {}",
                        device_id, close_error
                    );
                }
                return Err(e);
            }
        }

        info!("Successfully connected to {}", device_id);
        Ok(true)
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        let session = self.shared.sessions.lock().await.remove(device_id);
        let Some(Session {
            peripheral,
            heart_rate,
            battery,
            pump,
        }) = session
        else {
            debug!("Device {} has no live session, nothing to disconnect", device_id);
            return Ok(());
        };

        info!("Disconnecting from device: {}", device_id);

        if let Err(e) = peripheral.unsubscribe(&heart_rate).await {
            warn!("Failed to unsubscribe heart rate on {}: {}", device_id, e);
        }
        if let Some(battery) = &battery {
            if let Err(e) = peripheral.unsubscribe(battery).await {
                warn!("Failed to unsubscribe battery level on {}: {}", device_id, e);
            }
        }

        pump.abort();
        let _ = pump.await;

        self.shared
            .update_device(device_id, |device| device.connected = false)
            .await;

        peripheral.disconnect().await?;
        Ok(())
    }

    async fn get_devices(&self) -> Vec<Device> {
        self.shared.device_list().await
    }

    fn subscribe(&self, device_id: &str, callback: Arc<SampleCallback>) -> Subscription {
        self.shared.sample_listeners.add(Some(device_id), callback)
    }

    fn watch_sessions(&self, callback: Arc<SessionLostCallback>) -> Subscription {
        self.shared.session_listeners.add(None, callback)
    }

    async fn set_user_profile(&self, profile: UserProfile) {
        debug!("Storing user profile for the session");
        *self.shared.user_profile.write().await = Some(profile);
    }

    async fn set_fitness_goals(&self, goals: FitnessGoals) {
        debug!("Storing fitness goals for the session");
        *self.shared.fitness_goals.write().await = Some(goals);
    }
}

impl Shared {
    /// Cache a discovered peripheral, keeping session state of known devices
    async fn remember(
        &self,
        device_id: &str,
        peripheral: Peripheral,
        properties: &PeripheralProperties,
    ) -> Device {
        self.peripherals
            .lock()
            .await
            .insert(device_id.to_string(), peripheral);

        let mut devices = self.devices.write().await;
        let device = devices.entry(device_id.to_string()).or_insert_with(|| {
            Device::new(
                device_id,
                properties.local_name.clone(),
                DeviceType::from_advertisement(
                    properties.local_name.as_deref(),
                    &properties.services,
                ),
            )
        });

        if properties.local_name.is_some() {
            device.name.clone_from(&properties.local_name);
        }
        device.rssi = properties.rssi.or(device.rssi);
        device.clone()
    }

    async fn update_device(&self, device_id: &str, update: impl FnOnce(&mut Device)) {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            update(device);
        }
    }

    async fn device_list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    async fn dispatch(&self, device_id: &str, notification: &ValueNotification) {
        if notification.uuid == HEART_RATE_MEASUREMENT_UUID {
            match decode_heart_rate(&notification.value) {
                Ok(measurement) => self.handle_heart_rate(device_id, &measurement).await,
                Err(e) => warn!("Dropping heart rate notification from {}: {}", device_id, e),
            }
        } else if notification.uuid == BATTERY_LEVEL_UUID {
            match decode_battery_level(&notification.value) {
                Ok(level) => self.handle_battery_level(device_id, level).await,
                Err(e) => warn!("Dropping battery notification from {}: {}", device_id, e),
            }
        } else {
            debug!(
                "Ignoring notification from {} on {}",
                device_id, notification.uuid
            );
        }
    }

    async fn handle_heart_rate(&self, device_id: &str, measurement: &HeartRateMeasurement) {
        debug!("Heart rate from {}: {} bpm", device_id, measurement.bpm);

        self.update_device(device_id, |device| {
            device.last_sync = Some(SystemTime::now());
        })
        .await;

        if let Some(callback) = self.heart_rate_callback.get() {
            callback(device_id, measurement);
        }

        let sample = FitnessData::from_heart_rate(device_id, measurement);
        for listener in self.sample_listeners.matching(device_id) {
            listener(sample.clone());
        }
    }

    async fn handle_battery_level(&self, device_id: &str, level: u8) {
        debug!("Battery level from {}: {}%", device_id, level);

        self.update_device(device_id, |device| {
            device.battery_level = Some(level);
            device.last_sync = Some(SystemTime::now());
        })
        .await;

        if let Some(callback) = self.battery_callback.get() {
            callback(device_id, level);
        }
    }

    async fn begin_pending(&self, device_id: &str) {
        self.pending.lock().await.insert(device_id.to_string(), false);
    }

    /// End a pending connect, handing out the session table to register it
    ///
    /// Fails with `SessionLost` if the host dropped the link meanwhile.
    async fn claim_pending(
        &self,
        device_id: &str,
    ) -> Result<MutexGuard<'_, HashMap<String, Session>>> {
        let sessions = self.sessions.lock().await;
        let lost = self.pending.lock().await.remove(device_id).unwrap_or(false);
        if lost {
            return Err(WearableError::SessionLost {
                device_id: device_id.to_string(),
            });
        }
        Ok(sessions)
    }

    /// Host reported a disconnection; only live sessions count as lost
    async fn handle_session_lost(&self, device_id: &str) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.remove(device_id);
        let Some(session) = session else {
            if let Some(lost) = self.pending.lock().await.get_mut(device_id) {
                debug!("Link to {} dropped during connect", device_id);
                *lost = true;
            } else {
                debug!("Disconnect event for {} without a live session", device_id);
            }
            drop(sessions);
            self.update_device(device_id, |device| device.connected = false)
                .await;
            return;
        };

        drop(sessions);

        warn!(
            "{}",
            WearableError::SessionLost {
                device_id: device_id.to_string()
            }
        );

        session.pump.abort();
        let _ = session.pump.await;

        self.update_device(device_id, |device| device.connected = false)
            .await;

        for listener in self.session_listeners.all() {
            listener(device_id);
        }
    }
}

async fn spawn_session_watcher(central: &Adapter, shared: &Arc<Shared>) -> Option<JoinHandle<()>> {
    let mut events = match central.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot watch adapter events, session loss will go unnoticed: {}", e);
            return None;
        }
    };

    let shared = Arc::downgrade(shared);
    Some(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(id) = event {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle_session_lost(&id.to_string()).await;
            }
        }
        debug!("Adapter event stream ended");
    }))
}

async fn pump_notifications(
    shared: Weak<Shared>,
    device_id: String,
    mut stream: NotificationStream,
) {
    while let Some(notification) = stream.next().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.dispatch(&device_id, &notification).await;
    }
    debug!("Notification stream for {} ended", device_id);
}

fn find_characteristic(
    characteristics: &BTreeSet<Characteristic>,
    service: Uuid,
    characteristic: Uuid,
) -> Option<Characteristic> {
    characteristics
        .iter()
        .find(|c| c.service_uuid == service && c.uuid == characteristic)
        .cloned()
}

/// Read and subscribe to battery level; never fails
async fn open_battery(
    device_id: &str,
    peripheral: &Peripheral,
    battery: Characteristic,
) -> (Option<Characteristic>, Option<u8>) {
    let level = match peripheral.read(&battery).await {
        Ok(value) => decode_battery_level(&value).ok(),
        Err(e) => {
            debug!("Initial battery read failed on {}: {}", device_id, e);
            None
        }
    };

    match peripheral.subscribe(&battery).await {
        Ok(()) => (Some(battery), level),
        Err(e) => {
            warn!("Battery level subscription failed on {}: {}", device_id, e);
            (None, level)
        }
    }
}

/// Best-effort read of every Device Information string
async fn read_device_information(
    device_id: &str,
    peripheral: &Peripheral,
    characteristics: &BTreeSet<Characteristic>,
) -> DeviceInformation {
    let read = |uuid: Uuid| read_info_string(device_id, peripheral, characteristics, uuid);

    DeviceInformation {
        manufacturer: read(MANUFACTURER_NAME_UUID).await,
        model: read(MODEL_NUMBER_UUID).await,
        serial_number: read(SERIAL_NUMBER_UUID).await,
        firmware_version: read(FIRMWARE_REVISION_UUID).await,
        hardware_version: read(HARDWARE_REVISION_UUID).await,
        software_version: read(SOFTWARE_REVISION_UUID).await,
    }
}

async fn read_info_string(
    device_id: &str,
    peripheral: &Peripheral,
    characteristics: &BTreeSet<Characteristic>,
    uuid: Uuid,
) -> Option<String> {
    let characteristic =
        find_characteristic(characteristics, DEVICE_INFORMATION_SERVICE_UUID, uuid)?;

    match peripheral.read(&characteristic).await {
        Ok(value) => decode_info_string(&value),
        Err(e) => {
            debug!("Reading {} on {} failed: {}", uuid, device_id, e);
            None
        }
    }
}
