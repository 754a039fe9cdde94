//! Polling controller
//!
//! Sits between a [`Pm100xDriver`] and the view layer. It owns the reading
//! state (continuous-read flag, accumulated samples, last reading), runs the
//! poll loop and reports everything it does on an [`EventBus`].
//!
//! # Poll loop
//!
//! [`PowerMeterController::start_reading`] polls once right away and then
//! spawns a task that sleeps `refresh_time` between polls. Cancellation is
//! cooperative: pausing or stopping clears the continuous-read flag and the
//! next poll is a no-op. Every start also bumps a generation counter, so a
//! loop left over from an earlier start exits on its next wake-up instead of
//! polling alongside the new one. A reading that completes after a pause, a
//! stop or a restart is dropped.
//!
//! # Failures
//!
//! User input is validated here or in the driver; rejected input is logged,
//! the method returns `false` and the previous value is published again so
//! views can revert their widgets. A bus error during a poll skips that cycle
//! and publishes [`PanelEvent::ReadFailed`]. Losing the connection ends the
//! loop.

use crate::config::{refresh_interval, SettingsStore, MIN_REFRESH_TIME};
use crate::trigger::Trigger;
use parking_lot::{Mutex, RwLock};
use pm_core::{
    ConnectionState, DeviceDescriptor, EventBus, PanelEvent, PmError, PowerReading, PowerSample,
    ReadingState,
};
use pm_driver_thorlabs::{Pm100xDriver, RangeDirection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn, Instrument};

/// Poll interval used if the stored refresh time is unusable.
const FALLBACK_REFRESH_INTERVAL: Duration = Duration::from_millis(200);

/// Snapshot of the last acquisition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    /// Last power value, `None` before the first reading or while zeroing
    pub power: Option<f64>,
    /// Unit reported by the console
    pub unit: String,
}

impl From<&PowerReading> for Output {
    fn from(reading: &PowerReading) -> Self {
        Self {
            power: reading.value,
            unit: reading.unit.clone(),
        }
    }
}

#[derive(Debug)]
struct PollingSession {
    continuous_read: bool,
    stored_data: Vec<PowerSample>,
    last_reading: PowerReading,
    connected_device: Option<String>,
    connection: ConnectionState,
    reading: ReadingState,
    devices: Vec<DeviceDescriptor>,
}

impl Default for PollingSession {
    fn default() -> Self {
        Self {
            continuous_read: false,
            stored_data: Vec::new(),
            last_reading: PowerReading::sentinel(),
            connected_device: None,
            connection: ConnectionState::Disconnected,
            reading: ReadingState::Stopped,
            devices: Vec::new(),
        }
    }
}

struct Inner {
    driver: Arc<Pm100xDriver>,
    events: EventBus,
    settings: SettingsStore,
    session: Mutex<PollingSession>,
    trigger: RwLock<Option<Trigger>>,
    /// Bumped on every start; a poll loop exits once it no longer matches
    generation: AtomicU64,
}

/// Controller for one power meter.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PowerMeterController {
    inner: Arc<Inner>,
}

impl PowerMeterController {
    /// Controller with its own event bus.
    pub fn new(driver: Arc<Pm100xDriver>, settings: SettingsStore) -> Self {
        Self::with_events(driver, settings, EventBus::default())
    }

    /// Controller publishing on an existing bus.
    pub fn with_events(driver: Arc<Pm100xDriver>, settings: SettingsStore, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                events,
                settings,
                session: Mutex::new(PollingSession::default()),
                trigger: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// The wrapped driver.
    pub fn driver(&self) -> &Arc<Pm100xDriver> {
        &self.inner.driver
    }

    /// Bus every state change is published on.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.inner.events.subscribe()
    }

    /// Persisted panel settings.
    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    /// Poll interval in seconds.
    pub fn refresh_time(&self) -> f64 {
        self.inner.settings.settings().refresh_time
    }

    /// Samples accumulated since the last stop.
    pub fn stored_data(&self) -> Vec<PowerSample> {
        self.inner.session.lock().stored_data.clone()
    }

    /// Last reading as value and unit.
    pub fn output(&self) -> Output {
        Output::from(&self.inner.session.lock().last_reading)
    }

    /// Last reading formatted like `2.50e-04 W`, or a blank.
    pub fn current_power_string(&self) -> String {
        self.inner.session.lock().last_reading.to_string()
    }

    /// Continuous reading is on.
    pub fn is_reading(&self) -> bool {
        self.inner.session.lock().continuous_read
    }

    /// Connection state as last published.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.lock().connection
    }

    /// Reading state as last published.
    pub fn reading_state(&self) -> ReadingState {
        self.inner.session.lock().reading
    }

    /// Devices found by the last [`refresh_list_devices`](Self::refresh_list_devices).
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.session.lock().devices.clone()
    }

    /// Address of the connected device.
    pub fn connected_device(&self) -> Option<String> {
        self.inner.session.lock().connected_device.clone()
    }

    fn device_name(&self) -> String {
        self.connected_device().unwrap_or_default()
    }

    fn publish(&self, event: PanelEvent) {
        self.inner.events.publish(event);
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.inner.session.lock().connection = state;
        self.publish(PanelEvent::ConnectionChanged(state));
    }

    fn set_reading_state(&self, state: ReadingState) {
        self.inner.session.lock().reading = state;
        self.publish(PanelEvent::ReadingChanged(state));
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Scan the bus and publish the consoles found.
    pub async fn refresh_list_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.session.lock().devices.clear();
        info!("Looking for devices...");
        let devices = match self.inner.driver.discover().await {
            Ok(devices) => devices,
            Err(e) => {
                error!("An error occurred while looking for devices: {e}");
                Vec::new()
            }
        };
        self.inner.session.lock().devices = devices.clone();
        self.publish(PanelEvent::DevicesListed(devices.clone()));
        info!("Found {} devices.", devices.len());
        devices
    }

    /// Connect to the device named by `label` and start reading.
    ///
    /// `label` is either a descriptor label (`"<identity> --> <address>"`) or
    /// a bare address from the last scan.
    pub async fn connect_device(&self, label: &str) -> bool {
        if label.trim().is_empty() {
            error!("No valid device has been selected.");
            return false;
        }
        self.set_connection_state(ConnectionState::Connecting);
        let address = DeviceDescriptor::address_from_label(label).to_string();
        info!("Connecting to device {address}...");

        match self.inner.driver.connect(&address).await {
            Ok(identity) => {
                info!("Connected to device {address}.");
                debug!(address = %address, identity = %identity, "Console identity");
                self.inner.session.lock().connected_device = Some(address);
                self.set_connection_state(ConnectionState::Connected);
                self.set_connected_state().await;
                self.start_reading().await;
                true
            }
            Err(e) => {
                error!("Error: {e}");
                // A refused attempt leaves an existing connection alone
                let state = if self.inner.driver.is_connected() {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                };
                self.set_connection_state(state);
                false
            }
        }
    }

    /// Bring the panel in line with a freshly connected console.
    async fn set_connected_state(&self) {
        self.read_wavelength().await;
        let auto = self.inner.settings.settings().auto_power_range;
        // Also re-reads the power range
        self.set_auto_power_range(auto).await;
    }

    /// Disconnect; the panel ends up disconnected even if the bus fails.
    pub async fn disconnect_device(&self) -> bool {
        let name = self.device_name();
        info!("Disconnecting from device {name}...");
        let result = self.inner.driver.disconnect().await;

        let was_reading = {
            let mut session = self.inner.session.lock();
            session.connected_device = None;
            std::mem::replace(&mut session.continuous_read, false)
        };
        if was_reading {
            self.set_reading_state(ReadingState::Paused);
        }

        let ok = match result {
            Ok(()) => {
                info!("Disconnected from device {name}.");
                true
            }
            Err(e) => {
                error!("Error: {e}");
                false
            }
        };
        self.set_connection_state(ConnectionState::Disconnected);
        ok
    }

    /// Disconnect if connected. Errors are logged.
    pub async fn close(&self) {
        if self.inner.driver.is_connected() {
            self.disconnect_device().await;
        }
    }

    // -------------------------------------------------------------------------
    // Settings
    // -------------------------------------------------------------------------

    /// Set the poll interval from user input, in seconds.
    pub fn set_refresh_time(&self, input: &str) -> bool {
        let current = self.refresh_time();
        let value = match input.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            _ => {
                error!("The refresh time must be a valid number.");
                self.publish(PanelEvent::RefreshTimeChanged(current));
                return false;
            }
        };
        if value == current {
            return true;
        }
        if value < MIN_REFRESH_TIME {
            error!("The refresh time must be positive and >= 1ms.");
            self.publish(PanelEvent::RefreshTimeChanged(current));
            return false;
        }
        if refresh_interval(value).is_none() {
            error!("The refresh time is too large.");
            self.publish(PanelEvent::RefreshTimeChanged(current));
            return false;
        }

        info!("The refresh time is now {value} s.");
        self.inner.settings.update(|s| s.refresh_time = value);
        self.publish(PanelEvent::RefreshTimeChanged(value));
        true
    }

    /// Set the calibration wavelength from user input, in nm.
    pub async fn set_wavelength(&self, input: &str) -> bool {
        let wavelength = match input.trim().parse::<i64>() {
            Ok(nm) => nm,
            Err(_) => {
                error!("The wavelength must be a valid number.");
                self.publish_actual_wavelength();
                return false;
            }
        };
        if let Ok(current) = self.inner.driver.wavelength().await {
            if current == wavelength {
                return true;
            }
        }

        info!(
            "Setting the wavelength to {wavelength} for the device {}...",
            self.device_name()
        );
        match self.inner.driver.set_wavelength(wavelength).await {
            Ok(nm) => {
                info!("Wavelength set correctly.");
                self.publish(PanelEvent::WavelengthChanged(nm));
                // Range bounds depend on the wavelength
                self.read_power_range().await;
                true
            }
            Err(e) => {
                error!("An error occurred while setting the wavelength: {e}");
                self.publish_actual_wavelength();
                false
            }
        }
    }

    fn publish_actual_wavelength(&self) {
        let actual = self.inner.driver.state().wavelength;
        if let Some(nm) = actual {
            self.publish(PanelEvent::WavelengthChanged(nm));
        }
    }

    /// Query and publish the wavelength and its bounds.
    pub async fn read_wavelength(&self) -> Option<i64> {
        info!("Reading current wavelength from device {}...", self.device_name());
        let nm = match self.inner.driver.wavelength().await {
            Ok(nm) => nm,
            Err(e) => {
                error!("An error occurred while reading the wavelength from this device: {e}");
                return None;
            }
        };
        self.publish(PanelEvent::WavelengthChanged(nm));
        match self.inner.driver.wavelength_bounds().await {
            Ok((min, max)) => self.publish(PanelEvent::WavelengthBounds { min, max }),
            Err(e) => warn!("Could not read the wavelength bounds: {e}"),
        }
        info!("Current wavelength is {nm}.");
        Some(nm)
    }

    /// Step the power range by one rung; `+1` up, `-1` down.
    ///
    /// Refused while auto-ranging is on.
    pub async fn change_power_range(&self, direction: i32) -> bool {
        let direction = match RangeDirection::try_from(direction) {
            Ok(direction) => direction,
            Err(e) => {
                error!("{e}");
                return false;
            }
        };
        let auto = self.inner.driver.state().auto_power_range;
        if auto == Some(true) {
            warn!("The power range cannot be changed manually while auto-ranging is ON.");
            return false;
        }

        info!("Trying to {} the power range...", direction.verb());
        let result = self.inner.driver.step_power_range(direction, None).await;
        let ok = match result {
            Ok(outcome) if outcome.changed() => true,
            Ok(_) => {
                info!("The power range cannot be {}d any further.", direction.verb());
                true
            }
            Err(e) => {
                error!("An error occurred while changing the power range: {e}");
                false
            }
        };
        self.read_power_range().await;
        ok
    }

    /// Query and publish the power range.
    pub async fn read_power_range(&self) -> Option<f64> {
        info!("Reading current power range from device {}...", self.device_name());
        match self.inner.driver.power_range().await {
            Ok(range) => {
                self.publish(PanelEvent::PowerRangeChanged(range));
                info!("Current power range is {range} W.");
                Some(range)
            }
            Err(e) => {
                error!("An error occurred while reading the power range from this device: {e}");
                None
            }
        }
    }

    /// Switch auto-ranging and remember the choice.
    pub async fn set_auto_power_range(&self, enabled: bool) -> bool {
        info!(
            "Setting the auto-ranging function to {} for the device {}...",
            on_off(enabled),
            self.device_name()
        );
        let ok = match self.inner.driver.set_auto_power_range(enabled).await {
            Ok(()) => {
                info!("Setting changed successfully.");
                self.inner.settings.update(|s| s.auto_power_range = enabled);
                self.publish(PanelEvent::AutoPowerRangeChanged(enabled));
                true
            }
            Err(e) => {
                error!("An error occurred while setting the auto-ranging status: {e}");
                false
            }
        };
        self.read_power_range().await;
        ok
    }

    /// Query and publish the auto-range flag.
    pub async fn read_auto_power_range(&self) -> Option<bool> {
        info!(
            "Reading the status of the auto-ranging function for the device {}...",
            self.device_name()
        );
        match self.inner.driver.auto_power_range().await {
            Ok(enabled) => {
                info!("The auto-ranging function is currently set to {}.", on_off(enabled));
                self.inner.settings.update(|s| s.auto_power_range = enabled);
                self.publish(PanelEvent::AutoPowerRangeChanged(enabled));
                Some(enabled)
            }
            Err(e) => {
                error!("An error occurred while reading the auto-ranging status: {e}");
                None
            }
        }
    }

    /// Zero the console. Polls during zeroing yield blank readings.
    pub async fn zero(&self) -> bool {
        info!("Zero-ing the device {}...", self.device_name());
        match self.inner.driver.zero().await {
            Ok(()) => {
                info!("Device was successfully zeroed.");
                true
            }
            Err(e) => {
                error!("An error occurred while zero-ing this device: {e}");
                false
            }
        }
    }

    /// Register or remove the action fired after every acquisition.
    pub fn set_trigger(&self, trigger: Option<Trigger>) {
        if trigger.is_some() {
            info!("Creating a trigger for this device...");
        }
        *self.inner.trigger.write() = trigger;
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    /// Start continuous reading: one poll now, then one every `refresh_time`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start_reading(&self) -> bool {
        if !self.inner.driver.is_connected() {
            error!("No device is connected.");
            return false;
        }
        let generation = {
            let mut session = self.inner.session.lock();
            session.continuous_read = true;
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.set_reading_state(ReadingState::Reading);
        info!("Starting reading from device {}...", self.device_name());

        if !self.poll().await {
            return true;
        }
        let controller = self.clone();
        tokio::spawn(controller.poll_loop(generation).in_current_span());
        true
    }

    async fn poll_loop(self, generation: u64) {
        loop {
            tokio::time::sleep(self.refresh_interval()).await;
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "Superseded poll loop exiting");
                return;
            }
            if !self.poll().await {
                return;
            }
        }
    }

    fn refresh_interval(&self) -> Duration {
        let seconds = self.refresh_time();
        refresh_interval(seconds).unwrap_or_else(|| {
            warn!("Invalid refresh time {seconds} s, polling every {FALLBACK_REFRESH_INTERVAL:?}.");
            FALLBACK_REFRESH_INTERVAL
        })
    }

    /// Stop acquiring; samples are kept.
    pub fn pause_reading(&self) {
        self.inner.session.lock().continuous_read = false;
        info!("Paused reading from device {}.", self.device_name());
        self.set_reading_state(ReadingState::Paused);
    }

    /// Stop acquiring and discard all samples.
    pub async fn stop_reading(&self) {
        {
            let mut session = self.inner.session.lock();
            session.continuous_read = false;
            session.stored_data.clear();
        }
        // Not reading any more, so this only reports the empty history
        self.poll().await;
        info!(
            "Stopped reading from device {}. All stored data have been deleted.",
            self.device_name()
        );
        self.set_reading_state(ReadingState::Stopped);
    }

    /// One poll cycle. Returns whether the loop should keep going.
    ///
    /// Without continuous reading this only publishes the history length.
    pub async fn poll(&self) -> bool {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        if !self.is_reading() {
            self.publish_history();
            return false;
        }

        let result = self.inner.driver.power().await;

        let mut session = self.inner.session.lock();
        // Paused, stopped or restarted while the read was on the bus
        if !session.continuous_read || self.inner.generation.load(Ordering::SeqCst) != generation {
            drop(session);
            debug!(generation, "Dropping a reading that outlived its poll");
            return false;
        }
        match result {
            Ok(reading) => {
                if let Some(sample) = PowerSample::from_reading(&reading) {
                    session.stored_data.push(sample);
                }
                session.last_reading = reading.clone();
                drop(session);
                self.publish_history();
                self.publish(PanelEvent::NewData(reading));

                let trigger = self.inner.trigger.read().clone();
                if let Some(trigger) = trigger {
                    trigger.fire();
                }
                true
            }
            Err(PmError::NotConnected) => {
                session.continuous_read = false;
                drop(session);
                error!("No device is connected.");
                self.publish_history();
                self.set_reading_state(ReadingState::Stopped);
                false
            }
            Err(e) => {
                drop(session);
                warn!("An error occurred while reading the power: {e}");
                self.publish_history();
                self.publish(PanelEvent::ReadFailed(e.to_string()));
                true
            }
        }
    }

    fn publish_history(&self) {
        let count = self.inner.session.lock().stored_data.len();
        self.publish(PanelEvent::HistoryUpdated(count));
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PanelSettings;
    use pm_driver_mock::{MockResourceManager, SimulatedConsole};
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    const ADDR: &str = "USB0::0x1313::0x8078::P0012345::INSTR";
    const LABEL: &str = "Thorlabs,PM100D,P0012345,2.4.0 --> USB0::0x1313::0x8078::P0012345::INSTR";

    fn controller_with(console: SimulatedConsole, settings: SettingsStore) -> (MockResourceManager, PowerMeterController) {
        let rm = MockResourceManager::new().with_console(ADDR, console);
        let driver = Arc::new(Pm100xDriver::new(Arc::new(rm.clone())));
        (rm, PowerMeterController::new(driver, settings))
    }

    async fn connected(console: SimulatedConsole) -> (MockResourceManager, PowerMeterController) {
        let (rm, controller) = controller_with(console, SettingsStore::default());
        controller.refresh_list_devices().await;
        assert!(controller.connect_device(LABEL).await);
        (rm, controller)
    }

    fn drain(rx: &mut broadcast::Receiver<PanelEvent>) -> Vec<PanelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_connect_initialises_panel() {
        let (rm, controller) = controller_with(
            SimulatedConsole::pm100d().with_auto_range(false),
            SettingsStore::default(),
        );
        let mut rx = controller.subscribe();

        let devices = controller.refresh_list_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].label(), LABEL);
        assert!(controller.connect_device(LABEL).await);

        assert_eq!(controller.connection_state(), ConnectionState::Connected);
        assert_eq!(controller.reading_state(), ReadingState::Reading);
        assert_eq!(controller.connected_device().as_deref(), Some(ADDR));
        // Persisted auto-range is ON by default and gets applied
        assert_eq!(rm.console(ADDR).map(|c| c.auto_range()), Some(true));

        let events = drain(&mut rx);
        assert!(events.contains(&PanelEvent::ConnectionChanged(ConnectionState::Connecting)));
        assert!(events.contains(&PanelEvent::ConnectionChanged(ConnectionState::Connected)));
        assert!(events.contains(&PanelEvent::WavelengthChanged(633)));
        assert!(events.contains(&PanelEvent::WavelengthBounds { min: 350, max: 1100 }));
        assert!(events.contains(&PanelEvent::AutoPowerRangeChanged(true)));
        assert!(events.contains(&PanelEvent::PowerRangeChanged(1.1e-3)));
        assert!(events.contains(&PanelEvent::ReadingChanged(ReadingState::Reading)));
        assert!(events.contains(&PanelEvent::NewData(PowerReading::new(2.5e-4, "W"))));

        assert!(logs_contain("Looking for devices..."));
        assert!(logs_contain("Found 1 devices."));
        assert!(logs_contain("Connected to device USB0::0x1313::0x8078::P0012345::INSTR."));
        assert!(logs_contain("Starting reading from device"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_rejects_empty_and_unknown() {
        let (_rm, controller) = controller_with(SimulatedConsole::pm100d(), SettingsStore::default());

        assert!(!controller.connect_device("  ").await);
        assert!(logs_contain("No valid device has been selected."));
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);

        // Not scanned yet, so the address is unknown
        assert!(!controller.connect_device(ADDR).await);
        assert!(logs_contain("Error: The specified address is not a valid device address"));
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_at_refresh_time() {
        let (_rm, controller) = connected(SimulatedConsole::pm100d()).await;
        assert_eq!(controller.refresh_time(), 0.2);

        // Polls at 0, 0.2 and 0.4 s
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(controller.stored_data().len(), 3);
        assert_eq!(controller.output(), Output { power: Some(2.5e-4), unit: "W".into() });
        assert_eq!(controller.current_power_string(), "2.50e-04 W");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_and_stop_discards() {
        let (_rm, controller) = connected(SimulatedConsole::pm100d()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        controller.pause_reading();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.stored_data().len(), 3);
        assert_eq!(controller.reading_state(), ReadingState::Paused);

        let mut rx = controller.subscribe();
        controller.stop_reading().await;
        assert!(controller.stored_data().is_empty());
        assert!(!controller.is_reading());
        assert_eq!(
            drain(&mut rx),
            vec![
                PanelEvent::HistoryUpdated(0),
                PanelEvent::ReadingChanged(ReadingState::Stopped)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_double_poll() {
        let (_rm, controller) = connected(SimulatedConsole::pm100d()).await;

        controller.pause_reading();
        assert!(controller.start_reading().await);
        tokio::time::sleep(Duration::from_millis(500)).await;

        // 1 from connect, then 0, 0.2, 0.4 s of the new loop
        assert_eq!(controller.stored_data().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_read_discards_it() {
        let (rm, controller) = connected(SimulatedConsole::pm100d()).await;
        rm.set_query_delay(ADDR, Duration::from_millis(100));

        // The loop's first read starts at 0.2 s and is still on the bus
        tokio::time::sleep(Duration::from_millis(250)).await;
        let mut rx = controller.subscribe();
        controller.stop_reading().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(controller.stored_data().is_empty());
        assert!(!controller.is_reading());
        assert_eq!(
            drain(&mut rx),
            vec![
                PanelEvent::HistoryUpdated(0),
                PanelEvent::ReadingChanged(ReadingState::Stopped)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_or_restart_during_read() {
        let count = Arc::new(AtomicUsize::new(0));
        let (rm, controller) = connected(SimulatedConsole::pm100d()).await;
        controller.set_trigger(Some(Trigger::immediate({
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })));
        rm.set_query_delay(ADDR, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(250)).await;
        let mut rx = controller.subscribe();
        controller.pause_reading();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(controller.stored_data().len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!drain(&mut rx).iter().any(|e| matches!(e, PanelEvent::NewData(_))));

        // Restart while the old loop's read is in flight: only the new poll counts
        assert!(controller.start_reading().await);
        tokio::time::sleep(Duration::from_millis(250)).await;
        let before = controller.stored_data().len();
        assert!(controller.start_reading().await);
        assert_eq!(controller.stored_data().len(), before + 1);
        controller.pause_reading();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_reconnect_keeps_connection() {
        let (rm, controller) = connected(SimulatedConsole::pm100d()).await;
        let mut rx = controller.subscribe();

        assert!(!controller.connect_device(LABEL).await);
        assert!(logs_contain("A powermeter is already connected"));
        assert_eq!(controller.connection_state(), ConnectionState::Connected);
        assert_eq!(controller.connected_device().as_deref(), Some(ADDR));
        assert!(controller.is_reading());
        assert_eq!(rm.open_sessions(ADDR), 1);

        let states: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                PanelEvent::ConnectionChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);

        // Polling carries on
        let before = controller.stored_data().len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(controller.stored_data().len() > before);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_oversized_refresh_time_rejected() {
        let (_rm, controller) = connected(SimulatedConsole::pm100d()).await;

        assert!(!controller.set_refresh_time("1e30"));
        assert!(logs_contain("The refresh time is too large."));
        assert_eq!(controller.refresh_time(), 0.2);

        // Polls at 0.2 and 0.4 s
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(controller.stored_data().len(), 3);
        assert!(controller.is_reading());

        // Large but representable intervals are fine
        assert!(controller.set_refresh_time("86400"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_start_without_device() {
        let (_rm, controller) = controller_with(SimulatedConsole::pm100d(), SettingsStore::default());

        assert!(!controller.start_reading().await);
        assert!(!controller.is_reading());
        assert!(logs_contain("No device is connected."));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_refresh_time_validation() {
        let (_rm, controller) = controller_with(SimulatedConsole::pm100d(), SettingsStore::default());
        let mut rx = controller.subscribe();

        assert!(!controller.set_refresh_time("fast"));
        assert!(logs_contain("The refresh time must be a valid number."));
        assert!(!controller.set_refresh_time("0.0005"));
        assert!(logs_contain("The refresh time must be positive and >= 1ms."));
        assert!(!controller.set_refresh_time("NaN"));
        assert_eq!(controller.refresh_time(), 0.2);

        assert!(controller.set_refresh_time("0.2"));
        assert!(controller.set_refresh_time(" 0.05 "));
        assert_eq!(controller.refresh_time(), 0.05);
        assert!(logs_contain("The refresh time is now 0.05 s."));

        assert_eq!(
            drain(&mut rx),
            vec![
                PanelEvent::RefreshTimeChanged(0.2),
                PanelEvent::RefreshTimeChanged(0.2),
                PanelEvent::RefreshTimeChanged(0.2),
                PanelEvent::RefreshTimeChanged(0.05),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_wavelength_validation_reverts() {
        let (rm, controller) = connected(SimulatedConsole::pm100d()).await;
        controller.pause_reading();
        let mut rx = controller.subscribe();

        assert!(!controller.set_wavelength("red").await);
        assert!(logs_contain("The wavelength must be a valid number."));
        assert!(!controller.set_wavelength("1200").await);
        assert!(logs_contain(
            "An error occurred while setting the wavelength: Wavelength must be between 350 and 1100."
        ));
        assert_eq!(
            drain(&mut rx),
            vec![PanelEvent::WavelengthChanged(633), PanelEvent::WavelengthChanged(633)]
        );

        rm.clear_commands();
        assert!(controller.set_wavelength("633").await);
        assert_eq!(rm.commands(ADDR), vec!["SENS:CORR:WAV?"]);

        assert!(controller.set_wavelength("1064").await);
        assert!(logs_contain("Wavelength set correctly."));
        assert_eq!(rm.console(ADDR).map(|c| c.wavelength()), Some(1064));
        let events = drain(&mut rx);
        assert!(events.contains(&PanelEvent::WavelengthChanged(1064)));
        assert!(events.iter().any(|e| matches!(e, PanelEvent::PowerRangeChanged(_))));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_manual_range_refused_while_auto() {
        let (rm, controller) = connected(SimulatedConsole::pm100d()).await;
        controller.pause_reading();
        rm.clear_commands();

        assert!(!controller.change_power_range(1).await);
        assert!(logs_contain("cannot be changed manually while auto-ranging is ON"));
        assert!(rm.commands(ADDR).is_empty());

        assert!(controller.set_auto_power_range(false).await);
        assert!(controller.change_power_range(1).await);
        assert!(logs_contain("Trying to increase the power range..."));
        assert_eq!(controller.read_power_range().await, Some(1.1e-2));

        assert!(!controller.change_power_range(0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_steps_stop_at_max() {
        let console = SimulatedConsole::pm100d().with_power_range(1.1e-1);
        let (_rm, controller) = controller_with(console, SettingsStore::in_memory(PanelSettings {
            auto_power_range: false,
            ..PanelSettings::default()
        }));
        controller.refresh_list_devices().await;
        assert!(controller.connect_device(ADDR).await);

        assert!(controller.change_power_range(1).await);
        assert_eq!(controller.read_power_range().await, Some(1.1e-1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_error_mid_poll_keeps_polling() {
        let (rm, controller) = connected(SimulatedConsole::pm100d()).await;
        let mut rx = controller.subscribe();

        rm.fail_command(ADDR, "measure:power?");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(drain(&mut rx).iter().any(|e| matches!(e, PanelEvent::ReadFailed(_))));
        assert!(controller.is_reading());
        let before = controller.stored_data().len();

        rm.clear_failures(ADDR);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(controller.stored_data().len() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_ends_poll_loop() {
        let (rm, controller) = connected(SimulatedConsole::pm100d()).await;

        assert_eq!(rm.console(ADDR).map(|c| c.is_remote()), Some(true));
        assert!(controller.disconnect_device().await);
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
        assert!(!controller.is_reading());
        assert_eq!(rm.open_sessions(ADDR), 0);
        assert_eq!(rm.console(ADDR).map(|c| c.is_remote()), Some(false));

        rm.clear_commands();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rm.commands(ADDR).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zeroing_readings_not_stored() {
        let console = SimulatedConsole::pm100d().with_zero_duration(Duration::from_secs(2));
        let (_rm, controller) = connected(console).await;
        let mut rx = controller.subscribe();

        let zeroing = tokio::spawn({
            let controller = controller.clone();
            async move { controller.zero().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(controller.stored_data().len(), 1);
        assert!(drain(&mut rx).contains(&PanelEvent::NewData(PowerReading::sentinel())));
        assert_eq!(controller.current_power_string(), " ");

        assert!(zeroing.await.unwrap());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(controller.stored_data().len() > 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_trigger_fires_per_acquisition() {
        let (_rm, controller) = connected(SimulatedConsole::pm100d()).await;
        let count = Arc::new(AtomicUsize::new(0));
        controller.set_trigger(Some(Trigger::immediate({
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })));
        assert!(logs_contain("Creating a trigger for this device..."));

        // Polls at 0.2, 0.4 and 0.6 s
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        controller.set_trigger(None);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_zero_and_close() {
        let (rm, controller) = connected(SimulatedConsole::pm100d()).await;

        assert!(controller.zero().await);
        assert!(logs_contain("Device was successfully zeroed."));
        assert_eq!(rm.console(ADDR).map(|c| c.zero_count()), Some(1));

        controller.close().await;
        assert!(logs_contain("Disconnected from device"));
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);

        // Closing twice is harmless
        controller.close().await;
        assert!(!controller.zero().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let store = SettingsStore::load(&path, PanelSettings::default()).unwrap();
        let (_rm, controller) = controller_with(SimulatedConsole::pm100d(), store);
        controller.refresh_list_devices().await;
        assert!(controller.connect_device(ADDR).await);

        assert!(controller.set_refresh_time("0.5"));
        assert!(controller.set_auto_power_range(false).await);

        let reloaded = SettingsStore::load(&path, PanelSettings::default()).unwrap();
        assert_eq!(
            reloaded.settings(),
            PanelSettings {
                refresh_time: 0.5,
                auto_power_range: false
            }
        );
    }
}
