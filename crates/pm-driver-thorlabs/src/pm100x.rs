//! Thorlabs PM100D / PM100A console adapter
//!
//! Protocol Overview:
//! - Format: SCPI over VISA (USB-TMC on both consoles)
//! - Queries return numbers in scientific notation (`+6.33000000E+02`)
//! - Power range: the console only accepts a fixed ladder of ranges and clamps
//!   any other value onto the smallest rung that still holds it
//!
//! Every property access is one bus transaction. The adapter keeps the last
//! value read for each property as a mirror ([`DeviceState`]); the mirrors are
//! only a cache and are reset on disconnect.
//!
//! # Usage
//!
//! ```rust,ignore
//! let driver = Pm100xDriver::with_model(rm, "PM100D")?;
//! for device in driver.discover().await? {
//!     println!("{}", device.label());
//! }
//! driver.connect("USB0::0x1313::0x8078::P0012345::INSTR").await?;
//! driver.set_wavelength(1064).await?;
//! let reading = driver.power().await?;
//! ```

use crate::models::Model;
use crate::range::{self, RangeDirection, StepOutcome};
use crate::scpi;
use parking_lot::RwLock;
use pm_core::bus::is_serial_address;
use pm_core::{
    BusError, DeviceDescriptor, InstrumentSession, PmError, PmResult, PowerReading,
    ResourceManager,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

/// Unit the consoles report power in.
pub const POWER_UNITS: &str = "W";

// =============================================================================
// DeviceState
// =============================================================================

/// Last-read values of the connected console.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// A session is open
    pub connected: bool,
    /// Address of the open session
    pub address: Option<String>,
    /// `*IDN?` answer at connection time
    pub identity: Option<String>,
    /// Model parsed from the identity
    pub model: Option<Model>,
    /// Wavelength in nm
    pub wavelength: Option<i64>,
    /// Lower wavelength bound at the current sensor, nm
    pub min_wavelength: Option<i64>,
    /// Upper wavelength bound at the current sensor, nm
    pub max_wavelength: Option<i64>,
    /// Last power reading (the blank sentinel while zeroing)
    pub power: PowerReading,
    /// Power range in W
    pub power_range: Option<f64>,
    /// Smallest rung at the current wavelength, W
    pub min_power_range: Option<f64>,
    /// Largest rung at the current wavelength, W
    pub max_power_range: Option<f64>,
    /// Auto-ranging flag as last read or written
    pub auto_power_range: Option<bool>,
}

/// Clears the zeroing flag when the zero command finishes, even on error.
struct ZeroingGuard<'a>(&'a AtomicBool);

impl<'a> ZeroingGuard<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ZeroingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type SharedSession = Mutex<Option<Box<dyn InstrumentSession>>>;

// =============================================================================
// Pm100xDriver
// =============================================================================

/// Adapter for one PM100x console.
///
/// All methods take `&self`; the open session sits behind an async mutex so a
/// driver can be shared (`Arc<Pm100xDriver>`) between the polling task and
/// user commands.
pub struct Pm100xDriver {
    resource_manager: Arc<dyn ResourceManager>,
    /// Only devices of this model are reported by discovery
    model_filter: Option<Model>,
    session: SharedSession,
    state: RwLock<DeviceState>,
    /// Result of the most recent discovery scan
    known_devices: RwLock<Vec<DeviceDescriptor>>,
    zeroing: AtomicBool,
}

impl Pm100xDriver {
    /// Driver accepting every supported model.
    pub fn new(resource_manager: Arc<dyn ResourceManager>) -> Self {
        Self {
            resource_manager,
            model_filter: None,
            session: Mutex::new(None),
            state: RwLock::new(DeviceState::default()),
            known_devices: RwLock::new(Vec::new()),
            zeroing: AtomicBool::new(false),
        }
    }

    /// Driver restricted to one model.
    ///
    /// # Errors
    /// [`PmError::UnsupportedModel`] if `model` is not in the model table.
    pub fn with_model(resource_manager: Arc<dyn ResourceManager>, model: &str) -> PmResult<Self> {
        let model: Model = model.parse()?;
        let mut driver = Self::new(resource_manager);
        driver.model_filter = Some(model);
        Ok(driver)
    }

    /// Snapshot of the mirror fields.
    pub fn state(&self) -> DeviceState {
        self.state.read().clone()
    }

    /// A session is open.
    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    /// Model of the connected console.
    pub fn model(&self) -> Option<Model> {
        self.state.read().model
    }

    /// Model requested at construction.
    pub fn model_filter(&self) -> Option<Model> {
        self.model_filter
    }

    /// Descriptors from the most recent [`Pm100xDriver::discover`].
    pub fn known_devices(&self) -> Vec<DeviceDescriptor> {
        self.known_devices.read().clone()
    }

    /// A zero command is in progress.
    pub fn is_zeroing(&self) -> bool {
        self.zeroing.load(Ordering::SeqCst)
    }

    /// Unit of [`Pm100xDriver::power_range`] and its bounds.
    pub fn power_units(&self) -> &'static str {
        POWER_UNITS
    }

    // -------------------------------------------------------------------------
    // Discovery and connection
    // -------------------------------------------------------------------------

    /// Scan the bus for supported consoles.
    ///
    /// Serial (`ASRL*`) addresses are never opened. Addresses that cannot be
    /// opened or do not answer `*IDN?` are skipped. The result replaces the
    /// cached device list that [`Pm100xDriver::connect`] checks against.
    ///
    /// # Errors
    /// Only if the resource manager cannot enumerate the bus.
    #[instrument(skip(self), err)]
    pub async fn discover(&self) -> PmResult<Vec<DeviceDescriptor>> {
        let addresses = self.resource_manager.list_resources().await?;
        let mut devices = Vec::new();

        for address in addresses {
            if is_serial_address(&address) {
                tracing::trace!(address = %address, "Skipping serial resource");
                continue;
            }

            let identity = match self.probe_identity(&address).await {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::debug!(address = %address, error = %e, "Ignoring unresponsive resource");
                    continue;
                }
            };

            let Some(model) = Model::match_identity(&identity) else {
                tracing::debug!(address = %address, identity = %identity, "Not a supported console");
                continue;
            };

            if self.model_filter.is_some_and(|wanted| wanted != model) {
                tracing::debug!(address = %address, model = %model, "Skipping console of other model");
                continue;
            }

            devices.push(DeviceDescriptor {
                address,
                identity,
                model: model.name().to_string(),
            });
        }

        tracing::debug!(count = devices.len(), "Discovery finished");
        *self.known_devices.write() = devices.clone();
        Ok(devices)
    }

    async fn probe_identity(&self, address: &str) -> Result<String, BusError> {
        let mut session = self.resource_manager.open_resource(address).await?;
        let identity = session.query(scpi::IDENTITY).await;
        if let Err(e) = session.close().await {
            tracing::debug!(address = %address, error = %e, "Failed to close probe session");
        }
        Ok(identity?.trim().to_string())
    }

    /// Open a session to `address` and read the full device state.
    ///
    /// Returns the console's identity string.
    ///
    /// # Errors
    /// - [`PmError::AlreadyConnected`] if a session is already open
    /// - [`PmError::InvalidAddress`] if `address` was not in the last
    ///   discovery result
    /// - [`PmError::Bus`] / [`PmError::InvalidResponse`] if opening or any of
    ///   the initial reads fail; the session is closed again
    #[instrument(skip(self), err)]
    pub async fn connect(&self, address: &str) -> PmResult<String> {
        let mut guard = self.session.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Err(PmError::AlreadyConnected(existing.address().to_string()));
        }

        let known = self
            .known_devices
            .read()
            .iter()
            .any(|device| device.address == address);
        if !known {
            return Err(PmError::InvalidAddress(address.to_string()));
        }

        let mut session = self.resource_manager.open_resource(address).await?;
        match read_initial_state(session.as_mut()).await {
            Ok(state) => {
                let identity = state.identity.clone().unwrap_or_default();
                tracing::info!(
                    address = %address,
                    identity = %identity,
                    wavelength = ?state.wavelength,
                    power_range = ?state.power_range,
                    "PM100x connected"
                );
                *self.state.write() = state;
                *guard = Some(session);
                Ok(identity)
            }
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::debug!(address = %address, error = %close_err, "Failed to close after failed connect");
                }
                *self.state.write() = DeviceState::default();
                Err(e)
            }
        }
    }

    /// Release the session.
    ///
    /// The adapter is disconnected afterwards even if closing the session
    /// reported an error.
    ///
    /// # Errors
    /// [`PmError::NotConnected`] if no session is open, or the close failure.
    #[instrument(skip(self), err)]
    pub async fn disconnect(&self) -> PmResult<()> {
        let mut guard = self.session.lock().await;
        let mut session = guard.take().ok_or(PmError::NotConnected)?;
        let result = session.close().await;
        *self.state.write() = DeviceState::default();
        self.zeroing.store(false, Ordering::SeqCst);
        tracing::info!(address = %session.address(), "PM100x disconnected");
        result.map_err(PmError::from)
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    /// Current power reading.
    ///
    /// While the console is being zeroed this returns the sentinel without
    /// touching the bus.
    pub async fn power(&self) -> PmResult<PowerReading> {
        if !self.is_connected() {
            self.state.write().power = PowerReading::sentinel();
            return Err(PmError::NotConnected);
        }
        if self.is_zeroing() {
            self.state.write().power = PowerReading::sentinel();
            return Ok(PowerReading::sentinel());
        }

        let value = scpi::parse_f64(scpi::MEASURE_POWER, &self.query(scpi::MEASURE_POWER).await?)?;
        let unit = self.query(scpi::POWER_UNIT).await?.trim().to_string();
        let reading = PowerReading::new(value, unit);
        tracing::trace!(power = %reading, "PM100x power");

        self.state.write().power = reading.clone();
        Ok(reading)
    }

    /// Calibration wavelength in nm.
    pub async fn wavelength(&self) -> PmResult<i64> {
        let nm = scpi::parse_wavelength(scpi::WAVELENGTH, &self.query(scpi::WAVELENGTH).await?)?;
        self.state.write().wavelength = Some(nm);
        Ok(nm)
    }

    /// Set the calibration wavelength.
    ///
    /// # Errors
    /// [`PmError::Validation`] if `nm` is negative or outside the console's
    /// wavelength bounds; nothing is sent in that case.
    #[instrument(skip(self), err)]
    pub async fn set_wavelength(&self, nm: i64) -> PmResult<i64> {
        if !self.is_connected() {
            return Err(PmError::NotConnected);
        }
        if nm < 0 {
            return Err(PmError::validation("Wavelength must be a positive number."));
        }

        let (min, max) = self.wavelength_bounds().await?;
        if nm < min || nm > max {
            return Err(PmError::validation(format!(
                "Wavelength must be between {min} and {max}."
            )));
        }

        self.write(&scpi::set_wavelength(nm)).await?;
        self.state.write().wavelength = Some(nm);
        tracing::debug!(wavelength = nm, "PM100x wavelength set");
        Ok(nm)
    }

    /// Query the console's wavelength limits, in nm.
    pub async fn read_wavelength_bounds(&self) -> PmResult<(i64, i64)> {
        let min = scpi::parse_wavelength(
            scpi::WAVELENGTH_MIN,
            &self.query(scpi::WAVELENGTH_MIN).await?,
        )?;
        let max = scpi::parse_wavelength(
            scpi::WAVELENGTH_MAX,
            &self.query(scpi::WAVELENGTH_MAX).await?,
        )?;
        let mut state = self.state.write();
        state.min_wavelength = Some(min);
        state.max_wavelength = Some(max);
        Ok((min, max))
    }

    /// Wavelength limits, from the mirror when known.
    pub async fn wavelength_bounds(&self) -> PmResult<(i64, i64)> {
        let cached = {
            let state = self.state.read();
            state.min_wavelength.zip(state.max_wavelength)
        };
        match cached {
            Some(bounds) => Ok(bounds),
            None => self.read_wavelength_bounds().await,
        }
    }

    /// Smallest power range, in W.
    pub async fn min_power_range(&self) -> PmResult<f64> {
        let value = scpi::parse_f64(
            scpi::POWER_RANGE_MIN,
            &self.query(scpi::POWER_RANGE_MIN).await?,
        )?;
        self.state.write().min_power_range = Some(value);
        Ok(value)
    }

    /// Largest power range, in W.
    pub async fn max_power_range(&self) -> PmResult<f64> {
        let value = scpi::parse_f64(
            scpi::POWER_RANGE_MAX,
            &self.query(scpi::POWER_RANGE_MAX).await?,
        )?;
        self.state.write().max_power_range = Some(value);
        Ok(value)
    }

    /// Current power range: the largest power measurable without saturating.
    pub async fn power_range(&self) -> PmResult<f64> {
        let value = scpi::parse_f64(scpi::POWER_RANGE, &self.query(scpi::POWER_RANGE).await?)?;
        self.state.write().power_range = Some(value);
        Ok(value)
    }

    /// Ask for a power range of at least `watts`.
    ///
    /// The console picks the closest range it supports; the returned value is
    /// the range read back afterwards.
    ///
    /// # Errors
    /// [`PmError::Validation`] if `watts` is negative or not finite.
    #[instrument(skip(self), err)]
    pub async fn set_power_range(&self, watts: f64) -> PmResult<f64> {
        if !self.is_connected() {
            return Err(PmError::NotConnected);
        }
        if !watts.is_finite() {
            return Err(PmError::validation("Value of power_range must be a number."));
        }
        if watts < 0.0 {
            return Err(PmError::validation("Power must be a positive number."));
        }

        self.write(&scpi::set_power_range(watts)).await?;
        let actual = self.power_range().await?;
        if actual != watts {
            tracing::debug!(requested = watts, actual, "PM100x clamped power range");
        }
        Ok(actual)
    }

    /// Whether the console picks its range itself.
    pub async fn auto_power_range(&self) -> PmResult<bool> {
        let enabled = scpi::parse_flag(scpi::AUTO_RANGE, &self.query(scpi::AUTO_RANGE).await?)?;
        self.state.write().auto_power_range = Some(enabled);
        Ok(enabled)
    }

    /// Switch auto-ranging on or off.
    #[instrument(skip(self), err)]
    pub async fn set_auto_power_range(&self, enabled: bool) -> PmResult<()> {
        self.write(scpi::set_auto_range(enabled)).await?;
        self.state.write().auto_power_range = Some(enabled);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Zero the console against the current (dark) input.
    ///
    /// Power reads issued while this runs return the sentinel.
    #[instrument(skip(self), err)]
    pub async fn zero(&self) -> PmResult<()> {
        if !self.is_connected() {
            return Err(PmError::NotConnected);
        }
        let _zeroing = ZeroingGuard::engage(&self.zeroing);
        self.write(scpi::ZERO).await?;
        tracing::info!("PM100x zeroed");
        Ok(())
    }

    /// Move one rung up or down the power-range ladder.
    ///
    /// Starting from `previous_target` (or the current range), the target is
    /// multiplied or divided by [`range::RANGE_STEP_FACTOR`] and sent to the
    /// console. If the range read back is still the one in effect before the
    /// step, the next attempt starts from the last target. Stepping stops
    /// without touching the console once the next target falls outside the
    /// console's range bounds.
    #[instrument(skip(self), err)]
    pub async fn step_power_range(
        &self,
        direction: RangeDirection,
        previous_target: Option<f64>,
    ) -> PmResult<StepOutcome> {
        if !self.is_connected() {
            return Err(PmError::NotConnected);
        }

        let (min_range, max_range) = self.power_range_bounds().await?;
        let cached_range = self.state.read().power_range;
        let before = match cached_range {
            Some(range) => range,
            None => self.power_range().await?,
        };

        let mut start = previous_target.unwrap_or(before);
        for _ in 0..range::MAX_STEP_ATTEMPTS {
            let target = direction.apply(start);
            if range::out_of_bounds(target, min_range, max_range) {
                tracing::debug!(
                    direction = %direction,
                    target,
                    range = before,
                    "PM100x power range at boundary"
                );
                return Ok(StepOutcome::AtBoundary { range: before });
            }

            let actual = self.set_power_range(target).await?;
            if actual != before {
                tracing::debug!(from = before, to = actual, "PM100x power range stepped");
                return Ok(StepOutcome::Changed {
                    from: before,
                    to: actual,
                });
            }
            start = target;
        }

        tracing::warn!(
            direction = %direction,
            range = before,
            "PM100x power range did not change after {} attempts",
            range::MAX_STEP_ATTEMPTS
        );
        Ok(StepOutcome::AtBoundary { range: before })
    }

    /// Power range bounds, from the mirror when known.
    async fn power_range_bounds(&self) -> PmResult<(f64, f64)> {
        let cached = {
            let state = self.state.read();
            state.min_power_range.zip(state.max_power_range)
        };
        match cached {
            Some(bounds) => Ok(bounds),
            None => Ok((self.min_power_range().await?, self.max_power_range().await?)),
        }
    }

    // -------------------------------------------------------------------------
    // Bus access
    // -------------------------------------------------------------------------

    async fn query(&self, command: &str) -> PmResult<String> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(PmError::NotConnected)?;
        let response = session.query(command).await?;
        tracing::trace!(cmd = %command, response = %response.trim(), "PM100x query");
        Ok(response)
    }

    async fn write(&self, command: &str) -> PmResult<()> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(PmError::NotConnected)?;
        session.write(command).await?;
        tracing::trace!(cmd = %command, "PM100x write");
        Ok(())
    }
}

/// Query a freshly opened session for everything the mirrors hold.
async fn read_initial_state(session: &mut dyn InstrumentSession) -> PmResult<DeviceState> {
    async fn ask(session: &mut dyn InstrumentSession, command: &str) -> PmResult<String> {
        Ok(session.query(command).await?)
    }

    let identity = ask(session, scpi::IDENTITY).await?.trim().to_string();
    let model = Model::tag_from_identity(&identity);

    let wavelength = scpi::parse_wavelength(scpi::WAVELENGTH, &ask(session, scpi::WAVELENGTH).await?)?;
    let min_wavelength = scpi::parse_wavelength(
        scpi::WAVELENGTH_MIN,
        &ask(session, scpi::WAVELENGTH_MIN).await?,
    )?;
    let max_wavelength = scpi::parse_wavelength(
        scpi::WAVELENGTH_MAX,
        &ask(session, scpi::WAVELENGTH_MAX).await?,
    )?;

    let power = scpi::parse_f64(scpi::MEASURE_POWER, &ask(session, scpi::MEASURE_POWER).await?)?;
    let unit = ask(session, scpi::POWER_UNIT).await?.trim().to_string();

    let min_power_range = scpi::parse_f64(
        scpi::POWER_RANGE_MIN,
        &ask(session, scpi::POWER_RANGE_MIN).await?,
    )?;
    let max_power_range = scpi::parse_f64(
        scpi::POWER_RANGE_MAX,
        &ask(session, scpi::POWER_RANGE_MAX).await?,
    )?;
    let auto_power_range = scpi::parse_flag(scpi::AUTO_RANGE, &ask(session, scpi::AUTO_RANGE).await?)?;
    let power_range = scpi::parse_f64(scpi::POWER_RANGE, &ask(session, scpi::POWER_RANGE).await?)?;

    Ok(DeviceState {
        connected: true,
        address: Some(session.address().to_string()),
        identity: Some(identity),
        model,
        wavelength: Some(wavelength),
        min_wavelength: Some(min_wavelength),
        max_wavelength: Some(max_wavelength),
        power: PowerReading::new(power, unit),
        power_range: Some(power_range),
        min_power_range: Some(min_power_range),
        max_power_range: Some(max_power_range),
        auto_power_range: Some(auto_power_range),
    })
}
