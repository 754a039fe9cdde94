//! # PM100x Panel
//!
//! Control panel core for Thorlabs PM100D / PM100A optical power-meter
//! consoles. The library holds everything between the instrument bus and a
//! view layer; the `pm100x` binary is one such view (a terminal front end).
//!
//! ## Crate Structure
//!
//! - **`adapters`**: instrument bus backends. The VISA backend is compiled in
//!   with the `instrument_visa` feature; the simulated bus lives in the
//!   `pm-driver-mock` crate.
//! - **`config`**: `figment`-based configuration (`PanelConfig`) and the
//!   persisted user settings (`SettingsStore`).
//! - **`controller`**: the polling controller. Holds connection and reading
//!   state, runs the poll loop and publishes `PanelEvent`s.
//! - **`trigger`**: optional external action fired after every acquisition.
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.
//!
//! The device adapter itself is `pm_driver_thorlabs::Pm100xDriver`; errors,
//! readings and the event bus come from `pm_core`.

pub mod adapters;
pub mod config;
pub mod controller;
pub mod tracing_setup;
pub mod trigger;

pub use config::{PanelConfig, PanelSettings, SettingsStore};
pub use controller::{Output, PowerMeterController};
pub use trigger::Trigger;
