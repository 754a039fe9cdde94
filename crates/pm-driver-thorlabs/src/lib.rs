//! Thorlabs power-meter console driver for the PM100x panel.
//!
//! This crate provides the device adapter for Thorlabs PM100D and PM100A
//! consoles reached over any [`pm_core::ResourceManager`]:
//!
//! - [`Pm100xDriver`]: discovery, connection, typed properties, zeroing and
//!   power-range stepping
//! - [`Model`] and [`MODEL_IDENTIFIERS`]: the supported-model table
//! - [`RangeDirection`] and [`StepOutcome`]: the range stepping contract
//! - [`scpi`]: the console's command strings
//!
//! # Usage
//!
//! ```rust,ignore
//! use pm_driver_thorlabs::{Pm100xDriver, RangeDirection};
//!
//! let driver = Pm100xDriver::new(resource_manager);
//! let devices = driver.discover().await?;
//! driver.connect(&devices[0].address).await?;
//!
//! let reading = driver.power().await?;
//! driver.step_power_range(RangeDirection::Increase, None).await?;
//! ```

pub mod models;
pub mod pm100x;
pub mod range;
pub mod scpi;

pub use models::{Model, ModelIdentifier, MODEL_IDENTIFIERS};
pub use pm100x::{DeviceState, Pm100xDriver};
pub use range::{RangeDirection, StepOutcome, RANGE_STEP_FACTOR};
