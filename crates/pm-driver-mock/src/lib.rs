//! Simulated instrument bus for the PM100x panel
//!
//! This crate provides a stand-in for a VISA installation so the adapter and
//! the polling controller can be exercised without hardware.
//! All waiting uses `tokio::time::sleep`, so tests running on a paused clock
//! fast-forward through it.
//!
//! # Available Mocks
//!
//! - [`MockResourceManager`] - resource manager holding any mix of simulated
//!   consoles, foreign instruments and unreachable addresses
//! - [`SimulatedConsole`] - SCPI behavior of a PM100D / PM100A console,
//!   including range clamping onto a decade ladder and wavelength clamping
//!
//! # Failure Injection
//!
//! - addresses that refuse to open ([`MockResourceManager::with_unreachable`])
//! - per-command failures ([`MockResourceManager::fail_command`])
//! - whole-resource failures ([`MockResourceManager::fail_all`])
//! - bus enumeration failure ([`MockResourceManager::fail_listing`])
//!
//! Every command received is logged per address for byte-exact assertions.
//!
//! ```rust,ignore
//! use pm_driver_mock::{MockResourceManager, SimulatedConsole};
//!
//! let rm = MockResourceManager::new()
//!     .with_console("USB0::0x1313::0x8078::P0012345::INSTR", SimulatedConsole::pm100d())
//!     .with_foreign_device("GPIB0::5::INSTR", "KEYSIGHT,34465A,MY0001,A.02");
//! let driver = Pm100xDriver::new(Arc::new(rm.clone()));
//! ```

mod bus;
mod console;

pub use bus::{MockResourceManager, MockSession};
pub use console::{SimulatedConsole, DEFAULT_RANGES};
