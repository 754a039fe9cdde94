//! Instrument bus abstraction.
//!
//! The adapter never talks to VISA directly. It goes through two small traits:
//!
//! - [`ResourceManager`]: enumerates addresses and opens sessions.
//! - [`InstrumentSession`]: one open resource, capable of `query`, `write` and
//!   `close`.
//!
//! Command strings are passed through untouched. Implementations append
//! whatever line terminator the physical bus needs and strip nothing from
//! responses except the terminator itself; callers trim.
//!
//! # Example
//!
//! ```rust,ignore
//! let rm: Arc<dyn ResourceManager> = Arc::new(MockResourceManager::new());
//! for address in rm.list_resources().await? {
//!     let mut session = rm.open_resource(&address).await?;
//!     let idn = session.query("*IDN?").await?;
//!     session.close().await?;
//! }
//! ```

use crate::error::BusError;
use async_trait::async_trait;

/// Enumerates and opens bus resources.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Every address currently visible on the bus, including serial lines.
    async fn list_resources(&self) -> Result<Vec<String>, BusError>;

    /// Open a session to `address`.
    async fn open_resource(&self, address: &str) -> Result<Box<dyn InstrumentSession>, BusError>;
}

/// One open connection to an instrument.
#[async_trait]
pub trait InstrumentSession: Send {
    /// Address this session was opened on.
    fn address(&self) -> &str;

    /// Send `command` and return the instrument's answer.
    async fn query(&mut self, command: &str) -> Result<String, BusError>;

    /// Send `command` without waiting for an answer.
    async fn write(&mut self, command: &str) -> Result<(), BusError>;

    /// Return the instrument to local control and release the resource.
    ///
    /// Further calls on a closed session fail with [`BusError::Closed`].
    async fn close(&mut self) -> Result<(), BusError>;
}

/// True for serial-line resources, which discovery never probes.
pub fn is_serial_address(address: &str) -> bool {
    address.starts_with("ASRL")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_addresses() {
        assert!(is_serial_address("ASRL1::INSTR"));
        assert!(is_serial_address("ASRL/dev/ttyUSB0::INSTR"));
        assert!(!is_serial_address("USB0::0x1313::0x8078::P0012345::INSTR"));
        assert!(!is_serial_address("GPIB0::5::INSTR"));
    }
}
