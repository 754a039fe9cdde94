//! VISA bus backend for USB/GPIB/Ethernet instruments
//!
//! Wraps the `visa-rs` crate. VISA calls are blocking, so every call runs on
//! Tokio's blocking pool via `spawn_blocking`.
//!
//! Supports resource strings like:
//! - "USB0::0x1313::0x8078::P0012345::INSTR" (PM100D over USB-TMC)
//! - "GPIB0::1::INSTR"
//! - "TCPIP0::192.168.1.100::INSTR"
//!
//! Without the `instrument_visa` feature, [`VisaResourceManager::new`] fails
//! with [`BusError::FeatureNotEnabled`] so the binary still builds on machines
//! without a VISA runtime.

#[cfg(feature = "instrument_visa")]
use pm_core::BusError;
use std::time::Duration;

/// Default I/O timeout for opened sessions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Line terminator appended to every command.
pub const WRITE_TERMINATOR: &str = "\n";

#[cfg(not(feature = "instrument_visa"))]
const FEATURE: &str = "instrument_visa";

#[cfg(feature = "instrument_visa")]
pub use real::VisaResourceManager;

#[cfg(not(feature = "instrument_visa"))]
pub use disabled::VisaResourceManager;

#[cfg(feature = "instrument_visa")]
fn join_error(address: &str, e: tokio::task::JoinError) -> BusError {
    BusError::Io {
        address: address.to_string(),
        message: format!("VISA worker task failed: {e}"),
    }
}

#[cfg(feature = "instrument_visa")]
mod real {
    use super::{join_error, DEFAULT_TIMEOUT, WRITE_TERMINATOR};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pm_core::{BusError, InstrumentSession, ResourceManager};
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Write};
    use std::sync::Arc;
    use std::time::Duration;
    use visa_rs::enums::gpib::RenMode;
    use visa_rs::prelude::*;

    /// Resource manager backed by the system VISA library.
    pub struct VisaResourceManager {
        rm: Arc<Mutex<DefaultRM>>,
        timeout: Duration,
    }

    impl VisaResourceManager {
        /// Open the default VISA resource manager.
        pub fn new() -> Result<Self, BusError> {
            let rm = DefaultRM::new()
                .map_err(|e| BusError::ResourceManager(format!("Failed to open VISA resource manager: {e}")))?;
            Ok(Self {
                rm: Arc::new(Mutex::new(rm)),
                timeout: DEFAULT_TIMEOUT,
            })
        }

        /// Set the I/O timeout of sessions opened from now on.
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }
    }

    fn to_visa_string(text: &str) -> Result<VisaString, String> {
        CString::new(text)
            .map(VisaString::from)
            .map_err(|e| e.to_string())
    }

    #[async_trait]
    impl ResourceManager for VisaResourceManager {
        async fn list_resources(&self) -> Result<Vec<String>, BusError> {
            let rm = Arc::clone(&self.rm);
            tokio::task::spawn_blocking(move || {
                let rm = rm.lock();
                let expr = to_visa_string("?*::INSTR").map_err(BusError::ResourceManager)?;
                let mut list = rm
                    .find_res_list(&expr)
                    .map_err(|e| BusError::ResourceManager(e.to_string()))?;
                let mut addresses = Vec::new();
                while let Some(resource) = list
                    .find_next()
                    .map_err(|e| BusError::ResourceManager(e.to_string()))?
                {
                    addresses.push(resource.to_string());
                }
                Ok(addresses)
            })
            .await
            .map_err(|e| join_error("", e))?
        }

        async fn open_resource(&self, address: &str) -> Result<Box<dyn InstrumentSession>, BusError> {
            let rm = Arc::clone(&self.rm);
            let timeout = self.timeout;
            let owned = address.to_string();
            let instrument = tokio::task::spawn_blocking(move || {
                let open_error = |message: String| BusError::Open {
                    address: owned.clone(),
                    message,
                };
                let resource = to_visa_string(&owned).map_err(open_error)?;
                rm.lock()
                    .open(&resource, AccessMode::NO_LOCK, timeout)
                    .map_err(|e| open_error(e.to_string()))
            })
            .await
            .map_err(|e| join_error(address, e))??;

            tracing::debug!(address = %address, "VISA session opened");
            Ok(Box::new(VisaSession {
                address: address.to_string(),
                instrument: Arc::new(Mutex::new(Some(instrument))),
                _rm: Arc::clone(&self.rm),
            }))
        }
    }

    /// One open VISA instrument.
    pub struct VisaSession {
        address: String,
        instrument: Arc<Mutex<Option<Instrument>>>,
        /// Sessions must not outlive their resource manager
        _rm: Arc<Mutex<DefaultRM>>,
    }

    impl VisaSession {
        async fn run<T, F>(&self, op: F) -> Result<T, BusError>
        where
            T: Send + 'static,
            F: FnOnce(&mut Instrument, &str) -> Result<T, BusError> + Send + 'static,
        {
            let instrument = Arc::clone(&self.instrument);
            let address = self.address.clone();
            tokio::task::spawn_blocking(move || {
                let mut guard = instrument.lock();
                let instr = guard.as_mut().ok_or_else(|| BusError::Closed(address.clone()))?;
                op(instr, &address)
            })
            .await
            .map_err(|e| join_error(&self.address, e))?
        }
    }

    fn io_error(address: &str, e: std::io::Error) -> BusError {
        if e.kind() == std::io::ErrorKind::TimedOut {
            BusError::Timeout {
                address: address.to_string(),
                command: String::new(),
            }
        } else {
            BusError::Io {
                address: address.to_string(),
                message: e.to_string(),
            }
        }
    }

    #[async_trait]
    impl InstrumentSession for VisaSession {
        fn address(&self) -> &str {
            &self.address
        }

        async fn query(&mut self, command: &str) -> Result<String, BusError> {
            let line = format!("{command}{WRITE_TERMINATOR}");
            let command = command.to_string();
            self.run(move |instr, address| {
                instr
                    .write_all(line.as_bytes())
                    .map_err(|e| io_error(address, e))?;
                let mut response = String::new();
                BufReader::new(&*instr)
                    .read_line(&mut response)
                    .map_err(|e| match io_error(address, e) {
                        BusError::Timeout { address, .. } => BusError::Timeout { address, command },
                        other => other,
                    })?;
                Ok(response.trim_end_matches(['\r', '\n']).to_string())
            })
            .await
        }

        async fn write(&mut self, command: &str) -> Result<(), BusError> {
            let line = format!("{command}{WRITE_TERMINATOR}");
            self.run(move |instr, address| {
                instr
                    .write_all(line.as_bytes())
                    .map_err(|e| io_error(address, e))
            })
            .await
        }

        async fn close(&mut self) -> Result<(), BusError> {
            let Some(instrument) = self.instrument.lock().take() else {
                return Err(BusError::Closed(self.address.clone()));
            };
            let address = self.address.clone();
            tokio::task::spawn_blocking(move || {
                // Back to front-panel control; dropping the instrument closes the session
                if let Err(e) = instrument.gpib_control_ren(RenMode::GpibRenDeassert) {
                    tracing::warn!(address = %address, "Could not release remote mode: {e}");
                }
            })
            .await
            .map_err(|e| join_error(&self.address, e))?;
            tracing::debug!(address = %self.address, "VISA session closed");
            Ok(())
        }
    }
}

#[cfg(not(feature = "instrument_visa"))]
mod disabled {
    use super::FEATURE;
    use async_trait::async_trait;
    use pm_core::{BusError, InstrumentSession, ResourceManager};
    use std::time::Duration;

    /// Placeholder used when VISA support is not compiled in.
    pub struct VisaResourceManager {
        _timeout: Duration,
    }

    impl VisaResourceManager {
        /// Always fails: rebuild with `--features instrument_visa`.
        pub fn new() -> Result<Self, BusError> {
            Err(BusError::FeatureNotEnabled(FEATURE.to_string()))
        }

        /// Accepted for API parity; unused.
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self._timeout = timeout;
            self
        }
    }

    #[async_trait]
    impl ResourceManager for VisaResourceManager {
        async fn list_resources(&self) -> Result<Vec<String>, BusError> {
            Err(BusError::FeatureNotEnabled(FEATURE.to_string()))
        }

        async fn open_resource(&self, _address: &str) -> Result<Box<dyn InstrumentSession>, BusError> {
            Err(BusError::FeatureNotEnabled(FEATURE.to_string()))
        }
    }
}

#[cfg(all(test, not(feature = "instrument_visa")))]
mod tests {
    use super::*;
    use pm_core::BusError;

    #[test]
    fn test_visa_disabled_reports_feature() {
        let err = VisaResourceManager::new().err();
        assert_eq!(err, Some(BusError::FeatureNotEnabled("instrument_visa".into())));
        assert!(err
            .map(|e| e.to_string())
            .unwrap_or_default()
            .contains("--features instrument_visa"));
    }
}
