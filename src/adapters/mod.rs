//! Instrument bus backends.
//!
//! Each backend implements `pm_core::ResourceManager`. The simulated backend
//! (`pm_driver_mock::MockResourceManager`) is re-exported here so callers can
//! pick either one from the same place.

pub mod visa;

pub use pm_driver_mock::{MockResourceManager, SimulatedConsole};
pub use visa::VisaResourceManager;

/// Address of the console the simulated bench exposes.
pub const SIMULATED_ADDRESS: &str = "USB0::0x1313::0x8078::P0012345::INSTR";

/// A simulated bench: one PM100D console, one foreign instrument and a serial
/// line, which is what a typical lab PC shows on its VISA bus.
pub fn simulated_bench() -> MockResourceManager {
    MockResourceManager::new()
        .with_console("ASRL1::INSTR", SimulatedConsole::pm100d())
        .with_console(
            SIMULATED_ADDRESS,
            SimulatedConsole::pm100d()
                .with_power(2.5e-4)
                .with_noise(0.01)
                .with_zero_duration(std::time::Duration::from_millis(500)),
        )
        .with_foreign_device("GPIB0::5::INSTR", "KEYSIGHT,34465A,MY0001,A.02")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_core::ResourceManager;

    #[tokio::test]
    async fn test_simulated_bench_lists_everything() {
        let bench = simulated_bench();
        let listed = bench.list_resources().await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().any(|a| a == SIMULATED_ADDRESS));
    }
}
