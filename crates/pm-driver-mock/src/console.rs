//! Simulated PM100x console.
//!
//! Answers the same SCPI subset the adapter uses:
//!
//! | command                          | behavior                                   |
//! |----------------------------------|--------------------------------------------|
//! | `*IDN?`                          | identity string                            |
//! | `measure:power?`                 | base power with optional uniform noise     |
//! | `power:dc:unit?`                 | `W`                                        |
//! | `SENS:CORR:WAV?` (`MIN`, `MAX`)  | wavelength and its bounds                  |
//! | `SENS:CORR:WAV <nm>`             | clamps into the bounds                     |
//! | `POW:DC:RANG?` (`MIN`, `MAX`)    | current rung and ladder ends               |
//! | `POW:DC:RANG <W>`                | smallest rung holding the request, auto off |
//! | `POW:DC:RANG:AUTO?` / `ON`/`OFF` | auto-range flag                            |
//! | `sense:correction:collect:zero`  | counts zero operations                     |

use pm_core::BusError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Default range ladder, in W.
pub const DEFAULT_RANGES: &[f64] = &[1.1e-7, 1.1e-6, 1.1e-5, 1.1e-4, 1.1e-3, 1.1e-2, 1.1e-1];

/// Scripted state of one console.
#[derive(Debug, Clone)]
pub struct SimulatedConsole {
    identity: String,
    unit: String,
    wavelength: i64,
    min_wavelength: i64,
    max_wavelength: i64,
    ranges: Vec<f64>,
    range_index: usize,
    auto_range: bool,
    base_power: f64,
    /// Peak relative deviation of a reading from `base_power`
    noise: f64,
    zero_duration: Duration,
    zero_count: usize,
    /// Front panel locked by bus traffic since the last session close
    remote: bool,
    rng: StdRng,
}

impl SimulatedConsole {
    /// PM100D at 633 nm, 350-1100 nm, on the 1.1 mW range with auto-range on.
    pub fn pm100d() -> Self {
        Self {
            identity: "Thorlabs,PM100D,P0012345,2.4.0".to_string(),
            unit: "W".to_string(),
            wavelength: 633,
            min_wavelength: 350,
            max_wavelength: 1100,
            ranges: DEFAULT_RANGES.to_vec(),
            range_index: 4,
            auto_range: true,
            base_power: 2.5e-4,
            noise: 0.0,
            zero_duration: Duration::ZERO,
            zero_count: 0,
            remote: false,
            rng: StdRng::seed_from_u64(0x100d),
        }
    }

    /// Same as [`SimulatedConsole::pm100d`] with a PM100A identity.
    pub fn pm100a() -> Self {
        Self::pm100d().with_identity("Thorlabs,PM100A,P0000042,1.5.2")
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_wavelength(mut self, nm: i64) -> Self {
        self.wavelength = nm;
        self
    }

    pub fn with_wavelength_bounds(mut self, min: i64, max: i64) -> Self {
        self.min_wavelength = min;
        self.max_wavelength = max;
        self
    }

    /// Replace the range ladder. `ranges` must be sorted ascending and non-empty;
    /// the current range becomes the rung closest to the old one.
    pub fn with_ranges(mut self, ranges: Vec<f64>) -> Self {
        let current = self.power_range();
        self.ranges = ranges;
        self.range_index = self.rung_for(current);
        self
    }

    /// Select the rung that holds `watts`.
    pub fn with_power_range(mut self, watts: f64) -> Self {
        self.range_index = self.rung_for(watts);
        self
    }

    pub fn with_auto_range(mut self, enabled: bool) -> Self {
        self.auto_range = enabled;
        self
    }

    /// Power the console sees, in W.
    pub fn with_power(mut self, watts: f64) -> Self {
        self.base_power = watts;
        self
    }

    /// Uniform relative noise, e.g. `0.01` for ±1 %.
    pub fn with_noise(mut self, fraction: f64) -> Self {
        self.noise = fraction.abs();
        self
    }

    /// Time the zero command takes.
    pub fn with_zero_duration(mut self, duration: Duration) -> Self {
        self.zero_duration = duration;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn wavelength(&self) -> i64 {
        self.wavelength
    }

    pub fn power_range(&self) -> f64 {
        self.ranges.get(self.range_index).copied().unwrap_or(0.0)
    }

    pub fn min_power_range(&self) -> f64 {
        self.ranges.first().copied().unwrap_or(0.0)
    }

    pub fn max_power_range(&self) -> f64 {
        self.ranges.last().copied().unwrap_or(0.0)
    }

    pub fn auto_range(&self) -> bool {
        self.auto_range
    }

    pub fn zero_count(&self) -> usize {
        self.zero_count
    }

    pub fn zero_duration(&self) -> Duration {
        self.zero_duration
    }

    /// Under remote control; closing the session returns it to local.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub(crate) fn set_remote(&mut self, remote: bool) {
        self.remote = remote;
    }

    /// Change the incoming power.
    pub fn set_power(&mut self, watts: f64) {
        self.base_power = watts;
    }

    /// Index of the smallest rung `>= watts`, or the top rung.
    fn rung_for(&self, watts: f64) -> usize {
        self.ranges
            .iter()
            .position(|&rung| rung >= watts)
            .unwrap_or_else(|| self.ranges.len().saturating_sub(1))
    }

    fn measure(&mut self) -> f64 {
        if self.noise > 0.0 {
            let deviation = self.rng.gen_range(-self.noise..=self.noise);
            self.base_power * (1.0 + deviation)
        } else {
            self.base_power
        }
    }

    /// Answer a query. Unknown queries time out, like a real console.
    pub(crate) fn answer(&mut self, address: &str, command: &str) -> Result<String, BusError> {
        let answer = match command.trim() {
            "*IDN?" => self.identity.clone(),
            "measure:power?" => format!("{:E}", self.measure()),
            "power:dc:unit?" => self.unit.clone(),
            "SENS:CORR:WAV?" => format!("{:E}", self.wavelength as f64),
            "SENS:CORR:WAV? MIN" => format!("{:E}", self.min_wavelength as f64),
            "SENS:CORR:WAV? MAX" => format!("{:E}", self.max_wavelength as f64),
            "POW:DC:RANG?" => format!("{:E}", self.power_range()),
            "POW:DC:RANG? MIN" => format!("{:E}", self.min_power_range()),
            "POW:DC:RANG? MAX" => format!("{:E}", self.max_power_range()),
            "POW:DC:RANG:AUTO?" => String::from(if self.auto_range { "1" } else { "0" }),
            _ => {
                return Err(BusError::Timeout {
                    address: address.to_string(),
                    command: command.to_string(),
                })
            }
        };
        Ok(answer)
    }

    /// Apply a write. Malformed or unknown commands raise a bus error.
    pub(crate) fn apply(&mut self, address: &str, command: &str) -> Result<(), BusError> {
        let undefined = || BusError::Io {
            address: address.to_string(),
            message: format!("Undefined header: '{command}'"),
        };

        let command = command.trim();
        if command == "sense:correction:collect:zero" {
            self.zero_count += 1;
            return Ok(());
        }
        if let Some(state) = command.strip_prefix("POW:DC:RANG:AUTO ") {
            self.auto_range = match state {
                "ON" => true,
                "OFF" => false,
                _ => return Err(undefined()),
            };
            return Ok(());
        }
        if let Some(value) = command.strip_prefix("POW:DC:RANG ") {
            let watts: f64 = value.parse().map_err(|_| undefined())?;
            self.range_index = self.rung_for(watts);
            self.auto_range = false;
            return Ok(());
        }
        if let Some(value) = command.strip_prefix("SENS:CORR:WAV ") {
            let nm: i64 = value.parse().map_err(|_| undefined())?;
            self.wavelength = nm.clamp(self.min_wavelength, self.max_wavelength);
            return Ok(());
        }
        Err(undefined())
    }
}

impl Default for SimulatedConsole {
    fn default() -> Self {
        Self::pm100d()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "USB0::0x1313::0x8078::P0012345::INSTR";

    #[test]
    fn test_range_clamps_to_ladder() {
        let mut console = SimulatedConsole::pm100d();
        assert!(console.auto_range());

        console.apply(ADDR, "POW:DC:RANG 5e-4").unwrap();
        assert_eq!(console.power_range(), 1.1e-3);
        assert!(!console.auto_range(), "Setting a range disables auto-range");

        console.apply(ADDR, "POW:DC:RANG 10").unwrap();
        assert_eq!(console.power_range(), 1.1e-1);

        console.apply(ADDR, "POW:DC:RANG 0").unwrap();
        assert_eq!(console.power_range(), 1.1e-7);
    }

    #[test]
    fn test_wavelength_answers() {
        let mut console = SimulatedConsole::pm100d();
        let answer = console.answer(ADDR, "SENS:CORR:WAV?").unwrap();
        assert_eq!(answer.parse::<f64>().unwrap(), 633.0);

        console.apply(ADDR, "SENS:CORR:WAV 2000").unwrap();
        assert_eq!(console.wavelength(), 1100);
    }

    #[test]
    fn test_noise_stays_within_bounds() {
        let mut console = SimulatedConsole::pm100d().with_power(1e-3).with_noise(0.01);
        for _ in 0..100 {
            let value: f64 = console.answer(ADDR, "measure:power?").unwrap().parse().unwrap();
            assert!((value - 1e-3).abs() <= 1e-5 * 1.0001);
        }
    }

    #[test]
    fn test_unknown_commands() {
        let mut console = SimulatedConsole::pm100d();
        assert!(matches!(
            console.answer(ADDR, "SYST:ERR?"),
            Err(BusError::Timeout { .. })
        ));
        assert!(matches!(
            console.apply(ADDR, "POW:DC:RANG:AUTO MAYBE"),
            Err(BusError::Io { .. })
        ));
    }
}
