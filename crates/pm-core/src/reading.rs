//! Power readings and device descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between identity and address in a device label.
pub const LABEL_SEPARATOR: &str = " --> ";

/// A single power reading as reported by the console.
///
/// `value` is `None` while the console is disconnected or being zeroed; the
/// unit is then empty. This pair is the "null sentinel" and is what
/// [`PowerReading::default`] returns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    /// Measured power, in `unit`
    pub value: Option<f64>,
    /// Unit string as reported by the console (e.g. "W")
    pub unit: String,
}

impl PowerReading {
    /// A valid reading.
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            unit: unit.into(),
        }
    }

    /// The null sentinel `(None, "")`.
    pub fn sentinel() -> Self {
        Self::default()
    }

    /// True unless this is the sentinel.
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }
}

impl fmt::Display for PowerReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(value) => {
                // Two-digit signed exponent: 2.50e-04
                let text = format!("{value:.2e}");
                match text.split_once('e') {
                    Some((mantissa, exponent)) => {
                        let exponent: i32 = exponent.parse().unwrap_or(0);
                        let sign = if exponent < 0 { '-' } else { '+' };
                        write!(f, "{mantissa}e{sign}{:02} {}", exponent.abs(), self.unit)
                    }
                    None => write!(f, "{text} {}", self.unit),
                }
            }
            None => f.write_str(" "),
        }
    }
}

/// A reading accumulated by the polling controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    /// UTC time the reading was acquired
    pub timestamp: DateTime<Utc>,
    /// Measured power
    pub value: f64,
    /// Unit of `value`
    pub unit: String,
}

impl PowerSample {
    /// Stamp a reading with the current time. Returns `None` for the sentinel.
    pub fn from_reading(reading: &PowerReading) -> Option<Self> {
        reading.value.map(|value| Self {
            timestamp: Utc::now(),
            value,
            unit: reading.unit.clone(),
        })
    }
}

/// A console found by a discovery scan.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Bus address (e.g. "USB0::0x1313::0x8078::P0012345::INSTR")
    pub address: String,
    /// Answer to `*IDN?`, trimmed
    pub identity: String,
    /// Model name from the model table (e.g. "PM100D")
    pub model: String,
}

impl DeviceDescriptor {
    /// Human-readable label, `"<identity> --> <address>"`.
    pub fn label(&self) -> String {
        format!("{}{}{}", self.identity, LABEL_SEPARATOR, self.address)
    }

    /// Extract the address from a label produced by [`DeviceDescriptor::label`].
    ///
    /// A string without the separator is taken to be a bare address.
    pub fn address_from_label(label: &str) -> &str {
        match label.split_once(LABEL_SEPARATOR) {
            Some((_, address)) => address.trim(),
            None => label.trim(),
        }
    }
}
