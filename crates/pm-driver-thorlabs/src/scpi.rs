//! SCPI command set of the PM100 consoles.
//!
//! The strings are sent exactly as written here; the consoles accept mixed
//! long and short forms and the exact spelling is part of the driver's
//! observable behavior.

use pm_core::{PmError, PmResult};

pub const IDENTITY: &str = "*IDN?";

pub const MEASURE_POWER: &str = "measure:power?";
pub const POWER_UNIT: &str = "power:dc:unit?";

pub const WAVELENGTH: &str = "SENS:CORR:WAV?";
pub const WAVELENGTH_MIN: &str = "SENS:CORR:WAV? MIN";
pub const WAVELENGTH_MAX: &str = "SENS:CORR:WAV? MAX";

pub const POWER_RANGE: &str = "POW:DC:RANG?";
pub const POWER_RANGE_MIN: &str = "POW:DC:RANG? MIN";
pub const POWER_RANGE_MAX: &str = "POW:DC:RANG? MAX";

pub const AUTO_RANGE: &str = "POW:DC:RANG:AUTO?";
pub const AUTO_RANGE_ON: &str = "POW:DC:RANG:AUTO ON";
pub const AUTO_RANGE_OFF: &str = "POW:DC:RANG:AUTO OFF";

pub const ZERO: &str = "sense:correction:collect:zero";

/// `SENS:CORR:WAV <nm>`
pub fn set_wavelength(nm: i64) -> String {
    format!("SENS:CORR:WAV {nm}")
}

/// `POW:DC:RANG <watts>`
pub fn set_power_range(watts: f64) -> String {
    format!("POW:DC:RANG {}", shortest_float(watts))
}

/// Shortest round-trip text for `value`: positional between 1e-4 and 1e16,
/// otherwise scientific with a signed, two-digit exponent (`1.1e-05`).
/// Integral values keep a trailing `.0`.
pub fn shortest_float(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string().to_lowercase();
    }
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if (-4..16).contains(&exponent) {
        let positional = value.to_string();
        if positional.contains('.') {
            positional
        } else {
            format!("{positional}.0")
        }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

/// `POW:DC:RANG:AUTO ON` or `OFF`
pub fn set_auto_range(enabled: bool) -> &'static str {
    if enabled {
        AUTO_RANGE_ON
    } else {
        AUTO_RANGE_OFF
    }
}

fn invalid(command: &str, response: &str) -> PmError {
    PmError::InvalidResponse {
        command: command.to_string(),
        response: response.to_string(),
    }
}

/// Parse a numeric answer such as `+1.23400000E-05`.
pub fn parse_f64(command: &str, response: &str) -> PmResult<f64> {
    response
        .trim()
        .parse::<f64>()
        .map_err(|_| invalid(command, response))
}

/// Parse a wavelength answer. The console reports nm as a float
/// (`6.33000000E+02`); the fractional part is dropped.
pub fn parse_wavelength(command: &str, response: &str) -> PmResult<i64> {
    let value = parse_f64(command, response)?;
    if !value.is_finite() {
        return Err(invalid(command, response));
    }
    Ok(value.trunc() as i64)
}

/// Parse a flag answer: any non-zero integer is true.
pub fn parse_flag(command: &str, response: &str) -> PmResult<bool> {
    let value = parse_f64(command, response)?;
    Ok(value.trunc() as i64 != 0)
}
