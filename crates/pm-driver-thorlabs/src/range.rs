//! Power-range stepping.
//!
//! The consoles only accept a fixed ladder of ranges and silently clamp any
//! other request to the nearest rung. Stepping therefore multiplies (or
//! divides) the current range by [`RANGE_STEP_FACTOR`] and re-reads the range;
//! if the console clamped back to where it was, the next attempt starts from
//! the previous target instead of the device's answer.

use pm_core::PmError;
use std::fmt;

/// Multiplier applied per stepping attempt.
pub const RANGE_STEP_FACTOR: f64 = 9.0;

/// Upper limit on set-and-reread attempts per step. A console reporting a
/// zero minimum range would otherwise never hit the lower bound.
pub const MAX_STEP_ATTEMPTS: usize = 64;

/// Direction of a range step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDirection {
    /// Towards larger ranges (+1)
    Increase,
    /// Towards smaller ranges (-1)
    Decrease,
}

impl RangeDirection {
    pub fn verb(&self) -> &'static str {
        match self {
            RangeDirection::Increase => "increase",
            RangeDirection::Decrease => "decrease",
        }
    }

    /// Next target from `start`.
    pub fn apply(&self, start: f64) -> f64 {
        match self {
            RangeDirection::Increase => start * RANGE_STEP_FACTOR,
            RangeDirection::Decrease => start / RANGE_STEP_FACTOR,
        }
    }
}

impl TryFrom<i32> for RangeDirection {
    type Error = PmError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RangeDirection::Increase),
            -1 => Ok(RangeDirection::Decrease),
            other => Err(PmError::InvalidDirection(other)),
        }
    }
}

impl fmt::Display for RangeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Result of [`crate::Pm100xDriver::step_power_range`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// The console moved to a new range.
    Changed {
        /// Range before the step, in W
        from: f64,
        /// Range after the step, in W
        to: f64,
    },
    /// The next target would leave the console's range; nothing was sent.
    AtBoundary {
        /// Range left in place, in W
        range: f64,
    },
}

impl StepOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, StepOutcome::Changed { .. })
    }

    /// Range in effect after the step.
    pub fn range(&self) -> f64 {
        match *self {
            StepOutcome::Changed { to, .. } => to,
            StepOutcome::AtBoundary { range } => range,
        }
    }
}

/// True when `target` is outside what the console can be asked for.
///
/// A target less than one factor below the minimum is still accepted; the
/// console clamps it onto the smallest rung.
pub fn out_of_bounds(target: f64, min_range: f64, max_range: f64) -> bool {
    target * RANGE_STEP_FACTOR < min_range || target > max_range
}
