//! A minimal SI-ish unit/quantity system.
//!
//! Units are resolved once, at parse time, to a base dimension and a
//! magnitude scale factor; everything downstream of parsing carries a
//! `Quantity` already expressed in base units. This is the only
//! process-wide shared state the core needs (§5, §9) — the symbol table
//! below is a plain static table, not a mutable singleton, so there is
//! nothing to synchronize.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// The seven-ish base dimensions this crate cares about. A real unit
/// registry would track full SI dimension vectors; the shot compiler only
/// ever mixes time, frequency, voltage, current, and dimensionless values,
/// so a closed enum is enough and keeps `merge`/arithmetic exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Dimension {
    Dimensionless,
    Time,
    Frequency,
    Voltage,
    Current,
    Decibel,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Unit {
    pub dimension: Dimension,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.dimension {
            Dimension::Dimensionless => "dimensionless",
            Dimension::Time => "s",
            Dimension::Frequency => "Hz",
            Dimension::Voltage => "V",
            Dimension::Current => "A",
            Dimension::Decibel => "dB",
        };
        write!(f, "{label}")
    }
}

impl Unit {
    pub const DIMENSIONLESS: Unit = Unit { dimension: Dimension::Dimensionless };
    pub const SECOND: Unit = Unit { dimension: Dimension::Time };
    pub const HERTZ: Unit = Unit { dimension: Dimension::Frequency };
    pub const VOLT: Unit = Unit { dimension: Dimension::Voltage };
    pub const AMPERE: Unit = Unit { dimension: Dimension::Current };
    pub const DECIBEL: Unit = Unit { dimension: Dimension::Decibel };
}

/// Looks up a unit symbol's dimension and its scale factor to that
/// dimension's base unit (seconds, hertz, volts, amperes, dB, or 1).
pub fn lookup(symbol: &str) -> Option<(Unit, f64)> {
    Some(match symbol {
        "" => (Unit::DIMENSIONLESS, 1.0),
        "s" => (Unit::SECOND, 1.0),
        "ms" => (Unit::SECOND, 1e-3),
        "us" | "µs" => (Unit::SECOND, 1e-6),
        "ns" => (Unit::SECOND, 1e-9),
        "Hz" => (Unit::HERTZ, 1.0),
        "kHz" => (Unit::HERTZ, 1e3),
        "MHz" => (Unit::HERTZ, 1e6),
        "GHz" => (Unit::HERTZ, 1e9),
        "V" => (Unit::VOLT, 1.0),
        "mV" => (Unit::VOLT, 1e-3),
        "A" => (Unit::AMPERE, 1.0),
        "mA" => (Unit::AMPERE, 1e-3),
        "dB" => (Unit::DECIBEL, 1.0),
        _ => return None,
    })
}

/// A magnitude expressed in the base unit of its dimension.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Quantity {
    pub magnitude: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn dimensionless(magnitude: f64) -> Quantity {
        Quantity { magnitude, unit: Unit::DIMENSIONLESS }
    }

    pub fn from_literal(magnitude: f64, symbol: &str) -> Option<Quantity> {
        let (unit, scale) = lookup(symbol)?;
        Some(Quantity { magnitude: magnitude * scale, unit })
    }

    pub fn to_base_units(self) -> Quantity {
        self
    }

    /// The magnitude expressed in the given unit symbol, failing if the
    /// dimension does not match — except for the one standing bridge this
    /// registry knows, dB into a dimensionless-linear target, which goes
    /// through the power ratio law `10^(dB/10)` (§4.I) rather than a scale
    /// factor.
    pub fn magnitude_in_unit(self, symbol: &str) -> Option<f64> {
        let (unit, scale) = lookup(symbol)?;
        if self.unit.dimension == Dimension::Decibel && unit.dimension == Dimension::Dimensionless {
            return Some(10f64.powf(self.magnitude / 10.0) / scale);
        }
        if unit.dimension != self.unit.dimension {
            return None;
        }
        Some(self.magnitude / scale)
    }
}

impl Add for Quantity {
    type Output = Option<Quantity>;
    fn add(self, rhs: Quantity) -> Option<Quantity> {
        if self.unit.dimension != rhs.unit.dimension {
            return None;
        }
        Some(Quantity { magnitude: self.magnitude + rhs.magnitude, unit: self.unit })
    }
}

impl Sub for Quantity {
    type Output = Option<Quantity>;
    fn sub(self, rhs: Quantity) -> Option<Quantity> {
        if self.unit.dimension != rhs.unit.dimension {
            return None;
        }
        Some(Quantity { magnitude: self.magnitude - rhs.magnitude, unit: self.unit })
    }
}

impl Neg for Quantity {
    type Output = Quantity;
    fn neg(self) -> Quantity {
        Quantity { magnitude: -self.magnitude, unit: self.unit }
    }
}

impl Mul<f64> for Quantity {
    type Output = Quantity;
    fn mul(self, rhs: f64) -> Quantity {
        Quantity { magnitude: self.magnitude * rhs, unit: self.unit }
    }
}

impl Div<f64> for Quantity {
    type Output = Quantity;
    fn div(self, rhs: f64) -> Quantity {
        Quantity { magnitude: self.magnitude / rhs, unit: self.unit }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literal_scales_to_base_units() {
        let q = Quantity::from_literal(10.0, "ns").unwrap();
        assert_eq!(q.unit, Unit::SECOND);
        assert!((q.magnitude - 10e-9).abs() < 1e-18);
    }

    #[test]
    fn magnitude_in_unit_round_trips() {
        let q = Quantity::from_literal(1.5, "kHz").unwrap();
        let back = q.magnitude_in_unit("Hz").unwrap();
        assert!((back - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn mismatched_dimension_add_fails() {
        let a = Quantity::from_literal(1.0, "s").unwrap();
        let b = Quantity::from_literal(1.0, "V").unwrap();
        assert!((a + b).is_none());
    }

    #[test]
    fn decibel_bridges_into_dimensionless_linear() {
        let zero_db = Quantity::from_literal(0.0, "dB").unwrap();
        let ten_db = Quantity::from_literal(10.0, "dB").unwrap();
        assert!((zero_db.magnitude_in_unit("").unwrap() - 1.0).abs() < 1e-9);
        assert!((ten_db.magnitude_in_unit("").unwrap() - 10.0).abs() < 1e-9);
    }
}
