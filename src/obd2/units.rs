//! Module for service 01 unit value type conversions

use std::fmt::{Display, Formatter};

/// Wrapper for OBD2 speed values
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Speed(u8); // self.0 is in km/h, as the ECU reports it

impl Speed {
    /// From kilometers per hour
    pub const fn from_kmh(kmh: u8) -> Self {
        Self(kmh)
    }

    /// Returns the speed in kilometers per hour
    pub fn to_kmh(&self) -> u8 {
        self.0
    }

    /// Returns the speed in miles per hour, rounded to the nearest mile
    pub fn to_mph(&self) -> u8 {
        ((self.0 as u32 * 1000 + 804) / 1609) as u8
    }

    /// Formats the speed with its unit
    pub fn to_string_with_unit(&self, use_metric: bool) -> String {
        match use_metric {
            true => format!("{} km/h", self.to_kmh()),
            false => format!("{} mph", self.to_mph()),
        }
    }
}

impl Display for Speed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_with_unit(true))
    }
}

/// Wrapper for OBD2 temperature values
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temperature(i16); // self.0 is in *C

impl Temperature {
    /// From celsius
    pub const fn from_celsius(c: i16) -> Self {
        Self(c)
    }

    /// Returns the temperature in celsius
    pub fn to_celsius(&self) -> i16 {
        self.0
    }

    /// Returns the temperature in fahrenheit, truncated
    pub fn to_fahrenheit(&self) -> i16 {
        self.0 * 9 / 5 + 32
    }

    /// Formats the temperature with its unit
    pub fn to_string_with_unit(&self, use_metric: bool) -> String {
        match use_metric {
            true => format!("{} C", self.to_celsius()),
            false => format!("{} F", self.to_fahrenheit()),
        }
    }
}

impl Display for Temperature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_with_unit(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_conversion() {
        assert_eq!(Speed::from_kmh(100).to_mph(), 62);
        assert_eq!(Speed::from_kmh(0).to_mph(), 0);
        assert_eq!(Speed::from_kmh(255).to_mph(), 158);
        assert_eq!(Speed::from_kmh(60).to_string_with_unit(true), "60 km/h");
        assert_eq!(Speed::from_kmh(60).to_string_with_unit(false), "37 mph");
    }

    #[test]
    fn temperature_conversion() {
        assert_eq!(Temperature::from_celsius(100).to_fahrenheit(), 212);
        assert_eq!(Temperature::from_celsius(-40).to_fahrenheit(), -40);
        assert_eq!(Temperature::from_celsius(0).to_fahrenheit(), 32);
        assert_eq!(Temperature::from_celsius(-40).to_string(), "-40 C");
    }
}
