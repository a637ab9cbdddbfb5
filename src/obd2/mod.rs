//! Module for OBD (ISO-9141)

use strum::IntoEnumIterator;

mod service01;
mod units;

// Exports
pub use service01::*;
pub use units::*;

/// Function to decode PID support response from ECU
pub(crate) fn decode_pid_response(x: &[u8]) -> Vec<bool> {
    let mut resp: Vec<bool> = Vec::new();
    for b in x {
        let mut mask: u8 = 0b10000000;
        for _ in 0..8 {
            resp.push(b & mask != 0x00);
            mask >>= 1;
        }
    }
    resp
}

/// Bitmap of the service 01 PIDs 0x01-0x20 the ECU supports (response to PID 0x00).
///
/// The MSB of the first byte is PID 0x01, the LSB of the last byte is PID 0x20.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SupportedPids(pub [u8; 4]);

impl SupportedPids {
    /// Raw bitmap as received
    pub fn raw(&self) -> [u8; 4] {
        self.0
    }

    /// Returns true if the ECU reports the PID as supported.
    /// PID 0x00 is always supported, PIDs above 0x20 are not covered by this bitmap
    pub fn is_supported(&self, pid: u8) -> bool {
        match pid {
            0x00 => true,
            0x01..=0x20 => {
                let bit = (pid - 1) as usize;
                self.0[bit / 8] & (0x80 >> (bit % 8)) != 0
            }
            _ => false,
        }
    }

    /// Lists every supported PID in the 0x01-0x20 range
    pub fn list(&self) -> Vec<u8> {
        decode_pid_response(&self.0)
            .iter()
            .enumerate()
            .filter(|(_, supported)| **supported)
            .map(|(idx, _)| (idx + 1) as u8)
            .collect()
    }

    /// The parameters of [Service01Pid] the ECU reports as supported
    pub fn supported_parameters(&self) -> Vec<Service01Pid> {
        Service01Pid::iter().filter(|p| self.is_supported(p.pid())).collect()
    }
}

/// Latest decoded values of the polled parameters.
///
/// A parameter whose query failed reads zero until the next successful query.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Readings {
    /// Calculated engine load in percent
    pub engine_load: u8,
    /// Engine coolant temperature
    pub coolant_temp: Temperature,
    /// Engine speed in RPM
    pub engine_rpm: u16,
    /// Vehicle speed
    pub vehicle_speed: Speed,
    /// Supported PID bitmap
    pub supported_pids: SupportedPids,
}

impl Readings {
    /// Stores a decoded value
    pub fn apply(&mut self, value: ParameterValue) {
        match value {
            ParameterValue::SupportedPids(v) => self.supported_pids = v,
            ParameterValue::EngineLoad(v) => self.engine_load = v,
            ParameterValue::CoolantTemperature(v) => self.coolant_temp = v,
            ParameterValue::EngineSpeed(v) => self.engine_rpm = v,
            ParameterValue::VehicleSpeed(v) => self.vehicle_speed = v,
        }
    }

    /// Resets a single parameter to zero
    pub fn zero(&mut self, pid: Service01Pid) {
        match pid {
            Service01Pid::SupportedPids => self.supported_pids = SupportedPids::default(),
            Service01Pid::EngineLoad => self.engine_load = 0,
            Service01Pid::CoolantTemperature => self.coolant_temp = Temperature::default(),
            Service01Pid::EngineSpeed => self.engine_rpm = 0,
            Service01Pid::VehicleSpeed => self.vehicle_speed = Speed::default(),
        }
    }

    /// Resets every live parameter to zero. The supported PID bitmap is kept
    pub fn zero_live_data(&mut self) {
        for pid in Service01Pid::POLLED {
            self.zero(pid);
        }
    }
}
