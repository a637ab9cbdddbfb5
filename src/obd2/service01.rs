//! OBD2 service 01 (Show current data)

use automotive_diag::obd2::Obd2Command;
use log::{debug, warn};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    channel::KLineChannel,
    obd2::{Speed, SupportedPids, Temperature},
    session::Session,
    timing::Clock,
    DiagError, DiagServerResult,
};

/// Service 01 parameters read by the reader
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, EnumString)]
pub enum Service01Pid {
    /// PIDs supported \[01 - 20\]
    SupportedPids,
    /// Calculated engine load
    EngineLoad,
    /// Engine coolant temperature
    CoolantTemperature,
    /// Engine speed
    EngineSpeed,
    /// Vehicle speed
    VehicleSpeed,
}

impl Service01Pid {
    /// Parameters refreshed every poll cycle, in query order
    pub const POLLED: [Service01Pid; 4] = [
        Service01Pid::EngineLoad,
        Service01Pid::CoolantTemperature,
        Service01Pid::EngineSpeed,
        Service01Pid::VehicleSpeed,
    ];

    /// PID byte of the parameter
    pub fn pid(&self) -> u8 {
        match self {
            Service01Pid::SupportedPids => 0x00,
            Service01Pid::EngineLoad => 0x04,
            Service01Pid::CoolantTemperature => 0x05,
            Service01Pid::EngineSpeed => 0x0C,
            Service01Pid::VehicleSpeed => 0x0D,
        }
    }

    /// Number of result bytes the ECU answers with
    pub fn result_len(&self) -> usize {
        match self {
            Service01Pid::SupportedPids => 4,
            Service01Pid::EngineSpeed => 2,
            _ => 1,
        }
    }

    /// Request payload for the parameter
    pub fn request(&self) -> [u8; 2] {
        [u8::from(Obd2Command::Service01), self.pid()]
    }

    /// Decodes the result bytes of a response
    pub fn decode(&self, result: &[u8]) -> DiagServerResult<ParameterValue> {
        if result.len() != self.result_len() {
            return Err(DiagError::ParameterInvalid);
        }
        Ok(match self {
            Service01Pid::SupportedPids => ParameterValue::SupportedPids(SupportedPids([
                result[0], result[1], result[2], result[3],
            ])),
            Service01Pid::EngineLoad => ParameterValue::EngineLoad(decode_engine_load(result[0])),
            Service01Pid::CoolantTemperature => ParameterValue::CoolantTemperature(
                Temperature::from_celsius(decode_coolant_temp(result[0])),
            ),
            Service01Pid::EngineSpeed => {
                ParameterValue::EngineSpeed(decode_engine_rpm(result[0], result[1]))
            }
            Service01Pid::VehicleSpeed => ParameterValue::VehicleSpeed(Speed::from_kmh(result[0])),
        })
    }
}

/// Decoded value of a service 01 parameter
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ParameterValue {
    /// Supported PID bitmap
    SupportedPids(SupportedPids),
    /// Engine load in percent
    EngineLoad(u8),
    /// Coolant temperature
    CoolantTemperature(Temperature),
    /// Engine speed in RPM
    EngineSpeed(u16),
    /// Vehicle speed
    VehicleSpeed(Speed),
}

/// Engine load: A * 100 / 255, truncated
pub fn decode_engine_load(a: u8) -> u8 {
    (a as u16 * 100 / 255) as u8
}

/// Coolant temperature: A - 40 celsius
pub fn decode_coolant_temp(a: u8) -> i16 {
    a as i16 - 40
}

/// Engine speed: (A * 256 + B) / 4, truncated
pub fn decode_engine_rpm(a: u8, b: u8) -> u16 {
    u16::from_be_bytes([a, b]) / 4
}

impl<C: KLineChannel, K: Clock> Session<C, K> {
    /// Queries a single parameter. The readings are not touched
    pub fn query_pid(&mut self, pid: Service01Pid) -> DiagServerResult<ParameterValue> {
        let result = self.send_cmd(&pid.request(), pid.result_len())?;
        pid.decode(&result)
    }

    /// Queries a parameter and stores it in the readings. If the query fails the
    /// reading is reset to zero and the error is returned
    pub fn refresh_pid(&mut self, pid: Service01Pid) -> DiagServerResult<ParameterValue> {
        match self.query_pid(pid) {
            Ok(value) => {
                debug!("{pid}: {value:?}");
                self.readings.apply(value);
                Ok(value)
            }
            Err(e) => {
                warn!("Query of {pid} failed, reading reset to zero: {e}");
                self.readings.zero(pid);
                Err(e)
            }
        }
    }

    /// Queries the supported PID bitmap
    pub fn query_supported_pids(&mut self) -> DiagServerResult<SupportedPids> {
        match self.refresh_pid(Service01Pid::SupportedPids)? {
            ParameterValue::SupportedPids(p) => Ok(p),
            _ => Err(DiagError::ParameterInvalid),
        }
    }

    /// Queries the calculated engine load in percent
    pub fn query_engine_load(&mut self) -> DiagServerResult<u8> {
        match self.refresh_pid(Service01Pid::EngineLoad)? {
            ParameterValue::EngineLoad(v) => Ok(v),
            _ => Err(DiagError::ParameterInvalid),
        }
    }

    /// Queries the coolant temperature
    pub fn query_coolant_temp(&mut self) -> DiagServerResult<Temperature> {
        match self.refresh_pid(Service01Pid::CoolantTemperature)? {
            ParameterValue::CoolantTemperature(v) => Ok(v),
            _ => Err(DiagError::ParameterInvalid),
        }
    }

    /// Queries the engine speed in RPM
    pub fn query_engine_rpm(&mut self) -> DiagServerResult<u16> {
        match self.refresh_pid(Service01Pid::EngineSpeed)? {
            ParameterValue::EngineSpeed(v) => Ok(v),
            _ => Err(DiagError::ParameterInvalid),
        }
    }

    /// Queries the vehicle speed
    pub fn query_vehicle_speed(&mut self) -> DiagServerResult<Speed> {
        match self.refresh_pid(Service01Pid::VehicleSpeed)? {
            ParameterValue::VehicleSpeed(v) => Ok(v),
            _ => Err(DiagError::ParameterInvalid),
        }
    }
}
