//! The hardware module contains the [crate::channel::KLineChannel] implementations
//! for physical K-Line adapters and for simulation

#[cfg(feature = "serial")]
pub mod serial;
pub mod simulation;

/// Hardware API result
pub type HardwareResult<T> = Result<T, HardwareError>;

#[derive(Debug, thiserror::Error)]
/// Represents error that can be returned by Hardware API
pub enum HardwareError {
    /// Low level driver error
    #[error("Hardware API Error. Description: {desc}")]
    APIError {
        /// API Error description
        desc: String,
    },
    /// Hardware not found
    #[error("Device not found")]
    DeviceNotFound,
    /// IO error talking to the device
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Device hardware info returned when scanning for adapters
pub struct HardwareInfo {
    /// Name of the hardware, for serial adapters this is the port path
    pub name: String,
    /// Vendor of the hardware
    pub vendor: Option<String>,
    /// Listed capabilities of the hardware
    pub capabilities: HardwareCapabilities,
}

/// Contains details about what the physical hardware can do on the K-Line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HardwareCapabilities {
    /// Can drive the line level directly for 5 baud initialization
    pub five_baud_init: bool,
    /// Supports non standard baud rates such as 10400
    pub custom_baud: bool,
    /// Adapter has its own L-Line driver
    pub l_line: bool,
}
