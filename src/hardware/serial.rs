//! K-Line over a USB serial adapter
//!
//! Works with any serial port whose TX/RX lines are wired to a K-Line transceiver
//! (dumb KKL / VAG-COM style cables). The K-Line is pulled low while the port is in the
//! break condition, which is used to bit-bang the 5 baud initialization byte.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, Parity as PortParity, SerialPort, StopBits};

use super::{HardwareCapabilities, HardwareError, HardwareInfo, HardwareResult};
use crate::channel::{
    ChannelError, ChannelResult, KLineChannel, LineLevel, LineMode, Parity, SerialSettings,
};

const SERIAL_CAPABILITIES: HardwareCapabilities = HardwareCapabilities {
    five_baud_init: true,
    custom_baud: true,
    l_line: false,
};

/// Serial port backed K-Line adapter
pub struct SerialKLine {
    info: HardwareInfo,
    port: Box<dyn SerialPort>,
    mode: LineMode,
}

impl Debug for SerialKLine {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "SerialKLine {} ({:?})", self.info.name, self.mode)
    }
}

impl SerialKLine {
    /// Lists serial ports which could host a K-Line adapter
    pub fn list_devices() -> HardwareResult<Vec<HardwareInfo>> {
        let ports = serialport::available_ports().map_err(convert_serial_error)?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let vendor = match p.port_type {
                    serialport::SerialPortType::UsbPort(usb) => usb.manufacturer,
                    _ => None,
                };
                HardwareInfo {
                    name: p.port_name,
                    vendor,
                    capabilities: SERIAL_CAPABILITIES,
                }
            })
            .collect())
    }

    /// Opens the adapter on the given port. The line starts idle (high) in UART mode
    pub fn open(path: &str) -> HardwareResult<Self> {
        let settings = SerialSettings::default();
        let port = serialport::new(path, settings.baud)
            .data_bits(DataBits::Eight)
            .parity(PortParity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => HardwareError::DeviceNotFound,
                _ => convert_serial_error(e),
            })?;
        log::info!("Opened K-Line adapter on {path}");
        Ok(Self {
            info: HardwareInfo {
                name: path.into(),
                vendor: None,
                capabilities: SERIAL_CAPABILITIES,
            },
            port,
            mode: LineMode::Uart(settings),
        })
    }

    /// Information about the opened adapter
    pub fn get_info(&self) -> &HardwareInfo {
        &self.info
    }

    fn apply_settings(&mut self, settings: SerialSettings) -> ChannelResult<()> {
        let (data_bits, stop_bits, parity) = port_settings(settings)?;
        self.port.set_baud_rate(settings.baud).map_err(convert_channel_error)?;
        self.port.set_data_bits(data_bits).map_err(convert_channel_error)?;
        self.port.set_stop_bits(stop_bits).map_err(convert_channel_error)?;
        self.port.set_parity(parity).map_err(convert_channel_error)?;
        Ok(())
    }
}

impl KLineChannel for SerialKLine {
    fn set_mode(&mut self, mode: LineMode) -> ChannelResult<()> {
        match mode {
            LineMode::BitBang => {
                // Idle high until told otherwise
                self.port.clear_break().map_err(convert_channel_error)?;
            }
            LineMode::Uart(settings) => {
                self.port.clear_break().map_err(convert_channel_error)?;
                self.apply_settings(settings)?;
            }
        }
        self.port.clear(ClearBuffer::All).map_err(convert_channel_error)?;
        self.mode = mode;
        Ok(())
    }

    fn set_level(&mut self, level: LineLevel) -> ChannelResult<()> {
        if self.mode != LineMode::BitBang {
            return Err(ChannelError::UnsupportedRequest);
        }
        match level {
            LineLevel::Low => self.port.set_break(),
            LineLevel::High => self.port.clear_break(),
        }
        .map_err(convert_channel_error)
    }

    fn write_byte(&mut self, byte: u8) -> ChannelResult<()> {
        if self.mode == LineMode::BitBang {
            return Err(ChannelError::UnsupportedRequest);
        }
        self.port.write_all(&[byte]).map_err(|e| match e.kind() {
            ErrorKind::TimedOut => ChannelError::WriteTimeout,
            _ => ChannelError::IOError(e),
        })?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, timeout_ms: u32) -> ChannelResult<u8> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms.into()))
            .map_err(convert_channel_error)?;
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(ChannelError::ReadTimeout),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(ChannelError::ReadTimeout),
            Err(e) => Err(ChannelError::IOError(e)),
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.port.clear(ClearBuffer::Input).map_err(convert_channel_error)
    }
}

/// Maps the frame format onto the port settings
fn port_settings(settings: SerialSettings) -> ChannelResult<(DataBits, StopBits, PortParity)> {
    let data_bits = match settings.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        _ => return Err(ChannelError::UnsupportedRequest),
    };
    let stop_bits = match settings.stop_bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        _ => return Err(ChannelError::UnsupportedRequest),
    };
    let parity = match settings.parity {
        Parity::None => PortParity::None,
        Parity::Odd => PortParity::Odd,
        Parity::Even => PortParity::Even,
    };
    Ok((data_bits, stop_bits, parity))
}

fn convert_serial_error(error: serialport::Error) -> HardwareError {
    HardwareError::APIError {
        desc: error.to_string(),
    }
}

fn convert_channel_error(error: serialport::Error) -> ChannelError {
    ChannelError::APIError {
        api_name: "serialport".into(),
        desc: error.to_string(),
    }
}
