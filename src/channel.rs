//! Module for the physical K-Line communication channel with an ECU
//!
//! The K-Line is used in two very different ways during a diagnostic session:
//! * [LineMode::BitBang] - The tester drives the line level directly. This is only used
//!   to transmit the 5 baud initialization byte, which is far too slow for any UART
//! * [LineMode::Uart] - Normal framed byte communication at ~10400 baud
//!
//! Both modes are offered by a single [KLineChannel], the handshake switches between
//! them explicitly.

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// Timeout when writing data to the channel
    #[error("timeout writing to channel")]
    WriteTimeout,
    /// Timeout when reading from the channel
    #[error("timeout reading from channel")]
    ReadTimeout,
    /// Unsupported channel request, for example setting the line level while
    /// the channel is in UART mode
    #[error("unsupported channel request")]
    UnsupportedRequest,
    /// Underlying API error with hardware
    #[error("underlying {api_name} API error: {desc}")]
    APIError {
        /// Name of the API EG: 'serialport'
        api_name: String,
        /// API error description
        desc: String,
    },
}

/// Logic level of the K-Line. The line idles high (12V) and is actively pulled low
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LineLevel {
    /// Recessive level, also the idle level and a '1' bit
    High,
    /// Dominant level, a start bit or a '0' bit
    Low,
}

impl LineLevel {
    /// Level representing a single data bit
    pub const fn from_bit(bit: bool) -> Self {
        if bit { LineLevel::High } else { LineLevel::Low }
    }
}

/// Parity bit of a UART character
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial frame format of the K-Line in UART mode
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialSettings {
    /// Baud rate in bits per second
    pub baud: u32,
    /// Number of data bits per character
    pub data_bits: u8,
    /// Parity bit
    pub parity: Parity,
    /// Number of stop bits
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    /// ISO 9141-2 communication settings, 10400 baud 8N1
    fn default() -> Self {
        Self {
            baud: 10_400,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

/// Operating mode of a [KLineChannel]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LineMode {
    /// Raw line level control (GPIO or serial break)
    BitBang,
    /// Framed byte communication with the given serial settings
    Uart(SerialSettings),
}

/// Base trait for interfacing with an ECU over the K-Line.
///
/// All operations are blocking. Bytes written in UART mode are looped back by the K-Line
/// itself, so every [KLineChannel::write_byte] is followed by the same byte appearing in
/// the receive direction.
pub trait KLineChannel: Send {
    /// Switches the channel between raw level control and UART mode.
    /// Switching mode discards anything left in the receive buffer
    fn set_mode(&mut self, mode: LineMode) -> ChannelResult<()>;

    /// Drives the K-Line to the given level. Only valid in [LineMode::BitBang]
    fn set_level(&mut self, level: LineLevel) -> ChannelResult<()>;

    /// Writes a single byte. Blocks until the transmit buffer accepted it.
    /// Only valid in [LineMode::Uart]
    fn write_byte(&mut self, byte: u8) -> ChannelResult<()>;

    /// Reads a single byte.
    ///
    /// ## Parameters
    /// * timeout_ms - Maximum time to wait for the byte. If nothing arrives in time,
    ///   [ChannelError::ReadTimeout] is returned
    fn read_byte(&mut self, timeout_ms: u32) -> ChannelResult<u8>;

    /// Tells the channel to clear its Rx buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
}

impl<T: KLineChannel + ?Sized> KLineChannel for Box<T> {
    fn set_mode(&mut self, mode: LineMode) -> ChannelResult<()> {
        (**self).set_mode(mode)
    }

    fn set_level(&mut self, level: LineLevel) -> ChannelResult<()> {
        (**self).set_level(level)
    }

    fn write_byte(&mut self, byte: u8) -> ChannelResult<()> {
        (**self).write_byte(byte)
    }

    fn read_byte(&mut self, timeout_ms: u32) -> ChannelResult<u8> {
        (**self).read_byte(timeout_ms)
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        (**self).clear_rx_buffer()
    }
}
