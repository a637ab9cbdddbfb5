#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which implements the core of a dashboard mounted OBD-II reader that talks to a
//! vehicle over the ISO 9141-2 K-Line.
//!
//! ## Protocol
//!
//! ISO 9141-2 is the slow-init K-Line protocol used by most European and Asian vehicles
//! from 1996 until CAN took over in 2008. Communication is half duplex over a single wire,
//! every byte the tester sends is echoed back, and the session has to be woken up with a
//! 5 baud synchronization byte before normal 10400 baud communication can begin.
//!
//! The crate is split into the following layers:
//! * [channel] - The transport contract: byte level UART mode and raw line level mode
//! * [handshake] - The 5 baud wake up sequence
//! * [frame] - Request frame building and response frame validation
//! * [obd2] - Service 01 parameters and their decoding
//! * [session] - The diagnostic session, its phase and its keep-alive deadline
//! * [poller] - The repeating query cycle
//! * [dashboard] - Keypad driven two line rendering of the current readings
//!
//! ## Hardware support
//!
//! ### Serial K-Line adapters
//! Any USB serial adapter wired to a K-Line transceiver (L9637, MC33290 or an FTDI based
//! VAG-COM cable) can be used through [hardware::serial]. The 5 baud byte is produced by
//! toggling the serial break condition.
//!
//! ### Simulation
//! [hardware::simulation] provides a simulated ISO 9141-2 ECU and a virtual clock so the
//! whole protocol engine can be exercised without a vehicle.

use channel::ChannelError;
use handshake::HandshakePhase;

pub mod channel;
pub mod dashboard;
pub mod frame;
pub mod handshake;
pub mod hardware;
pub mod obd2;
pub mod poller;
pub mod session;
pub mod timing;

/// Diagnostic server result
pub type DiagServerResult<T> = Result<T, DiagError>;

#[derive(Debug, thiserror::Error)]
/// Diagnostic server error
pub enum DiagError {
    /// A byte written to the K-Line was not echoed back unchanged
    #[error("Echo mismatch. Sent 0x{sent:02X}, line echoed 0x{received:02X}")]
    EchoMismatch {
        /// Byte written to the line
        sent: u8,
        /// Byte read back
        received: u8,
    },
    /// The response length byte does not match the expected result size
    #[error("Response length mismatch. Expected 0x{expected:02X}, received 0x{received:02X}")]
    LengthMismatch {
        /// Length byte matching the expected result size
        expected: u8,
        /// Length byte sent by the ECU
        received: u8,
    },
    /// The response header is not addressed like the request
    #[error("ECU response address mismatch. Expected 0x{expected:02X}, received 0x{received:02X}")]
    AddressMismatch {
        /// Expected header byte
        expected: u8,
        /// Received header byte
        received: u8,
    },
    /// The response does not echo the request payload
    #[error("Payload mismatch at {index}. Expected 0x{expected:02X}, received 0x{received:02X}")]
    PayloadEchoMismatch {
        /// Index of the payload byte
        index: usize,
        /// Expected payload byte
        expected: u8,
        /// Received payload byte
        received: u8,
    },
    /// The response checksum byte is wrong
    #[error("Response checksum mismatch. Calculated 0x{expected:02X}, received 0x{received:02X}")]
    ChecksumMismatch {
        /// Checksum calculated over the response
        expected: u8,
        /// Checksum byte sent by the ECU
        received: u8,
    },
    /// ECU did not send a byte within the read timeout
    #[error("ECU did not respond within the read timeout")]
    Timeout,
    /// 5 baud initialization failed
    #[error("Initialization failed during {phase}: {reason}")]
    HandshakeFailure {
        /// Handshake phase which failed
        phase: HandshakePhase,
        /// Description of the failure
        reason: String,
    },
    /// A request was made while the session is not ready
    #[error("Diagnostic session is not ready (phase {0})")]
    SessionNotReady(HandshakePhase),
    /// A parameter given to the function is invalid. Check the function's documentation
    /// for more information
    #[error("Diagnostic function parameter invalid")]
    ParameterInvalid,
    /// Error with underlying communication channel
    #[error("Diagnostic server hardware channel error")]
    ChannelError(#[source] ChannelError),
}

impl From<ChannelError> for DiagError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::ReadTimeout => DiagError::Timeout,
            e => DiagError::ChannelError(e),
        }
    }
}
