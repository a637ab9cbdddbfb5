//! ISO 9141-2 request and response framing
//!
//! Request:
//! ```text
//! [0x66 + n] [0x6A] [0xF1] [payload (n bytes)] [checksum]
//! ```
//! Response:
//! ```text
//! [0x42 + n + r] [0x6A] [0xF1] [payload echo (n bytes)] [result (r bytes)] [checksum]
//! ```
//!
//! The checksum is the sum of all preceding bytes of the frame, truncated to 8 bits.
//! Every byte of a request is echoed back by the line, and the echo must be read back
//! before the next byte is sent.

use log::{debug, error, warn};

use crate::{
    channel::KLineChannel,
    timing::Clock,
    DiagError, DiagServerResult,
};

/// Offset added to the payload length to form the request length byte
pub const REQUEST_LENGTH_OFFSET: u8 = 0x66;
/// Offset added to payload + result length to form the response length byte
pub const RESPONSE_LENGTH_OFFSET: u8 = 0x42;
/// Destination header byte
pub const DESTINATION: u8 = 0x6A;
/// Source (tester) header byte
pub const SOURCE: u8 = 0xF1;
/// Largest payload of a single ISO 9141-2 message
pub const MAX_PAYLOAD_LEN: usize = 7;
/// Offset between a request service ID and its positive response service ID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Calculates the ISO 9141-2 checksum of a byte slice
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// A fully built request frame
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestFrame {
    bytes: Vec<u8>,
}

impl RequestFrame {
    /// Builds a request frame around a payload.
    ///
    /// Returns [DiagError::ParameterInvalid] if the payload is empty or longer
    /// than [MAX_PAYLOAD_LEN]
    pub fn new(payload: &[u8]) -> DiagServerResult<Self> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
            return Err(DiagError::ParameterInvalid);
        }
        let mut bytes = Vec::with_capacity(payload.len() + 4);
        bytes.push(REQUEST_LENGTH_OFFSET + payload.len() as u8);
        bytes.push(DESTINATION);
        bytes.push(SOURCE);
        bytes.extend_from_slice(payload);
        bytes.push(checksum(&bytes));
        Ok(Self { bytes })
    }

    /// All bytes of the frame, in transmission order
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The payload section of the frame
    pub fn payload(&self) -> &[u8] {
        &self.bytes[3..self.bytes.len() - 1]
    }

    /// Trailing checksum byte
    pub fn checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 1]
    }
}

/// Response validation options
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResponseOptions {
    /// Validate the trailing response checksum
    pub verify_checksum: bool,
    /// Also accept the first payload byte echoed as a positive response
    /// service ID (request SID + 0x40)
    pub accept_positive_response_sid: bool,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            accept_positive_response_sid: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ParseState {
    Length,
    Destination,
    Source,
    PayloadEcho(usize),
    Result,
    Checksum,
    Complete,
}

/// Progress of a [ResponseFrame] after feeding it a byte
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseProgress {
    /// More bytes are needed
    Incomplete,
    /// The frame is complete and valid
    Complete,
}

/// Incremental parser for the response to one [RequestFrame].
///
/// Bytes are fed in as they arrive from the line. Each field is validated as soon as
/// it is received, so a desynchronized response is rejected at the first bad byte.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    payload: Vec<u8>,
    expected_result_len: usize,
    options: ResponseOptions,
    state: ParseState,
    sum: u8,
    result: Vec<u8>,
}

impl ResponseFrame {
    /// Creates a parser expecting the response to `request` with `expected_result_len`
    /// result bytes
    pub fn new(
        request: &RequestFrame,
        expected_result_len: usize,
        options: ResponseOptions,
    ) -> Self {
        Self {
            payload: request.payload().to_vec(),
            expected_result_len,
            options,
            state: ParseState::Length,
            sum: 0,
            result: Vec::with_capacity(expected_result_len),
        }
    }

    /// The length byte a well formed response must start with
    pub fn expected_length_byte(&self) -> u8 {
        RESPONSE_LENGTH_OFFSET
            .wrapping_add(self.payload.len() as u8)
            .wrapping_add(self.expected_result_len as u8)
    }

    /// Returns true once the full frame has been received
    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// Feeds one received byte into the parser
    pub fn push(&mut self, byte: u8) -> DiagServerResult<ParseProgress> {
        let next = match self.state {
            ParseState::Length => {
                let declared = (byte as i16)
                    - (RESPONSE_LENGTH_OFFSET as i16)
                    - (self.payload.len() as i16);
                if declared != self.expected_result_len as i16 {
                    return Err(DiagError::LengthMismatch {
                        expected: self.expected_length_byte(),
                        received: byte,
                    });
                }
                ParseState::Destination
            }
            ParseState::Destination => {
                if byte != DESTINATION {
                    return Err(DiagError::AddressMismatch {
                        expected: DESTINATION,
                        received: byte,
                    });
                }
                ParseState::Source
            }
            ParseState::Source => {
                if byte != SOURCE {
                    return Err(DiagError::AddressMismatch {
                        expected: SOURCE,
                        received: byte,
                    });
                }
                self.after_payload(0)
            }
            ParseState::PayloadEcho(idx) => {
                let expected = self.payload[idx];
                let positive_sid = idx == 0
                    && self.options.accept_positive_response_sid
                    && byte == expected.wrapping_add(POSITIVE_RESPONSE_OFFSET);
                if byte != expected && !positive_sid {
                    return Err(DiagError::PayloadEchoMismatch {
                        index: idx,
                        expected,
                        received: byte,
                    });
                }
                self.after_payload(idx + 1)
            }
            ParseState::Result => {
                self.result.push(byte);
                if self.result.len() == self.expected_result_len {
                    ParseState::Checksum
                } else {
                    ParseState::Result
                }
            }
            ParseState::Checksum => {
                if byte != self.sum {
                    if self.options.verify_checksum {
                        return Err(DiagError::ChecksumMismatch {
                            expected: self.sum,
                            received: byte,
                        });
                    }
                    warn!(
                        "Ignoring checksum mismatch. Calculated 0x{:02X}, received 0x{byte:02X}",
                        self.sum
                    );
                }
                self.state = ParseState::Complete;
                return Ok(ParseProgress::Complete);
            }
            ParseState::Complete => return Err(DiagError::ParameterInvalid),
        };
        self.sum = self.sum.wrapping_add(byte);
        self.state = next;
        Ok(ParseProgress::Incomplete)
    }

    fn after_payload(&self, idx: usize) -> ParseState {
        if idx < self.payload.len() {
            ParseState::PayloadEcho(idx)
        } else if self.expected_result_len > 0 {
            ParseState::Result
        } else {
            ParseState::Checksum
        }
    }

    /// Result bytes of the response. Only meaningful once the frame is complete
    pub fn result(&self) -> &[u8] {
        &self.result
    }

    /// Consumes the parser, returning the result bytes
    pub fn into_result(self) -> Vec<u8> {
        self.result
    }
}

/// Per request codec settings
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodecSettings {
    /// Gap between consecutive transmitted bytes
    pub inter_byte_ms: u32,
    /// Per byte read timeout
    pub read_timeout_ms: u32,
    /// Response validation options
    pub response: ResponseOptions,
}

/// Writes a single byte and checks the line echoes it back unchanged
pub fn send_byte_with_echo<C>(
    channel: &mut C,
    byte: u8,
    read_timeout_ms: u32,
) -> DiagServerResult<()>
where
    C: KLineChannel + ?Sized,
{
    channel.write_byte(byte)?;
    let echo = channel.read_byte(read_timeout_ms)?;
    if echo != byte {
        error!("Echo mismatch. Sent 0x{byte:02X}, received 0x{echo:02X}");
        return Err(DiagError::EchoMismatch {
            sent: byte,
            received: echo,
        });
    }
    Ok(())
}

/// Sends a request to the ECU and returns the result bytes of its response.
///
/// ## Parameters
/// * payload - Request payload, for Service 01 this is `[0x01, pid]`
/// * expected_result_len - Number of result bytes the response must carry
///
/// Any mismatch abandons the whole exchange. There is no retry inside a single call.
pub fn send_cmd<C, K>(
    channel: &mut C,
    clock: &mut K,
    payload: &[u8],
    expected_result_len: usize,
    settings: &CodecSettings,
) -> DiagServerResult<Vec<u8>>
where
    C: KLineChannel + ?Sized,
    K: Clock + ?Sized,
{
    let request = RequestFrame::new(payload)?;
    if RESPONSE_LENGTH_OFFSET as usize + payload.len() + expected_result_len > u8::MAX as usize {
        return Err(DiagError::ParameterInvalid);
    }
    channel.clear_rx_buffer()?;
    debug!("Sending req to ECU: {:02X?}", request.as_bytes());
    for (idx, byte) in request.as_bytes().iter().enumerate() {
        if idx != 0 {
            clock.delay_ms(settings.inter_byte_ms);
        }
        send_byte_with_echo(channel, *byte, settings.read_timeout_ms)?;
    }

    let mut response = ResponseFrame::new(&request, expected_result_len, settings.response);
    let mut raw = Vec::with_capacity(payload.len() + expected_result_len + 4);
    loop {
        let byte = channel.read_byte(settings.read_timeout_ms)?;
        raw.push(byte);
        match response.push(byte) {
            Ok(ParseProgress::Incomplete) => {}
            Ok(ParseProgress::Complete) => break,
            Err(e) => {
                error!("Invalid ECU response {raw:02X?} to {:02X?}: {e}", request.as_bytes());
                return Err(e);
            }
        }
    }
    debug!("ECU Response: {raw:02X?}");
    Ok(response.into_result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulatedEcu;
    use crate::timing::SimulatedClock;

    fn settings() -> CodecSettings {
        CodecSettings {
            inter_byte_ms: 10,
            read_timeout_ms: 100,
            response: ResponseOptions::default(),
        }
    }

    fn response_bytes(payload: &[u8], result: &[u8]) -> Vec<u8> {
        let mut r = vec![
            RESPONSE_LENGTH_OFFSET + (payload.len() + result.len()) as u8,
            DESTINATION,
            SOURCE,
        ];
        r.extend_from_slice(payload);
        r.extend_from_slice(result);
        r.push(checksum(&r));
        r
    }

    fn parse(
        payload: &[u8],
        expected_len: usize,
        bytes: &[u8],
        options: ResponseOptions,
    ) -> DiagServerResult<Vec<u8>> {
        let request = RequestFrame::new(payload)?;
        let mut parser = ResponseFrame::new(&request, expected_len, options);
        for b in bytes {
            if parser.push(*b)? == ParseProgress::Complete {
                return Ok(parser.into_result());
            }
        }
        panic!("Frame incomplete")
    }

    #[test]
    fn supported_pids_request_frame() {
        let frame = RequestFrame::new(&[0x01, 0x00]).unwrap();
        assert_eq!(frame.as_bytes(), &[0x68, 0x6A, 0xF1, 0x01, 0x00, 0xC4]);
        assert_eq!(frame.checksum(), 0xC4);
        assert_eq!(frame.payload(), &[0x01, 0x00]);
    }

    #[test]
    fn service_01_request_checksums() {
        for (pid, cs) in [(0x04, 0xC8), (0x05, 0xC9), (0x0C, 0xD0), (0x0D, 0xD1)] {
            let frame = RequestFrame::new(&[0x01, pid]).unwrap();
            assert_eq!(frame.checksum(), cs, "PID {pid:02X}");
            assert_eq!(checksum(&frame.as_bytes()[..5]), cs);
        }
    }

    #[test]
    fn rejects_invalid_payload_sizes() {
        assert!(matches!(RequestFrame::new(&[]), Err(DiagError::ParameterInvalid)));
        assert!(matches!(RequestFrame::new(&[0; 8]), Err(DiagError::ParameterInvalid)));
        assert!(RequestFrame::new(&[0; 7]).is_ok());
    }

    #[test]
    fn accepts_only_matching_length_byte() {
        let payload = [0x01, 0x0C];
        let good = response_bytes(&payload, &[0x1A, 0x00]);
        assert_eq!(good[0], 0x46);
        for len_byte in 0..=u8::MAX {
            let mut frame = good.clone();
            frame[0] = len_byte;
            let options = ResponseOptions { verify_checksum: false, ..Default::default() };
            let res = parse(&payload, 2, &frame, options);
            if len_byte == 0x46 {
                assert_eq!(res.unwrap(), vec![0x1A, 0x00]);
            } else {
                assert!(
                    matches!(
                        res,
                        Err(DiagError::LengthMismatch { expected: 0x46, received })
                            if received == len_byte
                    ),
                    "length byte {len_byte:02X}"
                );
            }
        }
    }

    #[test]
    fn rejects_wrong_header() {
        let payload = [0x01, 0x0D];
        let mut frame = response_bytes(&payload, &[0x3C]);
        frame[1] = 0x48;
        assert!(matches!(
            parse(&payload, 1, &frame, ResponseOptions::default()),
            Err(DiagError::AddressMismatch { expected: DESTINATION, received: 0x48 })
        ));
        let mut frame = response_bytes(&payload, &[0x3C]);
        frame[2] = 0x10;
        assert!(matches!(
            parse(&payload, 1, &frame, ResponseOptions::default()),
            Err(DiagError::AddressMismatch { expected: SOURCE, received: 0x10 })
        ));
    }

    #[test]
    fn rejects_wrong_payload_echo() {
        let payload = [0x01, 0x0D];
        let frame = response_bytes(&[0x01, 0x0C], &[0x3C]);
        assert!(matches!(
            parse(&payload, 1, &frame, ResponseOptions::default()),
            Err(DiagError::PayloadEchoMismatch { index: 1, expected: 0x0D, received: 0x0C })
        ));
    }

    #[test]
    fn positive_response_sid_is_opt_in() {
        let payload = [0x01, 0x0D];
        let frame = response_bytes(&[0x41, 0x0D], &[0x3C]);
        assert!(matches!(
            parse(&payload, 1, &frame, ResponseOptions::default()),
            Err(DiagError::PayloadEchoMismatch { index: 0, expected: 0x01, received: 0x41 })
        ));
        let options = ResponseOptions {
            accept_positive_response_sid: true,
            ..Default::default()
        };
        assert_eq!(parse(&payload, 1, &frame, options).unwrap(), vec![0x3C]);
    }

    #[test]
    fn response_checksum_validation() {
        let payload = [0x01, 0x05];
        let mut frame = response_bytes(&payload, &[0x28]);
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        assert!(matches!(
            parse(&payload, 1, &frame, ResponseOptions::default()),
            Err(DiagError::ChecksumMismatch { .. })
        ));
        let lenient = ResponseOptions {
            verify_checksum: false,
            ..Default::default()
        };
        assert_eq!(parse(&payload, 1, &frame, lenient).unwrap(), vec![0x28]);
    }

    #[test]
    fn pushing_past_completion_is_rejected() {
        let payload = [0x01, 0x05];
        let frame = response_bytes(&payload, &[0x28]);
        let request = RequestFrame::new(&payload).unwrap();
        let mut parser = ResponseFrame::new(&request, 1, ResponseOptions::default());
        for b in &frame {
            parser.push(*b).unwrap();
        }
        assert!(parser.is_complete());
        assert!(parser.push(0x00).is_err());
    }

    #[test]
    fn send_cmd_round_trip_over_simulated_line() {
        let clock = SimulatedClock::new();
        let mut ecu = SimulatedEcu::new(clock.clone());
        ecu.force_ready();
        ecu.add_response(&[0x01, 0x0C], &[0x1A, 0x00]);
        let mut clk = clock.clone();
        let res = send_cmd(&mut ecu, &mut clk, &[0x01, 0x0C], 2, &settings()).unwrap();
        assert_eq!(res, vec![0x1A, 0x00]);
        // 5 gaps between the 6 request bytes
        assert_eq!(clock.total_elapsed().as_millis(), 50);
        assert_eq!(ecu.transmitted_bytes(), vec![0x68, 0x6A, 0xF1, 0x01, 0x0C, 0xD0]);
    }

    #[test]
    fn send_cmd_echo_mismatch() {
        let clock = SimulatedClock::new();
        let mut ecu = SimulatedEcu::new(clock.clone());
        ecu.force_ready();
        ecu.add_response(&[0x01, 0x04], &[0xFF]);
        ecu.corrupt_echo_at(3);
        let mut clk = clock.clone();
        let res = send_cmd(&mut ecu, &mut clk, &[0x01, 0x04], 1, &settings());
        assert!(matches!(res, Err(DiagError::EchoMismatch { sent: 0x01, .. })));
        // Nothing is sent after the bad echo
        assert_eq!(ecu.transmitted_bytes(), vec![0x68, 0x6A, 0xF1, 0x01]);
    }

    #[test]
    fn send_cmd_times_out_on_silent_ecu() {
        let clock = SimulatedClock::new();
        let mut ecu = SimulatedEcu::new(clock.clone());
        ecu.force_ready();
        let mut clk = clock.clone();
        let res = send_cmd(&mut ecu, &mut clk, &[0x01, 0x04], 1, &settings());
        assert!(matches!(res, Err(DiagError::Timeout)));
    }
}
