//! The ISO 9141-2 diagnostic session
//!
//! A [Session] owns the K-Line channel and the clock. It runs the 5 baud initialization,
//! tracks which [HandshakePhase] the session is in and when the last exchange with the
//! ECU completed. The ECU drops the session if it sees no request for 5 seconds, so
//! [Session::keep_alive_expired] tells the caller when the handshake has to run again.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{
    channel::{KLineChannel, SerialSettings},
    frame::{self, CodecSettings, ResponseOptions},
    handshake::{self, HandshakePhase, HandshakeResult, KeyBytes},
    obd2::Readings,
    timing::{Clock, TimeoutConfig, TimingConfig},
    DiagError, DiagServerResult,
};

/// Protocol level options
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolOptions {
    /// Address byte sent at 5 baud. 0x33 for OBD-II
    pub init_address: u8,
    /// UART settings used once the 5 baud byte is sent
    pub serial: SerialSettings,
    /// The inverted key byte 2 is looped back by the K-Line and must be read back
    pub expect_ack_echo: bool,
    /// Fail the initialization if the ECU does not acknowledge with the inverted address
    pub strict_init_ack: bool,
    /// Validate the checksum byte of every response
    pub verify_response_checksum: bool,
    /// Accept responses echoing the service ID + 0x40 (0x41 for service 01)
    pub accept_positive_response_sid: bool,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            init_address: 0x33,
            serial: SerialSettings::default(),
            expect_ack_echo: true,
            strict_init_ack: false,
            verify_response_checksum: true,
            accept_positive_response_sid: false,
        }
    }
}

/// Session configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Timing windows of the session
    pub timing: TimingConfig,
    /// Read timeouts
    pub timeouts: TimeoutConfig,
    /// Protocol options
    pub protocol: ProtocolOptions,
}

impl SessionConfig {
    /// Settings for the frame codec derived from this config
    pub fn codec_settings(&self) -> CodecSettings {
        CodecSettings {
            inter_byte_ms: self.timing.inter_byte_ms,
            read_timeout_ms: self.timeouts.read_timeout_ms,
            response: ResponseOptions {
                verify_checksum: self.protocol.verify_response_checksum,
                accept_positive_response_sid: self.protocol.accept_positive_response_sid,
            },
        }
    }
}

/// ISO 9141-2 diagnostic session
#[derive(Debug)]
pub struct Session<C, K> {
    channel: C,
    clock: K,
    config: SessionConfig,
    phase: HandshakePhase,
    last_exchange: Option<Instant>,
    key_bytes: Option<KeyBytes>,
    pub(crate) readings: Readings,
}

impl<C: KLineChannel, K: Clock> Session<C, K> {
    /// Creates a new idle session. Nothing is sent until [Session::initialize] is called
    pub fn new(channel: C, clock: K, config: SessionConfig) -> Self {
        Self {
            channel,
            clock,
            config,
            phase: HandshakePhase::Idle,
            last_exchange: None,
            key_bytes: None,
            readings: Readings::default(),
        }
    }

    /// Runs the 5 baud initialization. On success the session is [HandshakePhase::Ready],
    /// otherwise it is [HandshakePhase::Failed]
    pub fn initialize(&mut self) -> DiagServerResult<HandshakeResult> {
        let res = handshake::five_baud_init(&mut self.channel, &mut self.clock, &self.config, |p| {
            debug!("Session phase -> {p}")
        });
        match res {
            Ok(r) => {
                self.phase = HandshakePhase::Ready;
                self.key_bytes = Some(r.key_bytes);
                self.last_exchange = Some(self.clock.now());
                Ok(r)
            }
            Err(e) => {
                self.phase = HandshakePhase::Failed;
                self.key_bytes = None;
                self.last_exchange = None;
                Err(e)
            }
        }
    }

    /// Current phase of the session
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns true if the session is ready and the keep-alive window has not elapsed
    pub fn is_ready(&self) -> bool {
        self.phase == HandshakePhase::Ready && !self.keep_alive_expired()
    }

    /// Key bytes received during the last successful initialization
    pub fn key_bytes(&self) -> Option<KeyBytes> {
        self.key_bytes
    }

    /// Time since the last completed exchange (or the end of the initialization)
    pub fn time_since_last_exchange(&self) -> Option<Duration> {
        self.last_exchange.map(|t| self.clock.elapsed_since(t))
    }

    /// Returns true if the ECU has already dropped the session because no request
    /// completed within the keep-alive window
    pub fn keep_alive_expired(&self) -> bool {
        match self.time_since_last_exchange() {
            Some(elapsed) => {
                elapsed >= Duration::from_millis(self.config.timing.keep_alive_ms.into())
            }
            None => true,
        }
    }

    /// Waits the minimum gap required before the next request
    pub fn wait_request_spacing(&mut self) {
        self.clock.delay_ms(self.config.timing.request_spacing_ms);
    }

    /// Sends a request and returns the result bytes of the response.
    ///
    /// A failed exchange leaves the session ready. Only the keep-alive deadline or
    /// a failed initialization take the session out of [HandshakePhase::Ready]
    pub fn send_cmd(
        &mut self,
        payload: &[u8],
        expected_result_len: usize,
    ) -> DiagServerResult<Vec<u8>> {
        if self.phase != HandshakePhase::Ready {
            return Err(DiagError::SessionNotReady(self.phase));
        }
        if self.keep_alive_expired() {
            warn!("Keep-alive window elapsed, ECU has dropped the session");
            self.phase = HandshakePhase::Idle;
            return Err(DiagError::SessionNotReady(self.phase));
        }
        let settings = self.config.codec_settings();
        let res = frame::send_cmd(
            &mut self.channel,
            &mut self.clock,
            payload,
            expected_result_len,
            &settings,
        )?;
        self.last_exchange = Some(self.clock.now());
        Ok(res)
    }

    /// Latest parameter readings
    pub fn readings(&self) -> &Readings {
        &self.readings
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Clock used by the session
    pub fn clock(&self) -> &K {
        &self.clock
    }

    /// Mutable access to the clock
    pub fn clock_mut(&mut self) -> &mut K {
        &mut self.clock
    }

    /// Mutable access to the channel
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Consumes the session, returning the channel
    pub fn into_channel(self) -> C {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hardware::simulation::SimulatedEcu, timing::SimulatedClock};

    fn session() -> (Session<SimulatedEcu, SimulatedClock>, SimulatedEcu, SimulatedClock) {
        let clock = SimulatedClock::new();
        let ecu = SimulatedEcu::new(clock.clone());
        let session = Session::new(ecu.clone(), clock.clone(), SessionConfig::default());
        (session, ecu, clock)
    }

    #[test]
    fn requests_need_initialization() {
        let (mut session, ecu, _) = session();
        assert_eq!(session.phase(), HandshakePhase::Idle);
        assert!(matches!(
            session.send_cmd(&[0x01, 0x00], 4),
            Err(DiagError::SessionNotReady(HandshakePhase::Idle))
        ));
        assert!(ecu.transmitted_bytes().is_empty());
    }

    #[test]
    fn initialize_and_query() {
        let (mut session, mut ecu, _) = session();
        ecu.add_response(&[0x01, 0x0D], &[0x3C]);
        let res = session.initialize().unwrap();
        assert_eq!(res.key_bytes, KeyBytes([0x08, 0x08]));
        assert_eq!(session.key_bytes(), Some(KeyBytes([0x08, 0x08])));
        assert!(session.is_ready());
        session.wait_request_spacing();
        assert_eq!(session.send_cmd(&[0x01, 0x0D], 1).unwrap(), vec![0x3C]);
        assert!(session.is_ready());
    }

    #[test]
    fn failed_initialization() {
        let (mut session, mut ecu, _) = session();
        ecu.set_sync_byte(0x00);
        assert!(session.initialize().is_err());
        assert_eq!(session.phase(), HandshakePhase::Failed);
        assert!(!session.is_ready());
        assert!(matches!(
            session.send_cmd(&[0x01, 0x00], 4),
            Err(DiagError::SessionNotReady(HandshakePhase::Failed))
        ));
    }

    #[test]
    fn keep_alive_expiry() {
        let (mut session, mut ecu, clock) = session();
        ecu.add_response(&[0x01, 0x0D], &[0x3C]);
        session.initialize().unwrap();
        clock.advance(Duration::from_millis(4999));
        assert!(!session.keep_alive_expired());
        assert!(session.send_cmd(&[0x01, 0x0D], 1).is_ok());
        clock.advance(Duration::from_millis(5000));
        assert!(session.keep_alive_expired());
        assert!(matches!(
            session.send_cmd(&[0x01, 0x0D], 1),
            Err(DiagError::SessionNotReady(HandshakePhase::Idle))
        ));
        assert_eq!(session.phase(), HandshakePhase::Idle);
    }

    #[test]
    fn failed_exchange_keeps_session() {
        let (mut session, mut ecu, _) = session();
        session.initialize().unwrap();
        ecu.add_response(&[0x01, 0x05], &[0x28]);
        ecu.corrupt_echo_at(0);
        assert!(matches!(
            session.send_cmd(&[0x01, 0x05], 1),
            Err(DiagError::EchoMismatch { sent: 0x68, received: 0x69 })
        ));
        assert_eq!(session.phase(), HandshakePhase::Ready);
    }
}
