//! Simulation hardware for unit testing the K-Line protocol engine
//!
//! [SimulatedEcu] behaves like an ISO 9141-2 engine ECU sitting on a K-Line:
//! * It decodes the 5 baud initialization byte from the line level changes and their
//!   timing on a [SimulatedClock]
//! * It answers with the sync byte, the key bytes and the inverted address
//! * Every byte written to the line is echoed back, as the physical K-Line does, unless
//!   loop-back is turned off with [SimulatedEcu::set_loopback]
//! * Requests are answered from a payload -> result map
//! * The ECU drops the session if no request arrives within 5 seconds of its last response
//!
//! Clones share the same ECU, so a test can keep a handle while the session owns the channel.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    channel::{ChannelError, ChannelResult, KLineChannel, LineLevel, LineMode},
    frame::{
        self, DESTINATION, POSITIVE_RESPONSE_OFFSET, REQUEST_LENGTH_OFFSET,
        RESPONSE_LENGTH_OFFSET, SOURCE,
    },
    timing::{Clock, SimulatedClock},
};

const BIT_TIME: Duration = Duration::from_millis(200);
const MIN_IDLE_BEFORE_INIT: Duration = Duration::from_millis(2600);
const SESSION_TIMEOUT: Duration = Duration::from_millis(5000);
const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SimPhase {
    Idle,
    AwaitingAck,
    Ready,
}

#[derive(Debug)]
struct EcuState {
    clock: SimulatedClock,
    mode: LineMode,
    phase: SimPhase,
    init_address: u8,
    sync_byte: u8,
    key_bytes: [u8; 2],
    final_ack: Option<u8>,
    level_log: Vec<(Instant, LineLevel)>,
    received_init_byte: Option<u8>,
    init_count: usize,
    rx_queue: VecDeque<u8>,
    tx_log: Vec<u8>,
    request_buf: Vec<u8>,
    responses: HashMap<Vec<u8>, Vec<u8>>,
    raw_responses: HashMap<Vec<u8>, Vec<u8>>,
    echo_fault: Option<usize>,
    positive_response_sid: bool,
    loopback: bool,
    last_activity: Instant,
    last_request_byte: Instant,
}

impl EcuState {
    fn level_at(&self, t: Instant) -> LineLevel {
        self.level_log
            .iter()
            .take_while(|(at, _)| *at <= t)
            .last()
            .map(|(_, level)| *level)
            .unwrap_or(LineLevel::High)
    }

    /// Samples the logged line levels as a 5 baud 8N1 character
    fn decode_init_byte(&self) -> Option<u8> {
        let (start_idx, start) = self
            .level_log
            .iter()
            .enumerate()
            .find(|(_, (_, level))| *level == LineLevel::Low)
            .map(|(idx, (at, _))| (idx, *at))?;
        let idle_since = self.level_log[..start_idx]
            .iter()
            .find(|(_, level)| *level == LineLevel::High)
            .map(|(at, _)| *at)?;
        if start.duration_since(idle_since) < MIN_IDLE_BEFORE_INIT {
            log::warn!("Simulated ECU: line was not idle long enough before the init byte");
            return None;
        }
        let mut value = 0u8;
        for bit in 0..8u32 {
            let sample = start + BIT_TIME * (bit + 1) + BIT_TIME / 2;
            if self.level_at(sample) == LineLevel::High {
                value |= 1 << bit;
            }
        }
        let stop = start + BIT_TIME * 9 + BIT_TIME / 2;
        if self.level_at(stop) != LineLevel::High {
            log::warn!("Simulated ECU: missing stop bit on init byte");
            return None;
        }
        Some(value)
    }

    fn on_request_byte(&mut self, byte: u8) {
        let now = self.clock.now();
        if !self.request_buf.is_empty()
            && now.saturating_duration_since(self.last_request_byte) > INTER_BYTE_TIMEOUT
        {
            log::debug!("Simulated ECU: discarding incomplete request {:02X?}", self.request_buf);
            self.request_buf.clear();
        }
        if self.request_buf.is_empty()
            && now.saturating_duration_since(self.last_activity) > SESSION_TIMEOUT
        {
            log::warn!("Simulated ECU: keep-alive expired, dropping session");
            self.phase = SimPhase::Idle;
            return;
        }
        self.last_request_byte = now;
        self.request_buf.push(byte);
        let expected_len = (self.request_buf[0].wrapping_sub(REQUEST_LENGTH_OFFSET)) as usize + 4;
        if self.request_buf.len() < expected_len {
            return;
        }
        let request = std::mem::take(&mut self.request_buf);
        let (body, cs) = request.split_at(request.len() - 1);
        if frame::checksum(body) != cs[0] {
            log::warn!("Simulated ECU: bad request checksum {request:02X?}");
            return;
        }
        let payload = &body[3..];
        if let Some(raw) = self.raw_responses.get(payload) {
            self.rx_queue.extend(raw.iter().copied());
        } else if let Some(result) = self.responses.get(payload) {
            let mut resp = vec![
                RESPONSE_LENGTH_OFFSET + (payload.len() + result.len()) as u8,
                DESTINATION,
                SOURCE,
            ];
            resp.extend_from_slice(payload);
            if self.positive_response_sid {
                resp[3] = resp[3].wrapping_add(POSITIVE_RESPONSE_OFFSET);
            }
            resp.extend_from_slice(result);
            resp.push(frame::checksum(&resp));
            self.rx_queue.extend(resp);
        } else {
            log::debug!("Simulated ECU: no response for {payload:02X?}");
            return;
        }
        self.last_activity = now;
    }
}

/// Simulated ISO 9141-2 ECU on a K-Line
#[derive(Debug, Clone)]
pub struct SimulatedEcu {
    state: Arc<Mutex<EcuState>>,
}

impl SimulatedEcu {
    /// Creates an ISO 9141-2 ECU (key bytes 08 08) using the given clock
    pub fn new(clock: SimulatedClock) -> Self {
        let now = clock.now();
        Self {
            state: Arc::new(Mutex::new(EcuState {
                clock,
                mode: LineMode::Uart(Default::default()),
                phase: SimPhase::Idle,
                init_address: 0x33,
                sync_byte: 0x55,
                key_bytes: [0x08, 0x08],
                final_ack: None,
                level_log: Vec::new(),
                received_init_byte: None,
                init_count: 0,
                rx_queue: VecDeque::new(),
                tx_log: Vec::new(),
                request_buf: Vec::new(),
                responses: HashMap::new(),
                raw_responses: HashMap::new(),
                echo_fault: None,
                positive_response_sid: false,
                loopback: true,
                last_activity: now,
                last_request_byte: now,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, EcuState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets the two key bytes sent during initialization
    pub fn set_key_bytes(&mut self, kb1: u8, kb2: u8) {
        self.state().key_bytes = [kb1, kb2];
    }

    /// Sets the sync byte sent after the init byte (0x55 on a healthy ECU)
    pub fn set_sync_byte(&mut self, sync: u8) {
        self.state().sync_byte = sync;
    }

    /// Overrides the final inverted address byte (normally 0xCC)
    pub fn set_final_ack(&mut self, ack: u8) {
        self.state().final_ack = Some(ack);
    }

    /// Echo the service ID of responses as a positive response SID (0x41 for service 01),
    /// the way real vehicles do
    pub fn set_positive_response_sid(&mut self, enabled: bool) {
        self.state().positive_response_sid = enabled;
    }

    /// Enables or disables the loop-back of written bytes. Adapters with a separate
    /// transmit path do not see their own bytes
    pub fn set_loopback(&mut self, enabled: bool) {
        self.state().loopback = enabled;
    }

    /// Adds a response. When the tester sends `payload`, the ECU answers with
    /// a well formed frame carrying `result`
    pub fn add_response(&mut self, payload: &[u8], result: &[u8]) {
        self.state().responses.insert(payload.to_vec(), result.to_vec());
    }

    /// Adds a raw response frame, sent verbatim when the tester sends `payload`
    pub fn add_raw_response(&mut self, payload: &[u8], frame: &[u8]) {
        self.state().raw_responses.insert(payload.to_vec(), frame.to_vec());
    }

    /// Removes any response to `payload`, the ECU will stay silent
    pub fn remove_response(&mut self, payload: &[u8]) {
        let mut state = self.state();
        state.responses.remove(payload);
        state.raw_responses.remove(payload);
    }

    /// Removes all responses
    pub fn clear_map(&mut self) {
        let mut state = self.state();
        state.responses.clear();
        state.raw_responses.clear();
    }

    /// Corrupts the echo of byte `idx` of the next request frame
    pub fn corrupt_echo_at(&mut self, idx: usize) {
        self.state().echo_fault = Some(idx);
    }

    /// Puts the ECU straight into an initialized session
    pub fn force_ready(&mut self) {
        let mut state = self.state();
        state.phase = SimPhase::Ready;
        state.mode = LineMode::Uart(Default::default());
        state.last_activity = state.clock.now();
    }

    /// Returns true if the ECU considers the diagnostic session open
    pub fn is_session_active(&self) -> bool {
        self.state().phase == SimPhase::Ready
    }

    /// Every byte the tester wrote in UART mode
    pub fn transmitted_bytes(&self) -> Vec<u8> {
        self.state().tx_log.clone()
    }

    /// Clears the log of transmitted bytes
    pub fn clear_transmitted(&mut self) {
        self.state().tx_log.clear();
    }

    /// The last 5 baud byte decoded from the line
    pub fn received_init_byte(&self) -> Option<u8> {
        self.state().received_init_byte
    }

    /// Number of successful initializations
    pub fn init_count(&self) -> usize {
        self.state().init_count
    }
}

impl KLineChannel for SimulatedEcu {
    fn set_mode(&mut self, mode: LineMode) -> ChannelResult<()> {
        let mut state = self.state();
        state.rx_queue.clear();
        if state.mode == LineMode::BitBang && mode != LineMode::BitBang {
            let decoded = state.decode_init_byte();
            state.received_init_byte = decoded;
            state.level_log.clear();
            if decoded == Some(state.init_address) {
                let sync = state.sync_byte;
                let [kb1, kb2] = state.key_bytes;
                state.rx_queue.extend([sync, kb1, kb2]);
                state.phase = SimPhase::AwaitingAck;
            } else {
                log::debug!("Simulated ECU: ignoring init byte {decoded:02X?}");
                state.phase = SimPhase::Idle;
            }
        }
        if mode == LineMode::BitBang {
            state.level_log.clear();
            state.phase = SimPhase::Idle;
        }
        state.mode = mode;
        Ok(())
    }

    fn set_level(&mut self, level: LineLevel) -> ChannelResult<()> {
        let mut state = self.state();
        if state.mode != LineMode::BitBang {
            return Err(ChannelError::UnsupportedRequest);
        }
        let now = state.clock.now();
        state.level_log.push((now, level));
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> ChannelResult<()> {
        let mut state = self.state();
        if state.mode == LineMode::BitBang {
            return Err(ChannelError::UnsupportedRequest);
        }
        state.tx_log.push(byte);
        let corrupt =
            state.phase == SimPhase::Ready && state.echo_fault == Some(state.request_buf.len());
        if corrupt {
            state.echo_fault = None;
            state.rx_queue.push_back(byte.wrapping_add(1));
        } else if state.loopback {
            state.rx_queue.push_back(byte);
        }
        match state.phase {
            SimPhase::AwaitingAck => {
                if byte == !state.key_bytes[1] {
                    let ack = state.final_ack.unwrap_or(!state.init_address);
                    state.rx_queue.push_back(ack);
                    state.phase = SimPhase::Ready;
                    state.init_count += 1;
                    state.last_activity = state.clock.now();
                } else {
                    log::warn!("Simulated ECU: wrong key byte acknowledgement 0x{byte:02X}");
                    state.phase = SimPhase::Idle;
                }
            }
            SimPhase::Ready => state.on_request_byte(byte),
            SimPhase::Idle => {}
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout_ms: u32) -> ChannelResult<u8> {
        let mut state = self.state();
        match state.rx_queue.pop_front() {
            Some(b) => {
                if state.phase == SimPhase::Ready {
                    state.last_activity = state.clock.now();
                }
                Ok(b)
            }
            None => {
                state.clock.advance(Duration::from_millis(timeout_ms.into()));
                Err(ChannelError::ReadTimeout)
            }
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.state().rx_queue.clear();
        Ok(())
    }
}
