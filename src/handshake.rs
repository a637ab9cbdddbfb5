//! ISO 9141-2 5 baud initialization
//!
//! The sequence, with the default timings of [TimingConfig]:
//! 1. Hold the K-Line idle (high) for 2610ms so the ECU is ready for a new initialization
//! 2. Send the address byte 0x33 at 5 baud (1 start bit, 8 data bits LSB first, 1 stop bit,
//!    200ms each). This is done by driving the line level directly
//! 3. Switch to 10400 baud 8N1 and receive the sync byte 0x55
//! 4. Receive the two key bytes (08 08 or 94 94 for ISO 9141-2)
//! 5. Wait 40ms, then send the inverted second key byte
//! 6. Wait 40ms, then receive the inverted address byte (0xCC)

use log::{debug, info, warn};
use strum_macros::Display;

use crate::{
    channel::{KLineChannel, LineLevel, LineMode},
    session::SessionConfig,
    timing::{Clock, TimingConfig},
    DiagError, DiagServerResult,
};

/// Sync byte the ECU sends after a successful 5 baud address byte
pub const SYNC_BYTE: u8 = 0x55;

/// Phases of the diagnostic session, from power on to a usable session
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum HandshakePhase {
    /// Nothing has happened on the line yet
    Idle,
    /// Line held idle so the ECU can reset
    EcuResetWait,
    /// 5 baud address byte is being sent
    SyncSent,
    /// Waiting for the 0x55 sync byte
    AwaitingSyncEcho,
    /// Waiting for the two key bytes
    AwaitingKeyBytes,
    /// Inverted key byte 2 sent
    AckSent,
    /// Waiting for the inverted address byte
    AwaitingFinalEcho,
    /// Session is open for requests
    Ready,
    /// Initialization failed, the handshake has to be run again
    Failed,
}

/// Key bytes sent by the ECU during initialization
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyBytes(pub [u8; 2]);

impl KeyBytes {
    /// Returns true for the key bytes ISO 9141-2 ECUs send
    pub fn is_iso9141(&self) -> bool {
        matches!(self.0, [0x08, 0x08] | [0x94, 0x94])
    }

    /// Returns true for the key bytes of a KWP2000 ECU using slow init
    pub fn is_kwp2000(&self) -> bool {
        self.0[0] == 0x8F && matches!(self.0[1], 0xE9 | 0x6B | 0x6D | 0xEF)
    }

    /// The byte the tester acknowledges the key bytes with
    pub fn acknowledgement(&self) -> u8 {
        !self.0[1]
    }
}

/// Outcome of a successful initialization
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Key bytes received from the ECU
    pub key_bytes: KeyBytes,
    /// Final inverted address byte received from the ECU
    pub final_ack: u8,
}

/// Sends a single byte at a very low baud rate by driving the line level directly.
///
/// 8N1 framing, LSB first. The line is left high (idle) afterwards.
pub fn send_slow_byte<C, K>(
    channel: &mut C,
    clock: &mut K,
    value: u8,
    bit_ms: u32,
) -> DiagServerResult<()>
where
    C: KLineChannel + ?Sized,
    K: Clock + ?Sized,
{
    channel.set_level(LineLevel::Low)?;
    clock.delay_ms(bit_ms);
    for bit in 0..8 {
        channel.set_level(LineLevel::from_bit(value & (1 << bit) != 0))?;
        clock.delay_ms(bit_ms);
    }
    channel.set_level(LineLevel::High)?;
    clock.delay_ms(bit_ms);
    Ok(())
}

fn failure(phase: HandshakePhase, reason: impl Into<String>) -> DiagError {
    let reason = reason.into();
    warn!("Initialization failed during {phase}: {reason}");
    DiagError::HandshakeFailure { phase, reason }
}

fn read<C: KLineChannel + ?Sized>(
    channel: &mut C,
    phase: HandshakePhase,
    timeout_ms: u32,
) -> DiagServerResult<u8> {
    channel
        .read_byte(timeout_ms)
        .map_err(|e| failure(phase, DiagError::from(e).to_string()))
}

/// Runs the full 5 baud initialization on the channel.
///
/// `on_phase` is called on every phase transition. On error the session is in
/// [HandshakePhase::Failed] and the whole sequence must be started again.
pub fn five_baud_init<C, K, F>(
    channel: &mut C,
    clock: &mut K,
    config: &SessionConfig,
    mut on_phase: F,
) -> DiagServerResult<HandshakeResult>
where
    C: KLineChannel + ?Sized,
    K: Clock + ?Sized,
    F: FnMut(HandshakePhase),
{
    let timing: &TimingConfig = &config.timing;
    let protocol = &config.protocol;

    let mut phase = HandshakePhase::EcuResetWait;
    on_phase(phase);
    info!("Starting 5 baud initialization, address 0x{:02X}", protocol.init_address);
    channel
        .set_mode(LineMode::BitBang)
        .and_then(|_| channel.set_level(LineLevel::High))
        .map_err(|e| failure(phase, e.to_string()))?;
    clock.delay_ms(timing.ecu_reset_wait_ms);

    phase = HandshakePhase::SyncSent;
    on_phase(phase);
    send_slow_byte(channel, clock, protocol.init_address, timing.init_bit_ms)
        .map_err(|e| failure(phase, e.to_string()))?;
    channel
        .set_mode(LineMode::Uart(protocol.serial))
        .map_err(|e| failure(phase, e.to_string()))?;

    phase = HandshakePhase::AwaitingSyncEcho;
    on_phase(phase);
    let sync = read(channel, phase, config.timeouts.sync_timeout_ms)?;
    if sync != SYNC_BYTE {
        return Err(failure(
            phase,
            format!("expected sync byte 0x{SYNC_BYTE:02X}, received 0x{sync:02X}"),
        ));
    }
    debug!("Received sync byte 0x{sync:02X}");

    phase = HandshakePhase::AwaitingKeyBytes;
    on_phase(phase);
    let kb1 = read(channel, phase, config.timeouts.read_timeout_ms)?;
    let kb2 = read(channel, phase, config.timeouts.read_timeout_ms)?;
    let key_bytes = KeyBytes([kb1, kb2]);
    if key_bytes.is_iso9141() {
        debug!("Key bytes {kb1:02X} {kb2:02X} (ISO 9141-2)");
    } else if key_bytes.is_kwp2000() {
        warn!("Key bytes {kb1:02X} {kb2:02X} belong to a KWP2000 ECU, continuing as ISO 9141-2");
    } else {
        warn!("Unknown key bytes {kb1:02X} {kb2:02X}, continuing as ISO 9141-2");
    }

    clock.delay_ms(timing.init_ack_delay_ms);
    phase = HandshakePhase::AckSent;
    on_phase(phase);
    let ack = key_bytes.acknowledgement();
    channel.write_byte(ack).map_err(|e| failure(phase, e.to_string()))?;
    if protocol.expect_ack_echo {
        let echo = read(channel, phase, config.timeouts.read_timeout_ms)?;
        if echo != ack {
            return Err(failure(phase, format!("sent 0x{ack:02X}, line echoed 0x{echo:02X}")));
        }
    }

    clock.delay_ms(timing.init_ack_delay_ms);
    phase = HandshakePhase::AwaitingFinalEcho;
    on_phase(phase);
    let final_ack = read(channel, phase, config.timeouts.read_timeout_ms)?;
    let expected = !protocol.init_address;
    if final_ack != expected {
        if protocol.strict_init_ack {
            return Err(failure(
                phase,
                format!("expected 0x{expected:02X}, received 0x{final_ack:02X}"),
            ));
        }
        warn!("ECU acknowledged with 0x{final_ack:02X} instead of 0x{expected:02X}, continuing");
    }

    on_phase(HandshakePhase::Ready);
    info!("5 baud initialization complete");
    Ok(HandshakeResult { key_bytes, final_ack })
}
