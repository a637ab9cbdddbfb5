use std::time::Duration;

use kline_obd::{
    channel::{ChannelError, ChannelResult, KLineChannel, LineLevel, LineMode},
    handshake::HandshakePhase,
    hardware::simulation::SimulatedEcu,
    obd2::{Readings, Service01Pid, Speed, SupportedPids, Temperature},
    poller::Poller,
    session::{Session, SessionConfig},
    timing::SimulatedClock,
    DiagError,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn vehicle(clock: &SimulatedClock) -> SimulatedEcu {
    let mut ecu = SimulatedEcu::new(clock.clone());
    ecu.set_key_bytes(0x94, 0x94);
    ecu.add_response(&[0x01, 0x00], &[0xAA, 0xBB, 0xCC, 0xDD]);
    ecu.add_response(&[0x01, 0x04], &[0x66]);
    ecu.add_response(&[0x01, 0x05], &[0x5A]);
    ecu.add_response(&[0x01, 0x0C], &[0x0B, 0xB8]);
    ecu.add_response(&[0x01, 0x0D], &[0x32]);
    ecu
}

fn poller(
    ecu: &SimulatedEcu,
    clock: &SimulatedClock,
    config: SessionConfig,
) -> Poller<SimulatedEcu, SimulatedClock> {
    Poller::new(Session::new(ecu.clone(), clock.clone(), config))
}

fn expected_readings() -> Readings {
    Readings {
        engine_load: 40,
        coolant_temp: Temperature::from_celsius(50),
        engine_rpm: 750,
        vehicle_speed: Speed::from_kmh(50),
        supported_pids: SupportedPids([0xAA, 0xBB, 0xCC, 0xDD]),
    }
}

#[test]
fn full_session() {
    init_logger();
    let clock = SimulatedClock::new();
    let ecu = vehicle(&clock);
    let mut poller = poller(&ecu, &clock, SessionConfig::default());
    poller.start().unwrap();
    assert_eq!(poller.session().phase(), HandshakePhase::Ready);
    assert_eq!(ecu.received_init_byte(), Some(0x33));
    // Inverted key byte 2, then the supported PID request
    assert_eq!(
        ecu.transmitted_bytes(),
        vec![0x6B, 0x68, 0x6A, 0xF1, 0x01, 0x00, 0xC4]
    );

    for _ in 0..5 {
        let report = poller.poll_cycle();
        assert!(report.is_success(), "{report:?}");
        assert_eq!(*poller.readings(), expected_readings());
    }
    assert_eq!(ecu.init_count(), 1);
}

#[test]
fn echo_fault_only_zeroes_one_reading() {
    init_logger();
    let clock = SimulatedClock::new();
    let mut ecu = vehicle(&clock);
    let mut poller = poller(&ecu, &clock, SessionConfig::default());
    assert!(poller.poll_cycle().is_success());

    // Engine load is the first request of the cycle, corrupt the echo of its SID byte
    ecu.corrupt_echo_at(3);
    let report = poller.poll_cycle();
    assert_eq!(report.failed(), vec![Service01Pid::EngineLoad]);
    assert!(matches!(
        report.outcomes[0].1,
        Err(DiagError::EchoMismatch { sent: 0x01, received: 0x02 })
    ));

    let mut expected = expected_readings();
    expected.engine_load = 0;
    assert_eq!(*poller.readings(), expected);
    assert_eq!(poller.readings().supported_pids.raw(), [0xAA, 0xBB, 0xCC, 0xDD]);

    // No re-initialization needed, the next cycle recovers
    assert!(poller.poll_cycle().is_success());
    assert_eq!(*poller.readings(), expected_readings());
    assert_eq!(ecu.init_count(), 1);
}

#[test]
fn wrong_destination_zeroes_reading() {
    init_logger();
    let clock = SimulatedClock::new();
    let mut ecu = vehicle(&clock);
    let mut poller = poller(&ecu, &clock, SessionConfig::default());
    assert!(poller.poll_cycle().is_success());

    ecu.add_raw_response(&[0x01, 0x0D], &[0x45, 0x6B, 0xF1, 0x01, 0x0D, 0x32, 0x13]);
    let report = poller.poll_cycle();
    assert_eq!(report.failed(), vec![Service01Pid::VehicleSpeed]);
    assert!(matches!(
        report.outcomes[3].1,
        Err(DiagError::AddressMismatch { expected: 0x6A, received: 0x6B })
    ));
    assert_eq!(poller.readings().vehicle_speed, Speed::from_kmh(0));
    assert_eq!(poller.readings().engine_rpm, 750);
}

#[test]
fn silent_ecu_times_out() {
    init_logger();
    let clock = SimulatedClock::new();
    let mut ecu = vehicle(&clock);
    let mut poller = poller(&ecu, &clock, SessionConfig::default());
    assert!(poller.poll_cycle().is_success());

    ecu.remove_response(&[0x01, 0x0C]);
    let report = poller.poll_cycle();
    assert_eq!(report.failed(), vec![Service01Pid::EngineSpeed]);
    assert!(matches!(report.outcomes[2].1, Err(DiagError::Timeout)));
    assert_eq!(poller.readings().engine_rpm, 0);
    assert_eq!(poller.readings().vehicle_speed, Speed::from_kmh(50));
}

#[test]
fn keep_alive_expiry_reinitializes() {
    init_logger();
    let clock = SimulatedClock::new();
    let ecu = vehicle(&clock);
    let mut poller = poller(&ecu, &clock, SessionConfig::default());
    poller.start().unwrap();
    assert!(!poller.poll_cycle().reinitialized);

    clock.advance(Duration::from_millis(5001));
    assert!(poller.session().keep_alive_expired());
    let report = poller.poll_cycle();
    assert!(report.reinitialized);
    assert!(report.is_success());
    assert_eq!(report.outcomes.len(), 5);
    assert_eq!(report.outcomes[0].0, Service01Pid::SupportedPids);
    assert_eq!(ecu.init_count(), 2);
    assert_eq!(*poller.readings(), expected_readings());
}

#[test]
fn positive_response_sid() {
    init_logger();
    let clock = SimulatedClock::new();
    let mut ecu = vehicle(&clock);
    ecu.set_positive_response_sid(true);

    let mut strict = poller(&ecu, &clock, SessionConfig::default());
    let report = strict.poll_cycle();
    assert!(report.outcomes.iter().all(|(_, r)| matches!(
        r,
        Err(DiagError::PayloadEchoMismatch { index: 0, expected: 0x01, received: 0x41 })
    )));

    let mut config = SessionConfig::default();
    config.protocol.accept_positive_response_sid = true;
    let mut lenient = poller(&ecu, &clock, config);
    assert!(lenient.poll_cycle().is_success());
    assert_eq!(*lenient.readings(), expected_readings());
}

/// K-Line with nothing connected. Writes are lost and nothing is ever received
#[derive(Debug, Default)]
struct DeadLine {
    writes: usize,
}

impl KLineChannel for DeadLine {
    fn set_mode(&mut self, _mode: LineMode) -> ChannelResult<()> {
        Ok(())
    }

    fn set_level(&mut self, _level: LineLevel) -> ChannelResult<()> {
        Ok(())
    }

    fn write_byte(&mut self, _byte: u8) -> ChannelResult<()> {
        self.writes += 1;
        Ok(())
    }

    fn read_byte(&mut self, _timeout_ms: u32) -> ChannelResult<u8> {
        Err(ChannelError::ReadTimeout)
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}

#[test]
fn no_vehicle() {
    init_logger();
    let mut poller = Poller::new(Session::new(
        DeadLine::default(),
        SimulatedClock::new(),
        SessionConfig::default(),
    ));
    for _ in 0..3 {
        let report = poller.poll_cycle();
        assert!(report.reinitialized);
        assert!(matches!(
            report.handshake_error,
            Some(DiagError::HandshakeFailure { phase: HandshakePhase::AwaitingSyncEcho, .. })
        ));
        assert_eq!(*poller.readings(), Readings::default());
        assert_eq!(poller.session().phase(), HandshakePhase::Failed);
    }
    assert_eq!(poller.into_session().into_channel().writes, 0);
}
