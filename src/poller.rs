//! Repeating service 01 query cycle
//!
//! The poller keeps the diagnostic session alive and the readings fresh. Before every
//! request it checks the session, and runs the initialization again if the session is not
//! ready or the ECU has already dropped it. After every (re)initialization the supported
//! PID bitmap is read once.

use log::{error, info, warn};

use crate::{
    channel::KLineChannel,
    obd2::{ParameterValue, Readings, Service01Pid},
    session::Session,
    timing::Clock,
    DiagError, DiagServerResult,
};

/// Outcome of one poll cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    /// The session was initialized during this cycle
    pub reinitialized: bool,
    /// Set if the initialization failed. The readings are zeroed and the cycle ended early
    pub handshake_error: Option<DiagError>,
    /// Result of every query made in the cycle, in order
    pub outcomes: Vec<(Service01Pid, DiagServerResult<ParameterValue>)>,
}

impl CycleReport {
    /// Returns true if the session was usable and every query succeeded
    pub fn is_success(&self) -> bool {
        self.handshake_error.is_none() && self.outcomes.iter().all(|(_, r)| r.is_ok())
    }

    /// Parameters whose query failed in this cycle
    pub fn failed(&self) -> Vec<Service01Pid> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(pid, _)| *pid)
            .collect()
    }
}

/// Drives a [Session] through the poll cycle
#[derive(Debug)]
pub struct Poller<C, K> {
    session: Session<C, K>,
    supported_pids_read: bool,
    cycles: u64,
}

impl<C: KLineChannel, K: Clock> Poller<C, K> {
    /// Creates a poller. The session is initialized on the first cycle
    pub fn new(session: Session<C, K>) -> Self {
        Self {
            session,
            supported_pids_read: false,
            cycles: 0,
        }
    }

    /// Initializes the session and reads the supported PID bitmap, without
    /// waiting for the first cycle
    pub fn start(&mut self) -> DiagServerResult<()> {
        let mut report = CycleReport::default();
        self.ensure_session(&mut report).map(|_| ())
    }

    /// Runs one cycle: engine load, coolant temperature, engine speed and vehicle speed,
    /// each preceded by the minimum request spacing.
    ///
    /// The session is checked after the spacing pause, right before each request goes out
    pub fn poll_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        self.cycles += 1;
        for pid in Service01Pid::POLLED {
            self.session.wait_request_spacing();
            match self.ensure_session(&mut report) {
                Ok(true) => self.session.wait_request_spacing(),
                Ok(false) => {}
                Err(e) => {
                    error!("Cycle {} aborted, ECU could not be initialized: {e}", self.cycles);
                    report.handshake_error = Some(e);
                    return report;
                }
            }
            let res = self.session.refresh_pid(pid);
            report.outcomes.push((pid, res));
        }
        report
    }

    /// Initializes the session if needed and reads the supported PID bitmap once per
    /// session. Returns true if a request was sent to the ECU
    fn ensure_session(&mut self, report: &mut CycleReport) -> DiagServerResult<bool> {
        if !self.session.is_ready() {
            info!("Session is {}, initializing", self.session.phase());
            report.reinitialized = true;
            self.supported_pids_read = false;
            if let Err(e) = self.session.initialize() {
                self.session.readings = Readings::default();
                return Err(e);
            }
        }
        if !self.supported_pids_read {
            self.session.wait_request_spacing();
            let res = self.session.refresh_pid(Service01Pid::SupportedPids);
            if let Ok(ParameterValue::SupportedPids(pids)) = &res {
                info!("ECU supports PIDs {:02X?}", pids.list());
                let polled = pids.supported_parameters();
                for pid in Service01Pid::POLLED.iter().filter(|p| !polled.contains(p)) {
                    warn!("ECU does not report {pid} (PID 0x{:02X}) as supported", pid.pid());
                }
            }
            report.outcomes.push((Service01Pid::SupportedPids, res));
            self.supported_pids_read = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Latest readings
    pub fn readings(&self) -> &Readings {
        self.session.readings()
    }

    /// Number of cycles run so far
    pub fn cycle_count(&self) -> u64 {
        self.cycles
    }

    /// The polled session
    pub fn session(&self) -> &Session<C, K> {
        &self.session
    }

    /// Mutable access to the polled session
    pub fn session_mut(&mut self) -> &mut Session<C, K> {
        &mut self.session
    }

    /// Consumes the poller, returning the session
    pub fn into_session(self) -> Session<C, K> {
        self.session
    }
}
