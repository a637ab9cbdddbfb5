//! Time keeping for the K-Line session
//!
//! ISO 9141-2 is driven entirely by timing windows, ranging from the 2.6 second ECU reset
//! wait down to the 10ms inter-byte gap. All of these go through a [Clock] so the protocol
//! can run against the wall clock on hardware, and against a [SimulatedClock] in tests.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Source of monotonic time and blocking delays
pub trait Clock: Send {
    /// Current monotonic time
    fn now(&self) -> Instant;

    /// Blocks for the given duration
    fn delay(&mut self, duration: Duration);

    /// Blocks for the given number of milliseconds
    fn delay_ms(&mut self, ms: u32) {
        self.delay(Duration::from_millis(ms.into()))
    }

    /// Time elapsed since an earlier instant from this clock
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Wall clock, delays put the current thread to sleep
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// Virtual clock. Delays advance time instantly.
///
/// Clones share the same time base, so a simulated ECU can observe the delays
/// the protocol engine makes.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClock {
    /// Creates a new virtual clock starting at the current instant
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Moves time forward without anyone delaying
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += duration;
    }

    /// Total virtual time that has passed since the clock was created
    pub fn total_elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Instant {
        self.base + self.total_elapsed()
    }

    fn delay(&mut self, duration: Duration) {
        self.advance(duration)
    }
}

/// Timing parameters of the ISO 9141-2 session, all in milliseconds
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
pub struct TimingConfig {
    /// Time the line is held idle before the 5 baud byte so the ECU can reset.
    /// ISO 9141-2 requires at least 2600ms
    pub ecu_reset_wait_ms: u32,
    /// Duration of one bit of the 5 baud initialization byte
    pub init_bit_ms: u32,
    /// Wait after the key bytes before sending the inverted key byte, and
    /// again before reading the inverted address
    pub init_ack_delay_ms: u32,
    /// Gap between consecutive bytes of one request (P4)
    pub inter_byte_ms: u32,
    /// Pause before every request (P3 min)
    pub request_spacing_ms: u32,
    /// Maximum time between a response and the next request before the ECU
    /// drops the session (P3 max)
    pub keep_alive_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ecu_reset_wait_ms: 2610,
            init_bit_ms: 200,
            init_ack_delay_ms: 40,
            inter_byte_ms: 10,
            request_spacing_ms: 65,
            keep_alive_ms: 5000,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
/// Per byte read timeouts
pub struct TimeoutConfig {
    /// Timeout waiting for the sync byte after the 5 baud byte (W1 max is 300ms)
    pub sync_timeout_ms: u32,
    /// Timeout for every other byte
    pub read_timeout_ms: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 1000,
            read_timeout_ms: 1000,
        }
    }
}
