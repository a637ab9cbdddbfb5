//! Two line character display front end
//!
//! The dashboard shows the polled readings on a 2x16 character display and is controlled
//! with a 4x4 keypad. Keys are numbered row by row, 1 (top left) to 16 (bottom right).
//! * Key 1 flips between the RPM / speed page and the engine load / coolant page
//! * Key 16 flips between the live readings and the supported PID bitmap
//!
//! The display is redrawn when the refresh flag is set. [RefreshTimer] sets it from a
//! background thread at a fixed rate, the dashboard loop clears it. No K-Line traffic ever
//! happens on the timer thread.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, warn};

use crate::{
    channel::KLineChannel,
    hardware::HardwareResult,
    obd2::Readings,
    poller::{CycleReport, Poller},
    timing::Clock,
};

/// Key flipping between the two pages of a view
pub const PAGE_KEY: u8 = 1;
/// Key flipping between live readings and the supported PID bitmap
pub const MODE_KEY: u8 = 16;

/// Character display (HD44780 style)
pub trait CharacterDisplay {
    /// Number of rows and columns
    fn size(&self) -> (u8, u8) {
        (2, 16)
    }
    /// Clears the display and homes the cursor
    fn clear(&mut self) -> HardwareResult<()>;
    /// Moves the cursor
    fn set_position(&mut self, row: u8, col: u8) -> HardwareResult<()>;
    /// Writes text at the cursor
    fn write_str(&mut self, text: &str) -> HardwareResult<()>;
}

/// Key matrix
pub trait Keypad {
    /// Returns the key currently held down (1-16), if any
    fn pressed_key(&mut self) -> HardwareResult<Option<u8>>;
}

/// Dashboard configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DashboardConfig {
    /// Interval of the refresh timer
    pub refresh_interval_ms: u32,
    /// Show km/h and celsius instead of mph and fahrenheit
    pub use_metric: bool,
    /// Delay between keypad scans in [Dashboard::run]
    pub keypad_scan_ms: u32,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 500,
            use_metric: true,
            keypad_scan_ms: 10,
        }
    }
}

/// What the display shows
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, strum_macros::Display)]
pub enum ViewMode {
    /// Live readings
    #[default]
    Live,
    /// Supported PID bitmap
    SupportedPids,
}

/// Page of the live view
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, strum_macros::Display)]
pub enum Page {
    /// Engine speed and vehicle speed
    #[default]
    RpmSpeed,
    /// Engine load and coolant temperature
    LoadTemperature,
}

/// Keypad controlled view state
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ViewState {
    /// Current mode
    pub mode: ViewMode,
    /// Current page
    pub page: Page,
}

impl ViewState {
    /// Applies a key press. Returns true if the view changed
    pub fn handle_key(&mut self, key: u8) -> bool {
        match key {
            PAGE_KEY => {
                self.page = match self.page {
                    Page::RpmSpeed => Page::LoadTemperature,
                    Page::LoadTemperature => Page::RpmSpeed,
                };
            }
            MODE_KEY => {
                self.mode = match self.mode {
                    ViewMode::Live => ViewMode::SupportedPids,
                    ViewMode::SupportedPids => ViewMode::Live,
                };
            }
            _ => return false,
        }
        debug!("View is now {} / {}", self.mode, self.page);
        true
    }

    /// Renders the two display lines for the given readings
    pub fn render(&self, readings: &Readings, use_metric: bool) -> [String; 2] {
        match (self.mode, self.page) {
            (ViewMode::SupportedPids, _) => {
                let [a, b, c, d] = readings.supported_pids.raw();
                ["PIDs 01-20:".into(), format!("{a:02X} {b:02X} {c:02X} {d:02X}")]
            }
            (ViewMode::Live, Page::RpmSpeed) => {
                let speed = match use_metric {
                    true => format!("KM/H: {}", readings.vehicle_speed.to_kmh()),
                    false => format!("MPH: {}", readings.vehicle_speed.to_mph()),
                };
                [format!("RPM: {}", readings.engine_rpm), speed]
            }
            (ViewMode::Live, Page::LoadTemperature) => [
                format!("Load: {}%", readings.engine_load),
                format!("Temp: {}", readings.coolant_temp.to_string_with_unit(use_metric)),
            ],
        }
    }
}

/// Flag set by the refresh timer and cleared by the dashboard loop
#[derive(Debug, Clone, Default)]
pub struct RefreshFlag(Arc<AtomicBool>);

impl RefreshFlag {
    /// Requests a refresh
    pub fn set(&self) {
        self.0.store(true, Ordering::Release)
    }

    /// Returns true if a refresh was requested, clearing the request
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Returns true if a refresh is pending
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Background timer setting a [RefreshFlag] at a fixed interval
#[derive(Debug)]
pub struct RefreshTimer {
    flag: RefreshFlag,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshTimer {
    /// Starts the timer thread
    pub fn start(interval: Duration) -> Self {
        let flag = RefreshFlag::default();
        let running = Arc::new(AtomicBool::new(true));
        let flag_t = flag.clone();
        let running_t = running.clone();
        let handle = std::thread::spawn(move || {
            while running_t.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                flag_t.set();
            }
        });
        Self {
            flag,
            running,
            handle: Some(handle),
        }
    }

    /// Flag set by this timer
    pub fn flag(&self) -> RefreshFlag {
        self.flag.clone()
    }

    /// Stops the timer thread and waits for it to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Refresh timer thread panicked");
            }
        }
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.stop()
    }
}

/// The reader application: polls the ECU and drives the display from the keypad
#[derive(Debug)]
pub struct Dashboard<C, K, D, P> {
    poller: Poller<C, K>,
    display: D,
    keypad: P,
    refresh: RefreshFlag,
    config: DashboardConfig,
    view: ViewState,
    last_key: Option<u8>,
}

impl<C, K, D, P> Dashboard<C, K, D, P>
where
    C: KLineChannel,
    K: Clock,
    D: CharacterDisplay,
    P: Keypad,
{
    /// Creates the dashboard. Nothing is drawn until the first refresh
    pub fn new(
        poller: Poller<C, K>,
        display: D,
        keypad: P,
        refresh: RefreshFlag,
        config: DashboardConfig,
    ) -> Self {
        Self {
            poller,
            display,
            keypad,
            refresh,
            config,
            view: ViewState::default(),
            last_key: None,
        }
    }

    /// One pass of the application loop. The keypad is scanned and, if the refresh flag
    /// is set, a poll cycle is run and the display is redrawn.
    ///
    /// Returns the cycle report if a cycle was run
    pub fn run_once(&mut self) -> HardwareResult<Option<CycleReport>> {
        let key = self.keypad.pressed_key()?;
        if key != self.last_key {
            if let Some(k) = key {
                self.view.handle_key(k);
            }
            self.last_key = key;
        }

        if !self.refresh.take() {
            return Ok(None);
        }
        if !self.poller.session().is_ready() {
            self.show(["Initializing...".into(), String::new()])?;
        }
        let report = self.poller.poll_cycle();
        if report.handshake_error.is_some() {
            self.show(["Init failed".into(), "Retrying...".into()])?;
        } else {
            let lines = self.view.render(self.poller.readings(), self.config.use_metric);
            self.show(lines)?;
        }
        Ok(Some(report))
    }

    /// Runs the application loop until `keep_running` returns false
    pub fn run<F: FnMut() -> bool>(&mut self, mut keep_running: F) -> HardwareResult<()> {
        while keep_running() {
            self.run_once()?;
            self.poller.session_mut().clock_mut().delay_ms(self.config.keypad_scan_ms);
        }
        Ok(())
    }

    fn show(&mut self, lines: [String; 2]) -> HardwareResult<()> {
        let (rows, cols) = self.display.size();
        self.display.clear()?;
        for (row, line) in lines.iter().enumerate().take(rows as usize) {
            let text: String = line.chars().take(cols as usize).collect();
            self.display.set_position(row as u8, 0)?;
            self.display.write_str(&text)?;
        }
        Ok(())
    }

    /// Current view state
    pub fn view(&self) -> ViewState {
        self.view
    }

    /// The poller driving the session
    pub fn poller(&self) -> &Poller<C, K> {
        &self.poller
    }

    /// The display
    pub fn display(&self) -> &D {
        &self.display
    }
}
