//! Device Reader - owns the gamepad handle and turns it into raw samples
//!
//! The reader is a typestate machine:
//!
//! ```text
//! Disconnected ──connect()──► Connected ──poll()──► RawSample ...
//!      ▲                          │
//!      └──────disconnect()────────┘   (DeviceLost)
//! ```
//!
//! `connect` keeps retrying with an exponential backoff until a matching
//! gamepad shows up or the stop signal is raised, so a controller can be
//! plugged in (or re-plugged) at any time.

use chrono::{DateTime, Local, TimeDelta};
use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use serde::{Deserialize, Serialize};
use statum::{machine, state};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Button type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ButtonType {
    A,
    B,
    X,
    Y,
    Start,
    Select,
    LeftBumper,
    RightBumper,
    LeftStick,
    RightStick,
    DPadUp,
    DPadDown,
    DPadLeft,
    DPadRight,
    Guide,
}

impl ButtonType {
    pub fn is_dpad(self) -> bool {
        matches!(
            self,
            ButtonType::DPadUp | ButtonType::DPadDown | ButtonType::DPadLeft | ButtonType::DPadRight
        )
    }
}

/// Normalized analog stick deflection, both axes in [-1, 1], y positive is up.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AxisVector {
    pub x: f32,
    pub y: f32,
}

/// One polling tick worth of controller state.
#[derive(Clone, Debug)]
pub struct RawSample {
    pub timestamp: DateTime<Local>,
    pub pressed: BTreeSet<ButtonType>,
    pub axis: AxisVector,
}

impl RawSample {
    pub fn idle(timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp,
            pressed: BTreeSet::new(),
            axis: AxisVector::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeviceSettings {
    /// Case-insensitive substring of the gamepad name; `None` takes the first pad
    pub selector: Option<String>,
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnect_backoff: Duration,
    pub joystick_deadzone: f32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            selector: None,
            poll_interval: Duration::from_millis(16),
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(10),
            joystick_deadzone: 0.05,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No matching gamepad connected: {0}")]
    NotFound(String),

    #[error("Gamepad disconnected: {0}")]
    DeviceLost(String),

    #[error("Failed to initialize input backend: {0}")]
    Initialization(String),
}

/// Raw access to one physical gamepad.
///
/// Implementations keep whatever context they need between `open` calls so a
/// reconnect does not have to rebuild the whole input stack.
pub trait InputBackend {
    /// Selects a connected gamepad and returns its display name.
    fn open(&mut self, selector: Option<&str>) -> Result<String, DeviceError>;

    /// Blocks up to `timeout` and returns the current state of the open gamepad.
    fn poll(&mut self, timeout: Duration) -> Result<RawSample, DeviceError>;
}

/// Wall-clock timestamps that advance with [`Instant`].
///
/// The wall clock is read once; NTP steps or manual clock changes afterwards
/// do not move the stamps, so hold durations stay exact.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
    origin_wall: DateTime<Local>,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_wall: Local::now(),
        }
    }

    pub fn now(&self) -> DateTime<Local> {
        TimeDelta::from_std(self.origin.elapsed())
            .ok()
            .and_then(|elapsed| self.origin_wall.checked_add_signed(elapsed))
            .unwrap_or(self.origin_wall)
    }
}

/// A gamepad as gilrs reports it, for listing and selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GamepadInfo {
    pub id: usize,
    pub name: String,
}

/// Index of the pad `selector` picks: the first whose name contains it,
/// case-insensitively, or simply the first pad without a selector.
pub fn select_gamepad(pads: &[GamepadInfo], selector: Option<&str>) -> Option<usize> {
    let wanted = selector.map(str::to_lowercase);
    pads.iter().position(|pad| match &wanted {
        Some(wanted) => pad.name.to_lowercase().contains(wanted),
        None => true,
    })
}

/// gilrs backed implementation used by the daemon.
pub struct GilrsBackend {
    gilrs: Option<Gilrs>,
    active: Option<GamepadId>,
    joystick_deadzone: f32,
    clock: MonotonicClock,
}

const TRACKED_BUTTONS: [Button; 15] = [
    Button::South,
    Button::East,
    Button::North,
    Button::West,
    Button::Start,
    Button::Select,
    Button::LeftTrigger,
    Button::RightTrigger,
    Button::LeftThumb,
    Button::RightThumb,
    Button::DPadUp,
    Button::DPadDown,
    Button::DPadLeft,
    Button::DPadRight,
    Button::Mode,
];

impl GilrsBackend {
    /// The gilrs context is created lazily on the first `open`, so a missing
    /// input subsystem is retried like a missing gamepad.
    pub fn new(joystick_deadzone: f32) -> Self {
        Self {
            gilrs: None,
            active: None,
            joystick_deadzone,
            clock: MonotonicClock::new(),
        }
    }

    fn context(&mut self) -> Result<&mut Gilrs, DeviceError> {
        if self.gilrs.is_none() {
            info!("Initializing gilrs controller interface");
            let gilrs = Gilrs::new().map_err(|e| DeviceError::Initialization(e.to_string()))?;
            self.gilrs = Some(gilrs);
        }
        let Some(gilrs) = self.gilrs.as_mut() else {
            return Err(DeviceError::Initialization(
                "gilrs context unavailable".to_string(),
            ));
        };

        // Drain queued events so hotplugged pads show up as connected
        while gilrs.next_event().is_some() {}
        Ok(gilrs)
    }

    fn connected(&mut self) -> Result<Vec<(GamepadId, GamepadInfo)>, DeviceError> {
        let gilrs = self.context()?;
        Ok(gilrs
            .gamepads()
            .filter(|(_, gamepad)| gamepad.is_connected())
            .map(|(id, gamepad)| {
                debug!("  candidate gamepad {}: {}", id, gamepad.name());
                (
                    id,
                    GamepadInfo {
                        id: id.into(),
                        name: gamepad.name().to_string(),
                    },
                )
            })
            .collect())
    }

    /// Currently connected gamepads, in gilrs order.
    pub fn gamepads(&mut self) -> Result<Vec<GamepadInfo>, DeviceError> {
        Ok(self.connected()?.into_iter().map(|(_, info)| info).collect())
    }
}

impl InputBackend for GilrsBackend {
    fn open(&mut self, selector: Option<&str>) -> Result<String, DeviceError> {
        let mut pads = self.connected()?;
        let infos: Vec<GamepadInfo> = pads.iter().map(|(_, info)| info.clone()).collect();

        match select_gamepad(&infos, selector) {
            Some(index) => {
                let (id, info) = pads.swap_remove(index);
                self.active = Some(id);
                Ok(info.name)
            }
            None => Err(DeviceError::NotFound(
                selector.unwrap_or("any gamepad").to_string(),
            )),
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<RawSample, DeviceError> {
        let (Some(gilrs), Some(active)) = (self.gilrs.as_mut(), self.active) else {
            return Err(DeviceError::DeviceLost("no gamepad opened".to_string()));
        };

        let mut next = gilrs.next_event_blocking(Some(timeout));
        while let Some(Event { id, event, .. }) = next {
            if id == active && matches!(event, EventType::Disconnected) {
                self.active = None;
                return Err(DeviceError::DeviceLost(format!("gamepad {} removed", id)));
            }
            next = gilrs.next_event();
        }

        let Some(gamepad) = gilrs.connected_gamepad(active) else {
            self.active = None;
            return Err(DeviceError::DeviceLost(format!("gamepad {} gone", active)));
        };

        let pressed = TRACKED_BUTTONS
            .iter()
            .filter(|button| gamepad.is_pressed(**button))
            .filter_map(|button| map_button(*button))
            .collect();
        let axis = AxisVector {
            x: apply_deadzone(gamepad.value(Axis::LeftStickX), self.joystick_deadzone),
            y: apply_deadzone(gamepad.value(Axis::LeftStickY), self.joystick_deadzone),
        };

        Ok(RawSample {
            timestamp: self.clock.now(),
            pressed,
            axis,
        })
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum ReaderState {
    Disconnected,
    Connected,
}

#[machine]
pub struct DeviceReader<S: ReaderState> {
    backend: Box<dyn InputBackend>,
    settings: DeviceSettings,
    device_name: Option<String>,
}

impl<S: ReaderState> DeviceReader<S> {
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }
}

impl DeviceReader<Disconnected> {
    pub fn create(backend: Box<dyn InputBackend>, settings: DeviceSettings) -> Self {
        debug!("Creating device reader with settings: {:?}", settings);
        Self::new(backend, settings, None)
    }

    /// Retries `open` until a gamepad is found. Returns `None` once `cancel` fires.
    pub fn connect(mut self, cancel: &CancellationToken) -> Option<DeviceReader<Connected>> {
        let mut backoff = self.settings.reconnect_backoff;
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return None;
            }

            match self.backend.open(self.settings.selector.as_deref()) {
                Ok(name) => {
                    info!("Selected gamepad: {} (after {} retries)", name, attempts);
                    self.device_name = Some(name);
                    return Some(self.transition());
                }
                Err(e) if attempts == 0 => {
                    warn!("{}, retrying every {:?} or slower", e, backoff)
                }
                Err(e) => debug!("Open attempt {} failed: {}", attempts, e),
            }

            attempts += 1;
            if !sleep_unless_cancelled(backoff, cancel) {
                return None;
            }
            backoff = (backoff * 2).min(self.settings.max_reconnect_backoff);
        }
    }
}

impl DeviceReader<Connected> {
    pub fn device_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or("unknown")
    }

    pub fn poll(&mut self) -> Result<RawSample, DeviceError> {
        self.backend.poll(self.settings.poll_interval)
    }

    pub fn disconnect(mut self) -> DeviceReader<Disconnected> {
        info!("Releasing gamepad {}", self.device_name());
        self.device_name = None;
        self.transition()
    }
}

// Sleeps in short slices; false if cancelled meanwhile
fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) -> bool {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}

// Helper function to map gilrs Button to our ButtonType
fn map_button(button: Button) -> Option<ButtonType> {
    match button {
        Button::South => Some(ButtonType::A),
        Button::East => Some(ButtonType::B),
        Button::West => Some(ButtonType::X),
        Button::North => Some(ButtonType::Y),
        Button::Start => Some(ButtonType::Start),
        Button::Select => Some(ButtonType::Select),
        Button::LeftTrigger => Some(ButtonType::LeftBumper),
        Button::RightTrigger => Some(ButtonType::RightBumper),
        Button::LeftThumb => Some(ButtonType::LeftStick),
        Button::RightThumb => Some(ButtonType::RightStick),
        Button::DPadUp => Some(ButtonType::DPadUp),
        Button::DPadDown => Some(ButtonType::DPadDown),
        Button::DPadLeft => Some(ButtonType::DPadLeft),
        Button::DPadRight => Some(ButtonType::DPadRight),
        Button::Mode => Some(ButtonType::Guide),
        _ => None,
    }
}

// Helper function to apply deadzone to analog stick values
fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() < deadzone {
        0.0
    } else {
        // Rescale the value to the range outside the deadzone
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedBackend, Step};
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn fast_settings() -> DeviceSettings {
        DeviceSettings {
            reconnect_backoff: Duration::from_millis(1),
            max_reconnect_backoff: Duration::from_millis(4),
            poll_interval: Duration::from_millis(1),
            ..DeviceSettings::default()
        }
    }

    #[test]
    fn deadzone_zeroes_small_values_and_rescales_the_rest() {
        assert_eq!(apply_deadzone(0.04, 0.05), 0.0);
        assert_eq!(apply_deadzone(-0.04, 0.05), 0.0);
        assert!((apply_deadzone(1.0, 0.05) - 1.0).abs() < f32::EPSILON);
        assert!(apply_deadzone(-0.5, 0.05) < 0.0);
    }

    #[test]
    fn guide_is_mapped_like_any_other_button() {
        assert_eq!(map_button(Button::Mode), Some(ButtonType::Guide));
        assert_eq!(map_button(Button::South), Some(ButtonType::A));
        assert_eq!(map_button(Button::C), None);
    }

    #[test]
    fn connect_retries_until_a_pad_appears() {
        let opens = Arc::new(Mutex::new(0));
        let backend = ScriptedBackend {
            failures_before_open: 3,
            script: Arc::new(Mutex::new(VecDeque::new())),
            opens: opens.clone(),
        };
        let reader = DeviceReader::create(Box::new(backend), fast_settings());
        let cancel = CancellationToken::new();

        let connected = reader.connect(&cancel).expect("reader should connect");
        assert_eq!(connected.device_name(), "Scripted Pad");
        assert_eq!(*opens.lock().unwrap(), 1);
    }

    #[test]
    fn connect_gives_up_once_cancelled() {
        let backend = ScriptedBackend {
            failures_before_open: usize::MAX,
            script: Arc::new(Mutex::new(VecDeque::new())),
            opens: Arc::new(Mutex::new(0)),
        };
        let reader = DeviceReader::create(Box::new(backend), fast_settings());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(reader.connect(&cancel).is_none());
    }

    #[test]
    fn lost_device_goes_back_to_disconnected_and_reconnects() {
        let script = Arc::new(Mutex::new(VecDeque::from([Step::Lost])));
        let opens = Arc::new(Mutex::new(0));
        let backend = ScriptedBackend {
            failures_before_open: 0,
            script,
            opens: opens.clone(),
        };
        let cancel = CancellationToken::new();
        let mut connected = DeviceReader::create(Box::new(backend), fast_settings())
            .connect(&cancel)
            .expect("first connect");

        assert!(matches!(connected.poll(), Err(DeviceError::DeviceLost(_))));
        let reader = connected.disconnect();
        let mut connected = reader.connect(&cancel).expect("second connect");
        assert!(connected.poll().is_ok());
        assert_eq!(*opens.lock().unwrap(), 2);
    }

    fn pad(id: usize, name: &str) -> GamepadInfo {
        GamepadInfo {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn selector_matches_name_substrings_case_insensitively() {
        let pads = [pad(0, "Xbox Wireless Controller"), pad(3, "8BitDo Pro 2")];
        assert_eq!(select_gamepad(&pads, None), Some(0));
        assert_eq!(select_gamepad(&pads, Some("8bitdo")), Some(1));
        assert_eq!(select_gamepad(&pads, Some("dualsense")), None);
        assert_eq!(select_gamepad(&[], None), None);
    }

    #[test]
    fn monotonic_stamps_follow_elapsed_time() {
        let clock = MonotonicClock::new();
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(20));
        let second = clock.now();

        assert!(second - first >= TimeDelta::milliseconds(20));
        assert!(second - first < TimeDelta::seconds(5));
    }
}
