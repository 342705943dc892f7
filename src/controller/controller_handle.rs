//! Controller Handle - runs the input pipeline on its own thread
//!
//! ```text
//! DeviceReader ─[RawSample]→ GestureClassifier ─[SemanticEvent]→ route() ─[Action]→ ActionSink
//! ```
//!
//! Everything happens on one dedicated OS thread so the gamepad is polled at a
//! steady cadence no matter how busy the async runtime is. The only things
//! crossing the thread boundary are the binding table (a `watch` receiver) and
//! the sink, which never blocks.

use crate::controller::device::{
    DeviceError, DeviceReader, DeviceSettings, GilrsBackend, InputBackend,
};
use crate::controller::gesture::{ClassifierSettings, GestureClassifier};
use crate::ipc::hub::{ActionSink, Delivery};
use crate::mapping::{route, BindingTable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Configuration for the complete input pipeline, the `[controller]` config section.
///
/// Split into [`DeviceSettings`] and [`ClassifierSettings`] when the loop starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Case-insensitive gamepad name substring; empty or missing selects the first pad
    pub selector: Option<String>,

    /// Device poll timeout, ~60 Hz by default
    pub poll_interval_ms: u64,

    /// Hold time after which a press becomes a long press
    pub long_press_ms: u64,

    /// Level changes shorter than this are treated as contact bounce
    pub glitch_ms: u64,

    pub repeat_delay_ms: u64,
    pub repeat_interval_ms: u64,

    /// Stick deflection needed to count as a direction
    pub direction_deadzone: f32,

    /// Stick drift filter applied before anything else
    pub joystick_deadzone: f32,

    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            selector: None,
            poll_interval_ms: 16,
            long_press_ms: 800,
            glitch_ms: 30,
            repeat_delay_ms: 400,
            repeat_interval_ms: 120,
            direction_deadzone: 0.5,
            joystick_deadzone: 0.05,
            reconnect_backoff_ms: 1000,
            max_reconnect_backoff_ms: 10_000,
        }
    }
}

impl ControllerSettings {
    /// Distributes the settings to the reader and the classifier.
    pub fn split(&self) -> (DeviceSettings, ClassifierSettings) {
        let selector = self
            .selector
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let device = DeviceSettings {
            selector,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms.max(1)),
            max_reconnect_backoff: Duration::from_millis(
                self.max_reconnect_backoff_ms.max(self.reconnect_backoff_ms.max(1)),
            ),
            joystick_deadzone: self.joystick_deadzone.clamp(0.0, 0.95),
        };
        let classifier = ClassifierSettings {
            long_press: Duration::from_millis(self.long_press_ms),
            glitch: Duration::from_millis(self.glitch_ms),
            repeat_delay: Duration::from_millis(self.repeat_delay_ms),
            repeat_interval: Duration::from_millis(self.repeat_interval_ms.max(1)),
            direction_deadzone: self.direction_deadzone.clamp(0.0, 1.0),
        };
        (device, classifier)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Failed to spawn polling thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Builds the input backend on the polling thread; gilrs handles must not cross threads.
pub type BackendFactory = Box<dyn FnOnce() -> Box<dyn InputBackend> + Send>;

/// Factory for the gilrs backend used by the daemon.
pub fn gilrs_backend(joystick_deadzone: f32) -> BackendFactory {
    Box::new(move || Box::new(GilrsBackend::new(joystick_deadzone)) as Box<dyn InputBackend>)
}

/// Owns the polling thread. Stop it by cancelling the token passed to [`ControllerHandle::spawn`].
pub struct ControllerHandle {
    thread: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn spawn(
        factory: BackendFactory,
        settings: ControllerSettings,
        bindings: watch::Receiver<Arc<BindingTable>>,
        sink: Arc<dyn ActionSink>,
        cancel: CancellationToken,
    ) -> Result<Self, ControllerError> {
        info!("Initializing controller pipeline with settings: {:?}", settings);
        let (device_settings, classifier_settings) = settings.split();
        debug!(
            "Split settings: device={:?}, classifier={:?}",
            device_settings, classifier_settings
        );

        let thread = std::thread::Builder::new()
            .name("controller-poll".to_string())
            .spawn(move || {
                let backend = factory();
                run_polling_loop(
                    backend,
                    device_settings,
                    classifier_settings,
                    bindings,
                    sink,
                    cancel,
                );
            })?;

        info!("Controller polling thread spawned");
        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Waits for the polling thread to exit. Blocks; call from a blocking context.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Controller polling thread panicked");
            }
        }
    }
}

fn run_polling_loop(
    backend: Box<dyn InputBackend>,
    device_settings: DeviceSettings,
    classifier_settings: ClassifierSettings,
    mut bindings: watch::Receiver<Arc<BindingTable>>,
    sink: Arc<dyn ActionSink>,
    cancel: CancellationToken,
) {
    let poll_interval = device_settings.poll_interval;
    let mut classifier = GestureClassifier::new(&classifier_settings);
    let mut table = bindings.borrow_and_update().clone();
    classifier.set_combos(table.combos());

    let mut reader = DeviceReader::create(backend, device_settings);

    loop {
        let Some(mut connected) = reader.connect(&cancel) else {
            break;
        };

        loop {
            if cancel.is_cancelled() {
                info!("Controller polling loop stopping");
                return;
            }

            if bindings.has_changed().unwrap_or(false) {
                table = bindings.borrow_and_update().clone();
                classifier.set_combos(table.combos());
                info!("Polling loop picked up {} bindings", table.len());
            }

            match connected.poll() {
                Ok(sample) => {
                    for event in classifier.tick(&sample) {
                        let Some(action) = route(&event, &table) else {
                            trace!("Unbound event {:?}", event.kind);
                            continue;
                        };
                        match sink.send(action) {
                            Delivery::Delivered => debug!("{:?} -> {:?}", event.kind, action),
                            Delivery::NoListener => {
                                debug!("{:?} dropped, no listener attached", action)
                            }
                            Delivery::Dropped => warn!("{:?} dropped, listener queue full", action),
                        }
                    }
                }
                Err(DeviceError::DeviceLost(reason)) => {
                    warn!("Lost gamepad {}: {}", connected.device_name(), reason);
                    classifier.reset();
                    break;
                }
                Err(e) => {
                    warn!("Poll failed: {}", e);
                    std::thread::sleep(poll_interval);
                }
            }
        }

        reader = connected.disconnect();
    }

    info!("Controller polling loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::device::testing::{ScriptedBackend, Step};
    use crate::controller::device::{ButtonType, RawSample};
    use crate::mapping::Action;
    use chrono::{Local, TimeDelta};
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        actions: Mutex<Vec<Action>>,
    }

    impl ActionSink for RecordingSink {
        fn send(&self, action: Action) -> Delivery {
            self.actions.lock().unwrap().push(action);
            Delivery::Delivered
        }
    }

    fn fast_settings() -> ControllerSettings {
        ControllerSettings {
            poll_interval_ms: 1,
            reconnect_backoff_ms: 1,
            max_reconnect_backoff_ms: 2,
            ..ControllerSettings::default()
        }
    }

    // Guide held for `hold_ms`, sampled every 16 ms, stamped in the past so
    // live idle samples that follow are strictly later
    fn guide_hold(hold_ms: i64) -> VecDeque<Step> {
        let base = Local::now() - TimeDelta::seconds(5);
        let mut script = VecDeque::new();
        let mut t = 0;
        while t <= hold_ms {
            script.push_back(Step::Sample(RawSample {
                timestamp: base + TimeDelta::milliseconds(t),
                pressed: BTreeSet::from([ButtonType::Guide]),
                axis: Default::default(),
            }));
            t += 16;
        }
        for extra in [0, 16, 32, 48, 64] {
            script.push_back(Step::Sample(RawSample::idle(
                base + TimeDelta::milliseconds(hold_ms + 16 + extra),
            )));
        }
        script
    }

    fn wait_for(sink: &RecordingSink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.actions.lock().unwrap().len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn spawn_scripted(
        script: VecDeque<Step>,
        sink: Arc<RecordingSink>,
    ) -> (ControllerHandle, CancellationToken, Arc<Mutex<usize>>) {
        let opens = Arc::new(Mutex::new(0));
        let backend = ScriptedBackend {
            failures_before_open: 0,
            script: Arc::new(Mutex::new(script)),
            opens: opens.clone(),
        };
        let (_tx, rx) = watch::channel(Arc::new(BindingTable::default_bindings()));
        let cancel = CancellationToken::new();
        let handle = ControllerHandle::spawn(
            Box::new(move || Box::new(backend) as Box<dyn InputBackend>),
            fast_settings(),
            rx,
            sink,
            cancel.clone(),
        )
        .expect("spawn polling thread");
        (handle, cancel, opens)
    }

    #[test]
    fn guide_hold_toggles_visibility_exactly_once() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, cancel, _) = spawn_scripted(guide_hold(900), sink.clone());

        wait_for(&sink, 1);
        // Give a stray second delivery the chance to show up
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        handle.join();

        assert_eq!(*sink.actions.lock().unwrap(), vec![Action::ToggleVisibility]);
    }

    #[test]
    fn lost_device_resets_and_reconnects() {
        let mut script = guide_hold(300);
        // Drop the pad halfway through a press; the press must not leak into a tap
        script.truncate(5);
        script.push_back(Step::Lost);

        let sink = Arc::new(RecordingSink::default());
        let (handle, cancel, opens) = spawn_scripted(script, sink.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while *opens.lock().unwrap() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        cancel.cancel();
        handle.join();

        assert_eq!(*opens.lock().unwrap(), 2);
        assert!(sink.actions.lock().unwrap().is_empty());
    }

    #[test]
    fn settings_split_clamps_and_trims() {
        let settings = ControllerSettings {
            selector: Some("  ".to_string()),
            reconnect_backoff_ms: 5000,
            max_reconnect_backoff_ms: 100,
            ..ControllerSettings::default()
        };
        let (device, classifier) = settings.split();
        assert_eq!(device.selector, None);
        assert_eq!(device.max_reconnect_backoff, Duration::from_millis(5000));
        assert_eq!(classifier.long_press, Duration::from_millis(800));
    }
}
