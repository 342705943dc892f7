//! Gesture Classifier - turns raw samples into discrete semantic events
//!
//! Every button runs through the same small state machine:
//!
//! ```text
//! Idle ──press──► Pressed ──release (< threshold)──► Idle   emits Tap
//!                    │
//!                    ├──held ≥ threshold──► Consumed ──release──► Idle   emits LongPress once
//!                    │
//!                    └──bound combo complete──► Consumed ──release──► Idle   emits Combo once
//! ```
//!
//! All timing is driven by sample timestamps, never by wall clock timers, so a
//! recorded sample sequence replays to exactly the same events.

use crate::controller::device::{AxisVector, ButtonType, RawSample};
use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Quantizes a stick deflection to its dominant cardinal direction.
    pub fn from_vector(axis: AxisVector, deadzone: f32) -> Option<Self> {
        let (ax, ay) = (axis.x.abs(), axis.y.abs());
        if ax < deadzone && ay < deadzone {
            return None;
        }
        let direction = if ay >= ax {
            if axis.y > 0.0 {
                Direction::Up
            } else {
                Direction::Down
            }
        } else if axis.x > 0.0 {
            Direction::Right
        } else {
            Direction::Left
        };
        Some(direction)
    }

    fn from_dpad(button: ButtonType) -> Option<Self> {
        match button {
            ButtonType::DPadUp => Some(Direction::Up),
            ButtonType::DPadDown => Some(Direction::Down),
            ButtonType::DPadLeft => Some(Direction::Left),
            ButtonType::DPadRight => Some(Direction::Right),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GestureKind {
    Tap(ButtonType),
    LongPress(ButtonType),
    Direction { direction: Direction, repeat: bool },
    Combo(BTreeSet<ButtonType>),
}

/// A classified input occurrence, stamped with the time it was classified.
#[derive(Clone, Debug, PartialEq)]
pub struct SemanticEvent {
    pub kind: GestureKind,
    pub timestamp: DateTime<Local>,
}

#[derive(Clone, Debug)]
pub struct ClassifierSettings {
    pub long_press: Duration,
    /// Raw transitions shorter than this are ignored
    pub glitch: Duration,
    pub repeat_delay: Duration,
    pub repeat_interval: Duration,
    pub direction_deadzone: f32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            long_press: Duration::from_millis(800),
            glitch: Duration::from_millis(30),
            repeat_delay: Duration::from_millis(400),
            repeat_interval: Duration::from_millis(120),
            direction_deadzone: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ButtonPhase {
    Pressed { since: DateTime<Local> },
    Consumed,
}

#[derive(Clone, Copy, Debug, Default)]
struct Debounce {
    level: bool,
    pending: Option<(bool, DateTime<Local>)>,
}

#[derive(Clone, Copy, Debug)]
struct Transition {
    button: ButtonType,
    pressed: bool,
    at: DateTime<Local>,
}

#[derive(Clone, Copy, Debug)]
struct HeldDirection {
    direction: Direction,
    next_repeat: DateTime<Local>,
}

pub struct GestureClassifier {
    long_press: TimeDelta,
    glitch: TimeDelta,
    repeat_delay: TimeDelta,
    repeat_interval: TimeDelta,
    direction_deadzone: f32,

    // Bound combos, largest first
    combos: Vec<BTreeSet<ButtonType>>,

    debounce: BTreeMap<ButtonType, Debounce>,
    // Buttons missing from the map are idle
    phases: BTreeMap<ButtonType, ButtonPhase>,
    held_direction: Option<HeldDirection>,
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

impl GestureClassifier {
    pub fn new(settings: &ClassifierSettings) -> Self {
        debug!("Creating gesture classifier with settings: {:?}", settings);
        Self {
            long_press: delta(settings.long_press),
            glitch: delta(settings.glitch),
            repeat_delay: delta(settings.repeat_delay),
            repeat_interval: delta(settings.repeat_interval),
            direction_deadzone: settings.direction_deadzone,
            combos: Vec::new(),
            debounce: BTreeMap::new(),
            phases: BTreeMap::new(),
            held_direction: None,
        }
    }

    /// Replaces the set of combos that take priority over single-button gestures.
    pub fn set_combos<I>(&mut self, combos: I)
    where
        I: IntoIterator<Item = BTreeSet<ButtonType>>,
    {
        let mut combos: Vec<_> = combos
            .into_iter()
            .filter(|combo| combo.len() >= 2 && !combo.iter().any(|b| b.is_dpad()))
            .collect();
        combos.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        combos.dedup();
        debug!("Classifier tracks {} combos", combos.len());
        self.combos = combos;
    }

    /// Forgets all held buttons, e.g. after the device went away.
    pub fn reset(&mut self) {
        self.debounce.clear();
        self.phases.clear();
        self.held_direction = None;
    }

    /// Advances every button state to `sample.timestamp` and returns what fired.
    pub fn tick(&mut self, sample: &RawSample) -> Vec<SemanticEvent> {
        let now = sample.timestamp;
        let mut events = Vec::new();

        let mut transitions = self.debounce_sample(sample);
        transitions.sort_by(|a, b| a.at.cmp(&b.at).then(a.button.cmp(&b.button)));

        for transition in transitions {
            trace!("Debounced transition: {:?}", transition);
            if transition.button.is_dpad() {
                continue;
            }
            if transition.pressed {
                self.phases.insert(
                    transition.button,
                    ButtonPhase::Pressed {
                        since: transition.at,
                    },
                );
                self.fire_combos(now, &mut events);
            } else {
                self.release(transition.button, transition.at, now, &mut events);
            }
        }

        self.fire_long_presses(now, &mut events);
        self.track_direction(sample, now, &mut events);

        for event in &events {
            debug!("Classified {:?} at {}", event.kind, now.format("%H:%M:%S.%3f"));
        }
        events
    }

    fn debounce_sample(&mut self, sample: &RawSample) -> Vec<Transition> {
        let now = sample.timestamp;
        let mut buttons: BTreeSet<ButtonType> = self.debounce.keys().copied().collect();
        buttons.extend(sample.pressed.iter().copied());

        let mut transitions = Vec::new();
        for button in buttons {
            let raw = sample.pressed.contains(&button);
            let state = self.debounce.entry(button).or_default();

            if raw == state.level {
                state.pending = None;
                continue;
            }

            let since = match state.pending {
                Some((level, since)) if level == raw => since,
                _ => {
                    state.pending = Some((raw, now));
                    now
                }
            };

            if now - since >= self.glitch {
                state.level = raw;
                state.pending = None;
                transitions.push(Transition {
                    button,
                    pressed: raw,
                    at: since,
                });
            }
        }

        self.debounce
            .retain(|_, state| state.level || state.pending.is_some());
        transitions
    }

    fn release(
        &mut self,
        button: ButtonType,
        at: DateTime<Local>,
        now: DateTime<Local>,
        events: &mut Vec<SemanticEvent>,
    ) {
        match self.phases.remove(&button) {
            Some(ButtonPhase::Pressed { since }) => {
                // A hold that crossed the threshold between two ticks is still a long press
                let kind = if at - since >= self.long_press {
                    GestureKind::LongPress(button)
                } else {
                    GestureKind::Tap(button)
                };
                events.push(SemanticEvent {
                    kind,
                    timestamp: now,
                });
            }
            Some(ButtonPhase::Consumed) => {
                trace!("Consumed button {:?} released", button);
            }
            None => {}
        }
    }

    fn fire_combos(&mut self, now: DateTime<Local>, events: &mut Vec<SemanticEvent>) {
        for combo in &self.combos {
            let complete = combo
                .iter()
                .all(|b| matches!(self.phases.get(b), Some(ButtonPhase::Pressed { .. })));
            if !complete {
                continue;
            }
            for button in combo {
                self.phases.insert(*button, ButtonPhase::Consumed);
            }
            events.push(SemanticEvent {
                kind: GestureKind::Combo(combo.clone()),
                timestamp: now,
            });
        }
    }

    fn fire_long_presses(&mut self, now: DateTime<Local>, events: &mut Vec<SemanticEvent>) {
        for (button, phase) in self.phases.iter_mut() {
            if let ButtonPhase::Pressed { since } = *phase {
                if now - since >= self.long_press {
                    *phase = ButtonPhase::Consumed;
                    events.push(SemanticEvent {
                        kind: GestureKind::LongPress(*button),
                        timestamp: now,
                    });
                }
            }
        }
    }

    fn track_direction(
        &mut self,
        sample: &RawSample,
        now: DateTime<Local>,
        events: &mut Vec<SemanticEvent>,
    ) {
        // D-pad wins over the stick
        let dpad = self
            .debounce
            .iter()
            .filter(|(_, state)| state.level)
            .find_map(|(button, _)| Direction::from_dpad(*button));
        let current = dpad.or_else(|| Direction::from_vector(sample.axis, self.direction_deadzone));

        let Some(direction) = current else {
            self.held_direction = None;
            return;
        };

        if let Some(held) = self.held_direction.as_mut() {
            if held.direction == direction {
                if now >= held.next_repeat {
                    held.next_repeat = now + self.repeat_interval;
                    events.push(SemanticEvent {
                        kind: GestureKind::Direction {
                            direction,
                            repeat: true,
                        },
                        timestamp: now,
                    });
                }
                return;
            }
        }

        events.push(SemanticEvent {
            kind: GestureKind::Direction {
                direction,
                repeat: false,
            },
            timestamp: now,
        });
        self.held_direction = Some(HeldDirection {
            direction,
            next_repeat: now + self.repeat_delay,
        });
    }
}
