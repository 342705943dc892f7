//! Binding table: which semantic event triggers which launcher action
//!
//! The table lives in `bindings.toml` as a list of `[[binding]]` entries:
//!
//! ```toml
//! [[binding]]
//! event = "long_press"
//! button = "Guide"
//! action = "ToggleVisibility"
//!
//! [[binding]]
//! event = "combo"
//! buttons = ["Start", "Select"]
//! action = "ToggleVisibility"
//! ```
//!
//! Entries are validated one by one. A broken entry is skipped with a warning,
//! the rest of the file still applies.

use crate::controller::device::ButtonType;
use crate::controller::gesture::{Direction, GestureKind};
use crate::mapping::{Action, MappingError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// The shape of a semantic event a binding matches on.
///
/// Direction patterns match the first event and every repeat alike.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventPattern {
    Tap(ButtonType),
    LongPress(ButtonType),
    Direction(Direction),
    Combo(BTreeSet<ButtonType>),
}

impl From<&GestureKind> for EventPattern {
    fn from(kind: &GestureKind) -> Self {
        match kind {
            GestureKind::Tap(button) => EventPattern::Tap(*button),
            GestureKind::LongPress(button) => EventPattern::LongPress(*button),
            GestureKind::Direction { direction, .. } => EventPattern::Direction(*direction),
            GestureKind::Combo(buttons) => EventPattern::Combo(buttons.clone()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BindingEntry {
    Tap {
        button: ButtonType,
        action: Action,
    },
    LongPress {
        button: ButtonType,
        action: Action,
    },
    Direction {
        direction: Direction,
        action: Action,
    },
    Combo {
        buttons: Vec<ButtonType>,
        action: Action,
    },
}

impl BindingEntry {
    fn into_binding(self) -> Result<(EventPattern, Action), String> {
        match self {
            BindingEntry::Tap { button, .. } | BindingEntry::LongPress { button, .. }
                if button.is_dpad() =>
            {
                Err(format!("{:?} only produces directions", button))
            }
            BindingEntry::Tap { button, action } => Ok((EventPattern::Tap(button), action)),
            BindingEntry::LongPress { button, action } => {
                Ok((EventPattern::LongPress(button), action))
            }
            BindingEntry::Direction { direction, action } => {
                Ok((EventPattern::Direction(direction), action))
            }
            BindingEntry::Combo { buttons, action } => {
                let buttons: BTreeSet<ButtonType> = buttons.into_iter().collect();
                if buttons.len() < 2 {
                    return Err("a combo needs at least two distinct buttons".to_string());
                }
                if buttons.iter().any(|b| b.is_dpad()) {
                    return Err("d-pad buttons cannot be part of a combo".to_string());
                }
                Ok((EventPattern::Combo(buttons), action))
            }
        }
    }
}

fn default_entries() -> Vec<BindingEntry> {
    use ButtonType::*;
    vec![
        BindingEntry::LongPress {
            button: Guide,
            action: Action::ToggleVisibility,
        },
        BindingEntry::Combo {
            buttons: vec![Start, Select],
            action: Action::ToggleVisibility,
        },
        BindingEntry::Tap {
            button: A,
            action: Action::Select,
        },
        BindingEntry::Tap {
            button: B,
            action: Action::Back,
        },
        BindingEntry::Tap {
            button: RightBumper,
            action: Action::PageNext,
        },
        BindingEntry::Tap {
            button: LeftBumper,
            action: Action::PagePrev,
        },
        BindingEntry::Direction {
            direction: Direction::Up,
            action: Action::NavigateUp,
        },
        BindingEntry::Direction {
            direction: Direction::Down,
            action: Action::NavigateDown,
        },
        BindingEntry::Direction {
            direction: Direction::Left,
            action: Action::NavigateLeft,
        },
        BindingEntry::Direction {
            direction: Direction::Right,
            action: Action::NavigateRight,
        },
    ]
}

#[derive(Deserialize)]
struct RawBindingFile {
    #[serde(default)]
    binding: Vec<toml::Value>,
}

#[derive(Serialize)]
struct BindingFile {
    binding: Vec<BindingEntry>,
}

/// Pattern to action table. Every pattern maps to exactly one action.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingTable {
    bindings: HashMap<EventPattern, Action>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_bindings() -> Self {
        let mut table = Self::new();
        for entry in default_entries() {
            if let Ok((pattern, action)) = entry.into_binding() {
                table.insert(pattern, action);
            }
        }
        table
    }

    /// Adds a binding unless the pattern is already bound. Returns whether it was added.
    pub fn insert(&mut self, pattern: EventPattern, action: Action) -> bool {
        if self.bindings.contains_key(&pattern) {
            return false;
        }
        self.bindings.insert(pattern, action);
        true
    }

    pub fn get(&self, pattern: &EventPattern) -> Option<Action> {
        self.bindings.get(pattern).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Button sets of every bound combo; the classifier gives these priority.
    pub fn combos(&self) -> impl Iterator<Item = BTreeSet<ButtonType>> + '_ {
        self.bindings.keys().filter_map(|pattern| match pattern {
            EventPattern::Combo(buttons) => Some(buttons.clone()),
            _ => None,
        })
    }

    /// Parses a binding file, skipping entries that do not validate.
    ///
    /// Only a file that is not TOML at all is an error.
    pub fn from_toml_str(content: &str) -> Result<Self, MappingError> {
        let raw: RawBindingFile =
            toml::from_str(content).map_err(|e| MappingError::Malformed(e.to_string()))?;

        let mut table = Self::new();
        for (index, value) in raw.binding.into_iter().enumerate() {
            let entry = value
                .try_into::<BindingEntry>()
                .map_err(|e| e.to_string())
                .and_then(BindingEntry::into_binding);

            match entry {
                Ok((pattern, action)) => {
                    if !table.insert(pattern.clone(), action) {
                        warn!(
                            "Binding #{} for {:?} ignored, pattern is already bound",
                            index, pattern
                        );
                    }
                }
                Err(reason) => {
                    let error = MappingError::InvalidEntry { index, reason };
                    warn!("Skipping binding: {}", error);
                }
            }
        }

        debug!("Parsed binding table with {} entries", table.len());
        Ok(table)
    }

    /// Loads the binding file, falling back to the defaults when it is missing or unreadable.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(table) => {
                    info!("Loaded {} bindings from {}", table.len(), path.display());
                    table
                }
                Err(e) => {
                    warn!("{} ({}), using default bindings", e, path.display());
                    Self::default_bindings()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No binding file at {}, using defaults", path.display());
                Self::default_bindings()
            }
            Err(e) => {
                warn!("{}, using default bindings", MappingError::Io(e));
                Self::default_bindings()
            }
        }
    }

    /// Writes the default binding file if none exists yet, so users have something to edit.
    pub async fn ensure_default_file(path: &Path) -> Result<(), MappingError> {
        if tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(&BindingFile {
            binding: default_entries(),
        })
        .map_err(|e| MappingError::Malformed(e.to_string()))?;
        tokio::fs::write(path, content).await?;
        info!("Wrote default bindings to {}", path.display());
        Ok(())
    }
}
