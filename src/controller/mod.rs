//! Controller subsystem for gamepad input handling
//!
//! 1. [`device`] - gamepad handle, raw samples, reconnect with backoff
//! 2. [`gesture`] - debounce and classification into semantic events
//! 3. [`controller_handle`] - the polling thread tying both to the action router
//!
//! ```text
//! Gamepad ──► DeviceReader ──► GestureClassifier ──► route() ──► ActionSink
//!             (RawSample)      (SemanticEvent)       (Action)
//! ```

pub mod controller_handle;
pub mod device;
pub mod gesture;

pub use controller_handle::{ControllerHandle, ControllerSettings};
