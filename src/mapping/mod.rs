//! Mapping from classified gestures to launcher actions.
//!
//! The binding table is user-editable and reloadable, the router itself holds no state.

pub mod binding;
pub mod error;
pub mod router;

pub use binding::{BindingTable, EventPattern};
pub use error::MappingError;
pub use router::route;

use serde::{Deserialize, Serialize};

/// What the UI should do in response to controller input
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    ToggleVisibility,
    NavigateUp,
    NavigateDown,
    NavigateLeft,
    NavigateRight,
    Select,
    Back,
    PageNext,
    PagePrev,
}
