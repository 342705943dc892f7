//! Action Router

use crate::controller::gesture::SemanticEvent;
use crate::mapping::{Action, BindingTable, EventPattern};

/// Looks up the action bound to an event. Unbound events yield `None`.
pub fn route(event: &SemanticEvent, table: &BindingTable) -> Option<Action> {
    table.get(&EventPattern::from(&event.kind))
}
