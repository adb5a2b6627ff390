//! In-memory dialogue state, keyed by correspondent
//!
//! Owned by the dispatcher loop; nothing else reads or writes it.

use crate::state_machine::ConvState;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SessionStore {
    states: HashMap<String, ConvState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing state, or a fresh main-menu state inserted on the spot
    #[allow(dead_code)] // Lazy-creation entry point; the dispatcher goes through `lookup`/`put`
    pub fn get(&mut self, correspondent: &str) -> &mut ConvState {
        self.states
            .entry(correspondent.to_string())
            .or_insert_with(ConvState::fresh)
    }

    pub fn lookup(&self, correspondent: &str) -> Option<&ConvState> {
        self.states.get(correspondent)
    }

    pub fn has(&self, correspondent: &str) -> bool {
        self.states.contains_key(correspondent)
    }

    pub fn put(&mut self, correspondent: &str, state: ConvState) {
        self.states.insert(correspondent.to_string(), state);
    }

    pub fn delete(&mut self, correspondent: &str) -> Option<ConvState> {
        self.states.remove(correspondent)
    }

    /// Store a transition outcome: `None` removes the entry
    pub fn apply(&mut self, correspondent: &str, state: Option<ConvState>) {
        match state {
            Some(state) => self.put(correspondent, state),
            None => {
                self.delete(correspondent);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[allow(dead_code)] // Pairs with len()
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
