use super::{ComponentState, EdgewatchOrchestrator};
use std::collections::HashMap;
use tracing::debug;

impl EdgewatchOrchestrator {
    pub fn set_component_state(&self, component: &str, state: ComponentState) {
        debug!("Component '{}' state changed to: {:?}", component, state);
        self.component_states
            .lock()
            .insert(component.to_string(), state);
    }

    pub fn get_component_state(&self, component: &str) -> Option<ComponentState> {
        self.component_states.lock().get(component).cloned()
    }

    pub fn get_all_component_states(&self) -> HashMap<String, ComponentState> {
        self.component_states.lock().clone()
    }
}
