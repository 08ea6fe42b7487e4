use async_relay::{RelayContext, StartupHealthGate};

/// Shared by every handler; all fields are cheap clones
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayContext,
    pub gate: StartupHealthGate,
}

impl AppState {
    pub fn new(relay: RelayContext, gate: StartupHealthGate) -> Self {
        Self { relay, gate }
    }
}
