//! Background initialization state machine.

use std::fmt;

use serde::Serialize;

/// `Created → Configuring → LoadingModel → Syncing → Ready`.
///
/// There is no failed state: a model that will not load or a sync that
/// degrades still ends in `Ready`, with local search disabled or routed
/// remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    #[default]
    Created,
    Configuring,
    LoadingModel,
    Syncing,
    Ready,
}

impl InitState {
    pub fn is_ready(&self) -> bool {
        matches!(self, InitState::Ready)
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InitState::Created => "created",
            InitState::Configuring => "configuring",
            InitState::LoadingModel => "loading_model",
            InitState::Syncing => "syncing",
            InitState::Ready => "ready",
        };
        f.write_str(s)
    }
}
