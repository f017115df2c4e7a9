mod classifier;
mod patterns;

pub use classifier::{ClassifierSettings, StreamClassifier};
pub use patterns::{strip_ansi, PatternRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the supported interactive AI coding CLIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Claude,
    Gemini,
    Codex,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [EngineKind::Claude, EngineKind::Gemini, EngineKind::Codex];

    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Claude => "claude",
            EngineKind::Gemini => "gemini",
            EngineKind::Codex => "codex",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No process activity observed yet
    #[default]
    Idle,
    /// Process spawned, waiting for the engine to come up
    Starting,
    /// Engine is busy producing output
    Working,
    /// Engine is waiting for input
    Ready,
    /// Process died or printed an error marker
    Error,
    /// Process exited cleanly
    Completed,
}

/// What the classifier concluded from a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Detected {
    Ready,
    Busy,
}

impl From<Detected> for SessionStatus {
    fn from(value: Detected) -> Self {
        match value {
            Detected::Ready => SessionStatus::Ready,
            Detected::Busy => SessionStatus::Working,
        }
    }
}

/// A classifier transition. `engine: None` means the session is back at a plain shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub engine: Option<EngineKind>,
    pub status: Detected,
}

impl Detection {
    pub fn new(engine: Option<EngineKind>, status: Detected) -> Self {
        Self { engine, status }
    }
}

/// A session status change as published to the outside world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub engine: Option<EngineKind>,
    pub status: SessionStatus,
}

impl From<Detection> for StateChange {
    fn from(value: Detection) -> Self {
        Self {
            engine: value.engine,
            status: value.status.into(),
        }
    }
}
