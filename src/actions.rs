use crossterm::event::KeyEvent;

use crate::engine::EngineKind;
use crate::supervisor::SupervisorEvent;

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// Output or a state change from a supervised session
    Supervisor(SupervisorEvent),
    /// An error occurred
    Error(String),
    /// Create a new session, optionally launching an engine in it
    CreateSession {
        name: String,
        engine: Option<EngineKind>,
    },
    /// Send a line of input to a session
    SendCommand { session_id: String, text: String },
    /// Restart a session's process
    RestartSession(String),
    /// Delete a session
    DeleteSession(String),
    /// Press Esc inside a session, interrupting the engine
    Interrupt(String),
    /// The terminal was resized
    Resize { cols: u16, rows: u16 },
}
