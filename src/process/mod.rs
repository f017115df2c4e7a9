mod spawn;
mod table;

#[cfg(test)]
pub(crate) mod fake;

pub use spawn::SystemSpawner;
pub use table::{ManagedProcess, ProcessTable};

use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::config::{EngineLaunch, LaunchMode};
use crate::engine::EngineKind;

/// Something a child process produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// Standard output, or the merged stream of a pseudo-terminal
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Final message; `None` when the exit code is unknown (killed by a signal)
    Exited(Option<i32>),
}

/// Everything a spawner needs to start a session's process
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub session_id: String,
    pub engine: Option<EngineKind>,
    /// Absent for a plain shell session
    pub launch: Option<EngineLaunch>,
    pub mode: LaunchMode,
    pub working_dir: PathBuf,
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub history_file: Option<PathBuf>,
}

/// Control surface of a live child process
pub trait ProcessHandle: Send {
    /// Queue bytes for the process input. Never blocks on the process.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Best-effort and idempotent
    fn kill(&mut self);

    /// Liveness flag; cleared once the exit is observed or a kill is issued
    fn is_alive(&self) -> bool;

    fn pid(&self) -> Option<u32>;
}

/// A freshly spawned process and the stream of its output
pub struct SpawnedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub output: mpsc::UnboundedReceiver<ProcessOutput>,
}

/// Starts processes for sessions
pub trait Spawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess>;
}
