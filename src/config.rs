use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{ClassifierSettings, EngineKind};

/// How an engine's process is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Interactive shell in a pseudo-terminal, engine command typed into it
    Pty,
    /// Engine spawned directly with piped stdin/stdout/stderr
    Pipe,
}

/// How to start one engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLaunch {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_mode")]
    pub mode: LaunchMode,
}

fn default_mode() -> LaunchMode {
    LaunchMode::Pty
}

impl EngineLaunch {
    fn pty(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            mode: LaunchMode::Pty,
        }
    }

    /// The line typed into a shell to start the engine
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Per-engine launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Engines {
    pub claude: EngineLaunch,
    pub gemini: EngineLaunch,
    pub codex: EngineLaunch,
}

impl Default for Engines {
    fn default() -> Self {
        Self {
            claude: EngineLaunch::pty("claude"),
            gemini: EngineLaunch::pty("gemini"),
            codex: EngineLaunch::pty("codex"),
        }
    }
}

impl Engines {
    pub fn get(&self, kind: EngineKind) -> &EngineLaunch {
        match kind {
            EngineKind::Claude => &self.claude,
            EngineKind::Gemini => &self.gemini,
            EngineKind::Codex => &self.codex,
        }
    }
}

/// Tunables consumed by the supervisor, caches and classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scrollback bytes retained per session
    pub max_buffer_bytes: usize,
    /// Sessions with retained scrollback
    pub max_buffered_sessions: usize,
    pub buffer_sweep_interval_ms: u64,
    /// Scrollback untouched for this many sweep intervals is dropped
    pub buffer_idle_sweeps: u32,
    /// Live processes across all sessions
    pub max_processes: usize,
    pub process_idle_timeout_ms: u64,
    pub process_sweep_interval_ms: u64,
    pub debounce_ms: u64,
    pub implicit_ready_ms: u64,
    pub startup_fallback_ms: u64,
    /// Attempts to deliver a command, restarting dead processes in between
    pub restart_attempts: u32,
    pub retry_delay_ms: u64,
    pub detection_order: Vec<EngineKind>,
    /// Shell used for PTY sessions; defaults to $SHELL
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub engines: Engines,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 1024 * 1024,
            max_buffered_sessions: 32,
            buffer_sweep_interval_ms: 60_000,
            buffer_idle_sweeps: 30,
            max_processes: 16,
            process_idle_timeout_ms: 30 * 60_000,
            process_sweep_interval_ms: 60_000,
            debounce_ms: 100,
            implicit_ready_ms: 500,
            startup_fallback_ms: 3_000,
            restart_attempts: 3,
            retry_delay_ms: 500,
            detection_order: ClassifierSettings::default().detection_order,
            shell: None,
            cols: 120,
            rows: 40,
            engines: Engines::default(),
        }
    }
}

impl Config {
    /// Load from `$AGENT_DECK_CONFIG` or the user config dir, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("AGENT_DECK_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|d| d.join("agent-deck").join("config.json")));

        match path {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default().normalized()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        Ok(config.normalized())
    }

    /// Clamp values that would disable a bound or make an engine unreachable
    pub fn normalized(mut self) -> Self {
        self.max_buffer_bytes = self.max_buffer_bytes.max(1);
        self.max_buffered_sessions = self.max_buffered_sessions.max(1);
        self.max_processes = self.max_processes.max(1);
        self.restart_attempts = self.restart_attempts.max(1);
        self.buffer_idle_sweeps = self.buffer_idle_sweeps.max(1);
        self.buffer_sweep_interval_ms = self.buffer_sweep_interval_ms.max(1);
        self.process_sweep_interval_ms = self.process_sweep_interval_ms.max(1);

        let mut order = Vec::with_capacity(EngineKind::ALL.len());
        for kind in &self.detection_order {
            if !order.contains(kind) {
                order.push(*kind);
            }
        }
        if order.is_empty() {
            order = ClassifierSettings::default().detection_order;
        }
        for kind in EngineKind::ALL {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        self.detection_order = order;
        self
    }

    pub fn classifier_settings(&self) -> ClassifierSettings {
        ClassifierSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            implicit_ready: Duration::from_millis(self.implicit_ready_ms),
            detection_order: self.detection_order.clone(),
        }
    }

    pub fn startup_fallback(&self) -> Duration {
        Duration::from_millis(self.startup_fallback_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn buffer_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_sweep_interval_ms)
    }

    pub fn process_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.process_sweep_interval_ms)
    }

    pub fn process_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.process_idle_timeout_ms)
    }

    /// Where logs and per-session shell history live
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_default()
            .join("agent-deck")
    }
}
