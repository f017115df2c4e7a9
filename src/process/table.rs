use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::ProcessHandle;
use crate::error::{SupervisorError, SupervisorResult};

/// A live OS process owned by one session
pub struct ManagedProcess {
    pub session_id: String,
    /// Distinguishes successive processes of the same session
    pub generation: u64,
    pub working_dir: PathBuf,
    pub spawned_at: Instant,
    pub last_activity: Instant,
    handle: Box<dyn ProcessHandle>,
}

impl ManagedProcess {
    pub fn new(
        session_id: &str,
        generation: u64,
        working_dir: PathBuf,
        handle: Box<dyn ProcessHandle>,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.to_string(),
            generation,
            working_dir,
            spawned_at: now,
            last_activity: now,
            handle,
        }
    }

    fn kill(mut self, reason: &str) {
        info!(
            session_id = %self.session_id,
            generation = self.generation,
            pid = ?self.handle.pid(),
            dir = %self.working_dir.display(),
            uptime_secs = self.spawned_at.elapsed().as_secs(),
            reason,
            "Killing process"
        );
        self.handle.kill();
    }
}

/// Live processes keyed by session, bounded in count
pub struct ProcessTable {
    entries: Mutex<HashMap<String, ManagedProcess>>,
    max_processes: usize,
}

impl ProcessTable {
    pub fn new(max_processes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_processes: max_processes.max(1),
        }
    }

    /// Admit a process, replacing the session's previous one and evicting the
    /// least recently active sessions beyond capacity. Returns the evicted session ids.
    pub async fn insert(&self, process: ManagedProcess) -> Vec<String> {
        let mut doomed = Vec::new();
        let mut evicted = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            if let Some(previous) = entries.remove(&process.session_id) {
                doomed.push((previous, "replaced"));
            }
            while entries.len() >= self.max_processes {
                let oldest = entries
                    .values()
                    .min_by_key(|p| p.last_activity)
                    .map(|p| p.session_id.clone());
                let Some(oldest) = oldest else { break };
                if let Some(victim) = entries.remove(&oldest) {
                    evicted.push(oldest);
                    doomed.push((victim, "evicted"));
                }
            }
            entries.insert(process.session_id.clone(), process);
        }

        for (process, reason) in doomed {
            process.kill(reason);
        }
        evicted
    }

    /// Kill and forget a session's process. Safe to repeat.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.entries.lock().await.remove(session_id);
        match removed {
            Some(process) => {
                process.kill("removed");
                true
            }
            None => false,
        }
    }

    /// Forget the process only if it is still the given generation
    pub async fn remove_generation(&self, session_id: &str, generation: u64) -> bool {
        let removed = {
            let mut entries = self.entries.lock().await;
            match entries.get(session_id) {
                Some(p) if p.generation == generation => entries.remove(session_id),
                _ => None,
            }
        };
        match removed {
            Some(process) => {
                process.kill("exited");
                true
            }
            None => false,
        }
    }

    pub async fn is_alive(&self, session_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(session_id)
            .is_some_and(|p| p.handle.is_alive())
    }

    pub async fn write(&self, session_id: &str, bytes: &[u8]) -> SupervisorResult<()> {
        let mut entries = self.entries.lock().await;
        let process = entries
            .get_mut(session_id)
            .ok_or_else(|| SupervisorError::ProcessGone(session_id.to_string()))?;
        process.handle.write(bytes).map_err(|e| {
            warn!(session_id, "Write failed: {:#}", e);
            SupervisorError::ProcessGone(session_id.to_string())
        })?;
        process.last_activity = Instant::now();
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> SupervisorResult<()> {
        let mut entries = self.entries.lock().await;
        let process = entries
            .get_mut(session_id)
            .ok_or_else(|| SupervisorError::ProcessGone(session_id.to_string()))?;
        process.handle.resize(cols, rows).map_err(|e| {
            warn!(session_id, "Resize failed: {:#}", e);
            SupervisorError::ProcessGone(session_id.to_string())
        })
    }

    /// Record activity, typically output from the process
    pub async fn touch(&self, session_id: &str) {
        if let Some(process) = self.entries.lock().await.get_mut(session_id) {
            process.last_activity = Instant::now();
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Kill processes idle for longer than `max_idle`
    pub async fn sweep(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let idle: Vec<ManagedProcess> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries
                .values()
                .filter(|p| now.saturating_duration_since(p.last_activity) > max_idle)
                .map(|p| p.session_id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let ids = idle.iter().map(|p| p.session_id.clone()).collect();
        for process in idle {
            process.kill("idle");
        }
        ids
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(max_idle).await;
            }
        })
    }
}
