//! Owns one process per session, feeds its output to the classifier and the
//! event stream, and restarts sessions whose process has died.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::buffer::ScrollbackCache;
use crate::config::{Config, LaunchMode};
use crate::engine::{
    strip_ansi, Detected, Detection, EngineKind, PatternRegistry, SessionStatus, StateChange, StreamClassifier,
};
use crate::error::{SupervisorError, SupervisorResult};
use crate::process::{ManagedProcess, ProcessOutput, ProcessTable, SpawnRequest, Spawner};

/// Everything the supervisor reports, in per-session arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Output { session_id: String, chunk: Vec<u8> },
    StateChange { session_id: String, change: StateChange },
}

/// Snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    /// Engine the session was created for
    pub engine: Option<EngineKind>,
    pub working_dir: PathBuf,
    pub status: SessionStatus,
    /// Engine recognised in the output, if any
    pub detected_engine: Option<EngineKind>,
}

#[derive(Debug)]
enum PumpControl {
    SetEngine(EngineKind),
    Shutdown,
}

struct SessionSlot {
    session: Session,
    generation: u64,
    mode: LaunchMode,
    control: Option<mpsc::UnboundedSender<PumpControl>>,
}

impl SessionSlot {
    fn stop_pump(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(PumpControl::Shutdown);
        }
    }
}

struct Shared {
    config: Config,
    spawner: Arc<dyn Spawner>,
    processes: Arc<ProcessTable>,
    buffers: Arc<ScrollbackCache>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    next_generation: AtomicU64,
}

/// Multiplexes engine sessions. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        spawner: Arc<dyn Spawner>,
        processes: Arc<ProcessTable>,
        buffers: Arc<ScrollbackCache>,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            config,
            spawner,
            processes,
            buffers,
            sessions: Mutex::new(HashMap::new()),
            events,
            next_generation: AtomicU64::new(1),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    /// Start the idle sweeps of the scrollback cache and process table
    pub fn start_maintenance(&self) -> Vec<JoinHandle<()>> {
        let config = &self.shared.config;
        vec![
            self.shared
                .buffers
                .clone()
                .spawn_sweeper(config.buffer_sweep_interval(), config.buffer_idle_sweeps),
            self.shared
                .processes
                .clone()
                .spawn_sweeper(config.process_sweep_interval(), config.process_idle_timeout()),
        ]
    }

    pub async fn create_session(
        &self,
        session_id: &str,
        engine: Option<EngineKind>,
        working_dir: PathBuf,
    ) -> SupervisorResult<Session> {
        {
            let mut sessions = self.shared.sessions.lock().await;
            if let Some(previous) = sessions.get_mut(session_id) {
                if self.shared.processes.is_alive(session_id).await {
                    return Err(SupervisorError::SessionExists(session_id.to_string()));
                }
                // A session without a live process can be created again
                previous.stop_pump();
            }
            sessions.insert(
                session_id.to_string(),
                SessionSlot {
                    session: Session {
                        id: session_id.to_string(),
                        engine,
                        working_dir,
                        status: SessionStatus::Idle,
                        detected_engine: None,
                    },
                    generation: 0,
                    mode: LaunchMode::Pty,
                    control: None,
                },
            );
        }
        info!(session_id, ?engine, "Creating session");

        self.launch(session_id).await?;
        self.session(session_id)
            .await
            .ok_or_else(|| SupervisorError::UnknownSession(session_id.to_string()))
    }

    /// Deliver a line of input, restarting the session if its process is dead
    /// or refuses the write
    pub async fn send_command(&self, session_id: &str, text: &str) -> SupervisorResult<()> {
        let attempts = self.shared.config.restart_attempts;
        let mut write_failed = false;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.shared.config.retry_delay()).await;
            }

            let mode = self.mode(session_id).await?;
            if write_failed || !self.shared.processes.is_alive(session_id).await {
                warn!(session_id, attempt, write_failed, "Process unusable, restarting");
                write_failed = false;
                if let Err(e) = self.restart_session(session_id).await {
                    warn!(session_id, attempt, "Restart failed: {}", e);
                    continue;
                }
            }

            let terminator = match mode {
                LaunchMode::Pty => "\r",
                LaunchMode::Pipe => "\n",
            };
            let line = format!("{}{}", text, terminator);
            match self.shared.processes.write(session_id, line.as_bytes()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(session_id, attempt, "Command delivery failed: {}", e);
                    write_failed = true;
                }
            }
        }

        error!(session_id, attempts, "Giving up on command delivery");
        self.shared
            .force_status(session_id, None, SessionStatus::Error)
            .await;
        Err(SupervisorError::CommandDelivery {
            session_id: session_id.to_string(),
            attempts,
        })
    }

    /// Kill any running process, reset to idle and spawn afresh
    pub async fn restart_session(&self, session_id: &str) -> SupervisorResult<()> {
        self.stop(session_id).await?;
        info!(session_id, "Restarting session");
        self.launch(session_id).await
    }

    /// Raw bytes to the process, no terminator added
    pub async fn write(&self, session_id: &str, bytes: &[u8]) -> SupervisorResult<()> {
        self.shared.processes.write(session_id, bytes).await
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> SupervisorResult<()> {
        self.shared.processes.resize(session_id, cols, rows).await
    }

    /// Kill the session's process and stop classifying it. Returns whether a process was running.
    pub async fn kill(&self, session_id: &str) -> SupervisorResult<bool> {
        self.stop(session_id).await
    }

    /// Kill the process and forget the session and its scrollback
    pub async fn destroy_session(&self, session_id: &str) -> SupervisorResult<()> {
        self.stop(session_id).await?;
        self.shared.buffers.remove(session_id).await;
        self.shared.sessions.lock().await.remove(session_id);
        info!(
            session_id,
            buffered = self.shared.buffers.len().await,
            "Destroyed session"
        );
        Ok(())
    }

    /// Tell the session's classifier which engine is running
    pub async fn set_engine(&self, session_id: &str, engine: EngineKind) -> SupervisorResult<()> {
        let sessions = self.shared.sessions.lock().await;
        let slot = sessions
            .get(session_id)
            .ok_or_else(|| SupervisorError::UnknownSession(session_id.to_string()))?;
        slot.control
            .as_ref()
            .and_then(|control| control.send(PumpControl::SetEngine(engine)).ok())
            .ok_or_else(|| SupervisorError::ProcessGone(session_id.to_string()))
    }

    /// Scrollback for reattaching a view
    pub async fn get_buffer(&self, session_id: &str) -> Option<String> {
        self.shared.buffers.read(session_id).await
    }

    pub async fn session(&self, session_id: &str) -> Option<Session> {
        self.shared
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|slot| slot.session.clone())
    }

    pub async fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .shared
            .sessions
            .lock()
            .await
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    async fn mode(&self, session_id: &str) -> SupervisorResult<LaunchMode> {
        self.shared
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|slot| slot.mode)
            .ok_or_else(|| SupervisorError::UnknownSession(session_id.to_string()))
    }

    /// Stop the pump, kill the process and reset the session to idle
    async fn stop(&self, session_id: &str) -> SupervisorResult<bool> {
        {
            let mut sessions = self.shared.sessions.lock().await;
            let slot = sessions
                .get_mut(session_id)
                .ok_or_else(|| SupervisorError::UnknownSession(session_id.to_string()))?;
            slot.stop_pump();
            // Generations start at 1; nothing the old pump publishes matches from here on
            slot.generation = 0;
        }
        let killed = self.shared.processes.remove(session_id).await;
        self.shared
            .force(
                session_id,
                None,
                StateChange {
                    engine: None,
                    status: SessionStatus::Idle,
                },
            )
            .await;
        Ok(killed)
    }

    async fn launch(&self, session_id: &str) -> SupervisorResult<()> {
        let (engine, working_dir) = {
            let sessions = self.shared.sessions.lock().await;
            let slot = sessions
                .get(session_id)
                .ok_or_else(|| SupervisorError::UnknownSession(session_id.to_string()))?;
            (slot.session.engine, slot.session.working_dir.clone())
        };

        let request = self.shared.spawn_request(session_id, engine, working_dir.clone());
        let spawned = match self.shared.spawner.spawn(&request) {
            Ok(spawned) => spawned,
            Err(source) => {
                error!(session_id, "Spawn failed: {:#}", source);
                self.shared
                    .force_status(session_id, None, SessionStatus::Error)
                    .await;
                return Err(SupervisorError::Spawn {
                    session_id: session_id.to_string(),
                    source,
                });
            }
        };

        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        {
            let mut sessions = self.shared.sessions.lock().await;
            let Some(slot) = sessions.get_mut(session_id) else {
                let mut handle = spawned.handle;
                handle.kill();
                return Err(SupervisorError::UnknownSession(session_id.to_string()));
            };
            slot.stop_pump();
            slot.generation = generation;
            slot.mode = request.mode;
            slot.control = Some(control_tx);
        }

        let evicted = self
            .shared
            .processes
            .insert(ManagedProcess::new(session_id, generation, working_dir, spawned.handle))
            .await;
        for id in &evicted {
            info!(session_id = %id, "Evicted to admit {}", session_id);
        }
        info!(
            session_id,
            generation,
            live = self.shared.processes.len().await,
            "Session launched"
        );

        self.shared
            .force(
                session_id,
                Some(generation),
                StateChange {
                    engine: None,
                    status: SessionStatus::Starting,
                },
            )
            .await;

        let pump = Pump::new(self.shared.clone(), session_id, generation, engine);
        tokio::spawn(pump.run(spawned.output, control_rx));
        Ok(())
    }
}

impl Shared {
    fn spawn_request(&self, session_id: &str, engine: Option<EngineKind>, working_dir: PathBuf) -> SpawnRequest {
        let launch = engine.map(|kind| self.config.engines.get(kind).clone());
        let mode = launch.as_ref().map_or(LaunchMode::Pty, |l| l.mode);
        SpawnRequest {
            session_id: session_id.to_string(),
            engine,
            launch,
            mode,
            working_dir,
            shell: self.config.shell.clone(),
            cols: self.config.cols,
            rows: self.config.rows,
            history_file: Some(
                Config::data_dir()
                    .join("history")
                    .join(format!("{}.hist", session_id)),
            ),
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    /// Publish a classifier transition for the current generation
    async fn apply(&self, session_id: &str, generation: u64, detection: Detection) {
        self.update(session_id, Some(generation), false, |_| detection.into())
            .await;
    }

    /// Forced transition that skips the classifier; repeated values are not re-published
    async fn force(&self, session_id: &str, generation: Option<u64>, change: StateChange) -> bool {
        self.update(session_id, generation, true, |_| change).await
    }

    /// Forced status change that keeps the detected engine
    async fn force_status(&self, session_id: &str, generation: Option<u64>, status: SessionStatus) -> bool {
        self.update(session_id, generation, true, |session| StateChange {
            engine: session.detected_engine,
            status,
        })
        .await
    }

    async fn update<F>(&self, session_id: &str, generation: Option<u64>, dedupe: bool, change: F) -> bool
    where
        F: FnOnce(&Session) -> StateChange,
    {
        let mut sessions = self.sessions.lock().await;
        let Some(slot) = sessions.get_mut(session_id) else {
            return false;
        };
        if generation.is_some_and(|g| g != slot.generation) {
            return false;
        }

        let change = change(&slot.session);
        let session = &mut slot.session;
        if dedupe && session.status == change.status && session.detected_engine == change.engine {
            return false;
        }
        session.status = change.status;
        session.detected_engine = change.engine;
        debug!(session_id, status = ?change.status, engine = ?change.engine, "Session state changed");
        // Sent under the lock so concurrent updates publish in the order they were applied
        self.emit(SupervisorEvent::StateChange {
            session_id: session_id.to_string(),
            change,
        });
        true
    }

    async fn status(&self, session_id: &str, generation: u64) -> Option<SessionStatus> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.session.status)
    }
}

/// Drives one process: the only place its classifier state is touched
struct Pump {
    shared: Arc<Shared>,
    session_id: String,
    generation: u64,
    configured: Option<EngineKind>,
    classifier: StreamClassifier,
    decoder: Utf8Carry,
}

impl Pump {
    fn new(shared: Arc<Shared>, session_id: &str, generation: u64, configured: Option<EngineKind>) -> Self {
        let mut classifier = StreamClassifier::new(shared.config.classifier_settings());
        classifier.register(session_id);
        Self {
            shared,
            session_id: session_id.to_string(),
            generation,
            configured,
            classifier,
            decoder: Utf8Carry::default(),
        }
    }

    async fn run(
        mut self,
        mut output: mpsc::UnboundedReceiver<ProcessOutput>,
        mut control: mpsc::UnboundedReceiver<PumpControl>,
    ) {
        let tick = (self.shared.config.classifier_settings().implicit_ready / 2).max(Duration::from_millis(10));
        let fallback = tokio::time::sleep(self.shared.config.startup_fallback());
        tokio::pin!(fallback);
        let mut fallback_armed = true;
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                command = control.recv() => match command {
                    Some(PumpControl::SetEngine(engine)) => {
                        if let Some(detection) = self.classifier.set_engine(&self.session_id, engine) {
                            self.publish(detection).await;
                        }
                        fallback_armed = false;
                    }
                    Some(PumpControl::Shutdown) | None => break,
                },
                message = output.recv() => match message {
                    Some(ProcessOutput::Stdout(bytes)) => {
                        if self.on_output(bytes, false).await {
                            fallback_armed = false;
                        }
                    }
                    Some(ProcessOutput::Stderr(bytes)) => {
                        if self.on_output(bytes, true).await {
                            fallback_armed = false;
                        }
                    }
                    Some(ProcessOutput::Exited(code)) => {
                        self.on_exit(code).await;
                        break;
                    }
                    None => {
                        self.on_exit(None).await;
                        break;
                    }
                },
                _ = &mut fallback, if fallback_armed => {
                    fallback_armed = false;
                    self.startup_fallback().await;
                }
                _ = ticker.tick() => {
                    if let Some(detection) = self.classifier.classify(&self.session_id, "") {
                        self.publish(detection).await;
                    }
                }
            }
        }

        self.classifier.forget(&self.session_id);
        debug!(session_id = %self.session_id, generation = self.generation, "Output pump stopped");
    }

    async fn publish(&self, detection: Detection) {
        self.shared
            .apply(&self.session_id, self.generation, detection)
            .await;
    }

    /// Returns whether the chunk produced a state change
    async fn on_output(&mut self, bytes: Vec<u8>, from_stderr: bool) -> bool {
        let session_id = self.session_id.as_str();
        self.shared.buffers.append(session_id, &bytes).await;
        self.shared.processes.touch(session_id).await;
        let text = self.decoder.decode(&bytes);
        self.shared.emit(SupervisorEvent::Output {
            session_id: session_id.to_string(),
            chunk: bytes,
        });

        if from_stderr {
            let engine = self.classifier.engine(session_id).or(self.configured);
            if PatternRegistry::builtin().is_error(engine, &strip_ansi(&text)) {
                warn!(session_id, "Error marker on stderr");
                return self
                    .shared
                    .force_status(session_id, Some(self.generation), SessionStatus::Error)
                    .await;
            }
        }

        match self.classifier.classify(session_id, &text) {
            Some(detection) => {
                self.publish(detection).await;
                true
            }
            None => false,
        }
    }

    async fn on_exit(&self, code: Option<i32>) {
        let session_id = self.session_id.as_str();
        let generation = Some(self.generation);
        if self.shared.processes.remove_generation(session_id, self.generation).await {
            let status = if code == Some(0) {
                info!(session_id, "Process completed");
                SessionStatus::Completed
            } else {
                warn!(session_id, exit_code = ?code, "Process died");
                SessionStatus::Error
            };
            self.shared.force_status(session_id, generation, status).await;
        } else {
            // Killed by the supervisor itself: replaced, evicted or swept
            debug!(session_id, generation = self.generation, "Superseded process exited");
            self.shared
                .force(
                    session_id,
                    generation,
                    StateChange {
                        engine: None,
                        status: SessionStatus::Idle,
                    },
                )
                .await;
        }
    }

    /// Startup banner never matched: assume the engine is up and waiting
    async fn startup_fallback(&mut self) {
        let status = self.shared.status(&self.session_id, self.generation).await;
        if !matches!(status, Some(SessionStatus::Idle | SessionStatus::Starting)) {
            return;
        }
        info!(session_id = %self.session_id, configured = ?self.configured, "No startup signature seen, assuming ready");
        let detection = self
            .configured
            .and_then(|engine| self.classifier.set_engine(&self.session_id, engine))
            .unwrap_or(Detection::new(None, Detected::Ready));
        self.publish(detection).await;
    }
}

/// Decodes UTF-8 across chunk boundaries, holding back an incomplete trailing sequence
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.pending.len());
        let mut rest = self.pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeSpawner;
    use tokio::time::{timeout, Instant};

    struct Harness {
        supervisor: Supervisor,
        events: mpsc::UnboundedReceiver<SupervisorEvent>,
        spawner: Arc<FakeSpawner>,
        processes: Arc<ProcessTable>,
    }

    fn harness(config: Config) -> Harness {
        let spawner = Arc::new(FakeSpawner::default());
        let processes = Arc::new(ProcessTable::new(config.max_processes));
        let buffers = Arc::new(ScrollbackCache::new(config.max_buffer_bytes, config.max_buffered_sessions));
        let (supervisor, events) = Supervisor::new(config, spawner.clone(), processes.clone(), buffers);
        Harness {
            supervisor,
            events,
            spawner,
            processes,
        }
    }

    fn test_config() -> Config {
        Config {
            retry_delay_ms: 10,
            ..Config::default()
        }
    }

    impl Harness {
        async fn next_change(&mut self) -> (String, StateChange) {
            loop {
                let event = timeout(Duration::from_secs(30), self.events.recv())
                    .await
                    .expect("timed out waiting for a state change")
                    .expect("event channel closed");
                if let SupervisorEvent::StateChange { session_id, change } = event {
                    return (session_id, change);
                }
            }
        }

        async fn expect_change(&mut self, engine: Option<EngineKind>, status: SessionStatus) {
            let (_, change) = self.next_change().await;
            assert_eq!(change, StateChange { engine, status });
        }

        async fn create(&mut self, id: &str, engine: Option<EngineKind>) {
            self.supervisor
                .create_session(id, engine, std::env::temp_dir())
                .await
                .unwrap();
            self.expect_change(None, SessionStatus::Starting).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_session_is_rejected() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        let err = h
            .supervisor
            .create_session("s1", None, std::env::temp_dir())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::SessionExists(_)));
        assert_eq!(h.spawner.spawned(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_flows_to_sink_buffer_and_classifier() {
        let mut h = harness(test_config());
        h.create("s1", Some(EngineKind::Claude)).await;
        let process = h.spawner.last();
        assert_eq!(process.request.engine, Some(EngineKind::Claude));

        process.stdout("✻ Welcome to Claude Code!\r\n");
        let output = h.events.recv().await.unwrap();
        assert!(matches!(output, SupervisorEvent::Output { ref session_id, .. } if session_id == "s1"));
        h.expect_change(Some(EngineKind::Claude), SessionStatus::Ready).await;

        process.stdout("✻ Thinking… (esc to interrupt)");
        h.expect_change(Some(EngineKind::Claude), SessionStatus::Working).await;
        // Silence while busy falls back to ready on the pump's tick
        h.expect_change(Some(EngineKind::Claude), SessionStatus::Ready).await;

        let buffer = h.supervisor.get_buffer("s1").await.unwrap();
        assert!(buffer.contains("Welcome to Claude Code"));
        assert!(buffer.ends_with("(esc to interrupt)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shell_prompt_overrides_busy_session() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        let process = h.spawner.last();

        process.stdout(">_ OpenAI Codex (v0.42)");
        h.expect_change(Some(EngineKind::Codex), SessionStatus::Ready).await;
        process.stdout("• Working (2s • esc to interrupt)");
        h.expect_change(Some(EngineKind::Codex), SessionStatus::Working).await;

        process.stdout("• Working (3s • esc to interrupt)\r\nelle@box:~/repo$ ");
        h.expect_change(None, SessionStatus::Ready).await;
        let session = h.supervisor.session("s1").await.unwrap();
        assert_eq!(session.detected_engine, None);
        assert_eq!(session.status, SessionStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stderr_error_marker_forces_error() {
        let mut h = harness(test_config());
        h.create("s1", Some(EngineKind::Codex)).await;
        h.spawner.last().stderr("stream error: connection reset\n");
        h.expect_change(None, SessionStatus::Error).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_codes() {
        let mut h = harness(test_config());
        h.create("ok", None).await;
        h.spawner.last().exit(Some(0));
        h.expect_change(None, SessionStatus::Completed).await;

        h.create("bad", None).await;
        h.spawner.last().exit(Some(2));
        h.expect_change(None, SessionStatus::Error).await;
        assert_eq!(h.processes.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_fallback_seeds_configured_engine() {
        let mut h = harness(test_config());
        let started = Instant::now();
        h.create("s1", Some(EngineKind::Gemini)).await;

        h.expect_change(Some(EngineKind::Gemini), SessionStatus::Ready).await;
        assert!(started.elapsed() >= Duration::from_secs(3));

        // The seeded engine's busy markers are now tracked
        h.spawner.last().stdout("⠙ Reading files (esc to cancel, 1s)");
        h.expect_change(Some(EngineKind::Gemini), SessionStatus::Working).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_writes_line() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        h.supervisor.send_command("s1", "git status").await.unwrap();
        assert_eq!(h.spawner.last().written(), "git status\r");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_restarts_dead_process() {
        let mut h = harness(test_config());
        h.create("s1", Some(EngineKind::Claude)).await;
        h.spawner.last().die_silently();

        h.supervisor.send_command("s1", "fix the bug").await.unwrap();

        assert_eq!(h.spawner.spawned(), 2);
        assert_eq!(h.spawner.process(0).written(), "");
        assert_eq!(h.spawner.process(1).written(), "fix the bug\r");
        h.expect_change(None, SessionStatus::Idle).await;
        h.expect_change(None, SessionStatus::Starting).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_gives_up_after_budget() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        h.spawner.fail(true);
        h.spawner.last().die_silently();

        let err = h.supervisor.send_command("s1", "echo hi").await.unwrap_err();
        assert!(matches!(err, SupervisorError::CommandDelivery { attempts: 3, .. }));
        // One initial spawn plus one restart per attempt
        assert_eq!(h.spawner.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(h.supervisor.session("s1").await.unwrap().status, SessionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_restarts_on_refused_write() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        let broken = h.spawner.last();
        broken.break_input();

        h.supervisor.send_command("s1", "ls").await.unwrap();

        assert_eq!(h.spawner.spawned(), 2);
        assert!(broken.was_killed());
        assert_eq!(broken.written(), "");
        assert_eq!(h.spawner.process(1).written(), "ls\r");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_survives_failed_restart() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        h.spawner.last().die_silently();
        h.spawner.fail_times(1);

        h.supervisor.send_command("s1", "echo hi").await.unwrap();

        // Initial spawn, one refused restart, one successful restart
        assert_eq!(h.spawner.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(h.spawner.spawned(), 2);
        assert_eq!(h.spawner.process(0).written(), "");
        assert_eq!(h.spawner.process(1).written(), "echo hi\r");
        assert_eq!(h.supervisor.session("s1").await.unwrap().status, SessionStatus::Starting);
    }

    fn last_state_change(events: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> Option<StateChange> {
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if let SupervisorEvent::StateChange { change, .. } = event {
                last = Some(change);
            }
        }
        last
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_discards_queued_output() {
        let mut h = harness(test_config());
        h.create("s1", Some(EngineKind::Claude)).await;
        h.spawner.last().stdout("✻ Welcome to Claude Code!");
        h.supervisor.kill("s1").await.unwrap();

        // Give the old pump every chance to run
        tokio::time::sleep(Duration::from_secs(5)).await;

        let session = h.supervisor.session("s1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.detected_engine, None);
        let idle = StateChange {
            engine: None,
            status: SessionStatus::Idle,
        };
        assert_eq!(last_state_change(&mut h.events), Some(idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_discards_queued_output() {
        let mut h = harness(test_config());
        h.create("s1", Some(EngineKind::Claude)).await;
        h.spawner.last().stdout("✻ Welcome to Claude Code!");
        h.supervisor.restart_session("s1").await.unwrap();

        // Shorter than the startup fallback of the new process
        tokio::time::sleep(Duration::from_secs(1)).await;

        let session = h.supervisor.session("s1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Starting);
        assert_eq!(session.detected_engine, None);
        let starting = StateChange {
            engine: None,
            status: SessionStatus::Starting,
        };
        assert_eq!(last_state_change(&mut h.events), Some(starting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_without_process_can_be_created_again() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        h.supervisor.kill("s1").await.unwrap();
        let session = h
            .supervisor
            .create_session("s1", Some(EngineKind::Codex), std::env::temp_dir())
            .await
            .unwrap();
        assert_eq!(session.engine, Some(EngineKind::Codex));
        assert_eq!(session.status, SessionStatus::Starting);
        assert_eq!(h.spawner.spawned(), 2);

        h.spawner.fail(true);
        assert!(h
            .supervisor
            .create_session("s2", None, std::env::temp_dir())
            .await
            .is_err());
        h.spawner.fail(false);
        h.supervisor
            .create_session("s2", None, std::env::temp_dir())
            .await
            .unwrap();
        assert_eq!(h.supervisor.sessions().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_is_idempotent_and_silent() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        let process = h.spawner.last();

        assert!(h.supervisor.kill("s1").await.unwrap());
        assert!(process.was_killed());
        h.expect_change(None, SessionStatus::Idle).await;
        assert!(!h.supervisor.kill("s1").await.unwrap());
        assert!(matches!(
            h.supervisor.write("s1", b"x").await,
            Err(SupervisorError::ProcessGone(_))
        ));
        assert!(matches!(
            h.supervisor.kill("nope").await,
            Err(SupervisorError::UnknownSession(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_is_silent() {
        let mut h = harness(Config {
            max_processes: 2,
            ..test_config()
        });
        h.create("a", None).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        h.create("b", None).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        h.supervisor
            .create_session("c", None, std::env::temp_dir())
            .await
            .unwrap();

        assert!(h.spawner.process(0).was_killed());
        assert_eq!(h.processes.len().await, 2);
        let mut changes = vec![h.next_change().await, h.next_change().await];
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(changes[0].0, "a");
        assert_eq!(changes[0].1.status, SessionStatus::Idle);
        assert_eq!(changes[1].0, "c");
        assert_eq!(changes[1].1.status, SessionStatus::Starting);
        assert_eq!(h.supervisor.session("b").await.unwrap().status, SessionStatus::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_drops_buffer() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        h.spawner.last().stdout("hello");
        h.events.recv().await.unwrap();

        h.supervisor.destroy_session("s1").await.unwrap();
        assert!(h.supervisor.get_buffer("s1").await.is_none());
        assert!(h.supervisor.session("s1").await.is_none());
        assert!(h.supervisor.sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_marks_error() {
        let mut h = harness(test_config());
        h.spawner.fail(true);
        let err = h
            .supervisor
            .create_session("s1", None, std::env::temp_dir())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        h.expect_change(None, SessionStatus::Error).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_needs_live_process() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        h.supervisor.resize("s1", 100, 30).await.unwrap();
        h.supervisor.kill("s1").await.unwrap();
        assert!(matches!(
            h.supervisor.resize("s1", 100, 30).await,
            Err(SupervisorError::ProcessGone(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_engine_reaches_classifier() {
        let mut h = harness(test_config());
        h.create("s1", None).await;
        h.supervisor.set_engine("s1", EngineKind::Codex).await.unwrap();
        h.expect_change(Some(EngineKind::Codex), SessionStatus::Ready).await;
    }

    #[test]
    fn test_utf8_carry_joins_split_characters() {
        let mut decoder = Utf8Carry::default();
        let bytes = "✻ ok".as_bytes();
        assert_eq!(decoder.decode(&bytes[..2]), "");
        assert_eq!(decoder.decode(&bytes[2..]), "✻ ok");
        assert_eq!(decoder.decode(&[0xff, b'a']), "\u{fffd}a");
    }

    #[test]
    fn test_utf8_carry_keeps_tail_after_invalid_byte() {
        let mut decoder = Utf8Carry::default();
        assert_eq!(decoder.decode(&[0xff, b'a', 0xe2, 0x9c]), "\u{fffd}a");
        assert_eq!(decoder.decode(&[0xbb, b'!']), "✻!");
    }

    #[test]
    fn test_detection_maps_to_session_status() {
        let change: StateChange = Detection::new(None, Detected::Busy).into();
        assert_eq!(change.status, SessionStatus::Working);
    }
}
