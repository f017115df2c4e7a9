//! In-memory processes for tests.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{ProcessHandle, ProcessOutput, SpawnRequest, SpawnedProcess, Spawner};

/// Test-side view of a fake process
#[derive(Clone)]
pub(crate) struct FakeProcess {
    pub output: mpsc::UnboundedSender<ProcessOutput>,
    pub alive: Arc<AtomicBool>,
    pub killed: Arc<AtomicBool>,
    /// Input is broken while the process still looks alive
    pub input_broken: Arc<AtomicBool>,
    pub written: Arc<Mutex<Vec<u8>>>,
    pub request: SpawnRequest,
}

impl FakeProcess {
    pub fn stdout(&self, text: &str) {
        let _ = self.output.send(ProcessOutput::Stdout(text.as_bytes().to_vec()));
    }

    pub fn stderr(&self, text: &str) {
        let _ = self.output.send(ProcessOutput::Stderr(text.as_bytes().to_vec()));
    }

    pub fn exit(&self, code: Option<i32>) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.output.send(ProcessOutput::Exited(code));
    }

    /// Dies without reporting, as if the exit notice has not arrived yet
    pub fn die_silently(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn break_input(&self) {
        self.input_broken.store(true, Ordering::SeqCst);
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> Box<dyn ProcessHandle> {
        Box::new(FakeHandle {
            process: self.clone(),
        })
    }
}

pub(crate) fn fake_process(session_id: &str) -> (FakeProcess, mpsc::UnboundedReceiver<ProcessOutput>) {
    let (output, rx) = mpsc::unbounded_channel();
    let process = FakeProcess {
        output,
        alive: Arc::new(AtomicBool::new(true)),
        killed: Arc::new(AtomicBool::new(false)),
        input_broken: Arc::new(AtomicBool::new(false)),
        written: Arc::new(Mutex::new(Vec::new())),
        request: SpawnRequest {
            session_id: session_id.to_string(),
            engine: None,
            launch: None,
            mode: crate::config::LaunchMode::Pty,
            working_dir: std::env::temp_dir(),
            shell: None,
            cols: 80,
            rows: 24,
            history_file: None,
        },
    };
    (process, rx)
}

struct FakeHandle {
    process: FakeProcess,
}

impl ProcessHandle for FakeHandle {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(anyhow!("fake process is dead"));
        }
        if self.process.input_broken.load(Ordering::SeqCst) {
            return Err(anyhow!("fake process input closed"));
        }
        self.process.written.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    fn kill(&mut self) {
        if !self.process.killed.swap(true, Ordering::SeqCst) {
            self.process.exit(None);
        }
    }

    fn is_alive(&self) -> bool {
        self.process.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Hands out fake processes and records every spawn attempt
#[derive(Default)]
pub(crate) struct FakeSpawner {
    pub failing: AtomicBool,
    pub attempts: AtomicUsize,
    /// Spawns still to refuse before succeeding again
    failures_left: AtomicUsize,
    spawned: Mutex<Vec<FakeProcess>>,
}

impl FakeSpawner {
    pub fn process(&self, index: usize) -> FakeProcess {
        self.spawned.lock().unwrap()[index].clone()
    }

    pub fn last(&self) -> FakeProcess {
        self.spawned.lock().unwrap().last().cloned().unwrap()
    }

    pub fn spawned(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_times(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse_once = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse_once || self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("spawn refused"));
        }
        let (mut process, output) = fake_process(&request.session_id);
        process.request = request.clone();
        let handle = process.handle();
        self.spawned.lock().unwrap().push(process);
        Ok(SpawnedProcess { handle, output })
    }
}
