use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ProcessHandle, ProcessOutput, SpawnRequest, SpawnedProcess, Spawner};
use crate::config::LaunchMode;

/// How long the exit notice waits for trailing output to be read
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Spawns real OS processes, either inside a pseudo-terminal or on pipes
#[derive(Debug, Default)]
pub struct SystemSpawner;

impl SystemSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl Spawner for SystemSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        debug!(
            session_id = %request.session_id,
            engine = ?request.engine,
            mode = ?request.mode,
            dir = %request.working_dir.display(),
            "Spawning process"
        );
        match (request.mode, &request.launch) {
            (LaunchMode::Pipe, Some(_)) => spawn_piped(request),
            _ => spawn_pty(request),
        }
    }
}

struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl ProcessHandle for PtyProcess {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(anyhow!("process has exited"));
        }
        self.input
            .send(bytes.to_vec())
            .map_err(|_| anyhow!("pty writer closed"))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to resize pty")
    }

    fn kill(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.killer.kill() {
                debug!(pid = ?self.pid, "kill after exit: {}", e);
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Interactive shell in a pseudo-terminal with the engine command typed into it
fn spawn_pty(request: &SpawnRequest) -> Result<SpawnedProcess> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("Failed to open pty")?;

    let shell = request
        .shell
        .clone()
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/sh".to_string());

    let mut cmd = CommandBuilder::new(&shell);
    cmd.arg("-i");
    cmd.cwd(&request.working_dir);
    cmd.env("TERM", "xterm-256color");
    cmd.env("AGENT_DECK_SESSION", &request.session_id);
    if let Some(history_file) = &request.history_file {
        if let Some(dir) = history_file.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), "Failed to create history dir: {}", e);
            }
        }
        cmd.env("HISTFILE", history_file);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("Failed to spawn {}", shell))?;
    // Only the child keeps the slave side open, so EOF follows its exit
    drop(pair.slave);

    let mut reader = pair.master.try_clone_reader().context("Failed to clone pty reader")?;
    let mut writer = pair.master.take_writer().context("Failed to take pty writer")?;
    let killer = child.clone_killer();
    let pid = child.process_id();
    let alive = Arc::new(AtomicBool::new(true));

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (drained_tx, drained_rx) = std::sync::mpsc::channel::<()>();

    let tx = output_tx.clone();
    std::thread::Builder::new()
        .name(format!("pty-read-{}", request.session_id))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(ProcessOutput::Stdout(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = drained_tx.send(());
        })
        .context("Failed to start pty reader")?;

    std::thread::Builder::new()
        .name(format!("pty-write-{}", request.session_id))
        .spawn(move || {
            while let Some(bytes) = input_rx.blocking_recv() {
                if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
                    break;
                }
            }
        })
        .context("Failed to start pty writer")?;

    let exit_alive = alive.clone();
    let session_id = request.session_id.clone();
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", request.session_id))
        .spawn(move || {
            let code = child.wait().ok().map(|status| status.exit_code() as i32);
            exit_alive.store(false, Ordering::SeqCst);
            let _ = drained_rx.recv_timeout(DRAIN_GRACE);
            info!(session_id = %session_id, exit_code = ?code, "pty process exited");
            let _ = output_tx.send(ProcessOutput::Exited(code));
        })
        .context("Failed to start pty waiter")?;

    if let Some(launch) = &request.launch {
        let _ = input_tx.send(format!("{}\r", launch.command_line()).into_bytes());
    }

    info!(session_id = %request.session_id, ?pid, shell = %shell, "Spawned pty session");

    Ok(SpawnedProcess {
        handle: Box::new(PtyProcess {
            master: pair.master,
            input: input_tx,
            killer,
            alive,
            pid,
        }),
        output: output_rx,
    })
}

struct PipedProcess {
    input: mpsc::UnboundedSender<Vec<u8>>,
    kill: Option<oneshot::Sender<()>>,
    alive: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl ProcessHandle for PipedProcess {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(anyhow!("process has exited"));
        }
        self.input
            .send(bytes.to_vec())
            .map_err(|_| anyhow!("stdin closed"))
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    fn kill(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Engine started directly with its own stdout and stderr
fn spawn_piped(request: &SpawnRequest) -> Result<SpawnedProcess> {
    let launch = request
        .launch
        .as_ref()
        .context("Piped launch requires an engine command")?;

    let mut child = Command::new(&launch.program)
        .args(&launch.args)
        .current_dir(&request.working_dir)
        .env("AGENT_DECK_SESSION", &request.session_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", launch.program))?;

    let pid = child.id();
    let mut stdin = child.stdin.take().context("stdin not captured")?;
    let stdout = child.stdout.take().context("stdout not captured")?;
    let stderr = child.stderr.take().context("stderr not captured")?;

    let alive = Arc::new(AtomicBool::new(true));
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        while let Some(bytes) = input_rx.recv().await {
            if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
                break;
            }
        }
    });

    let readers = [
        tokio::spawn(forward(stdout, output_tx.clone(), ProcessOutput::Stdout)),
        tokio::spawn(forward(stderr, output_tx.clone(), ProcessOutput::Stderr)),
    ];

    let exit_alive = alive.clone();
    let session_id = request.session_id.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        exit_alive.store(false, Ordering::SeqCst);
        let _ = tokio::time::timeout(DRAIN_GRACE, async {
            for reader in readers {
                let _ = reader.await;
            }
        })
        .await;

        let code = status.ok().and_then(|s| s.code());
        info!(session_id = %session_id, exit_code = ?code, "piped process exited");
        let _ = output_tx.send(ProcessOutput::Exited(code));
    });

    info!(session_id = %request.session_id, ?pid, program = %launch.program, "Spawned piped session");

    Ok(SpawnedProcess {
        handle: Box::new(PipedProcess {
            input: input_tx,
            kill: Some(kill_tx),
            alive,
            pid,
        }),
        output: output_rx,
    })
}

async fn forward<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<ProcessOutput>,
    wrap: fn(Vec<u8>) -> ProcessOutput,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}
