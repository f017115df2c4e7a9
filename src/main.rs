use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyEventKind};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

mod actions;
mod app;
mod buffer;
mod config;
mod engine;
mod error;
mod process;
mod supervisor;

use actions::Action;
use app::App;
use buffer::ScrollbackCache;
use config::Config;
use process::{ProcessTable, SystemSpawner};
use supervisor::Supervisor;

/// Log to a file; the dashboard owns the terminal
fn init_logging() -> Result<()> {
    let dir = Config::data_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join("agent-deck.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = Config::load()?;
    tracing::info!(?config, "Starting agent-deck");

    let processes = Arc::new(ProcessTable::new(config.max_processes));
    let buffers = Arc::new(ScrollbackCache::new(
        config.max_buffer_bytes,
        config.max_buffered_sessions,
    ));
    let (supervisor, mut events) = Supervisor::new(
        config,
        Arc::new(SystemSpawner::new()),
        processes,
        buffers,
    );
    let maintenance = supervisor.start_maintenance();

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    // Initialize terminal
    let mut terminal = ratatui::init();

    // Spawn input handler
    let input_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            if event::poll(Duration::from_millis(100)).unwrap_or(false) {
                match event::read() {
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                        let _ = input_tx.send(Action::KeyPress(key));
                    }
                    Ok(Event::Resize(cols, rows)) => {
                        let _ = input_tx.send(Action::Resize { cols, rows });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = input_tx.send(Action::Error(format!("Input: {}", e)));
                    }
                }
            }
        }
    });

    // Forward supervisor events
    let event_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event_tx.send(Action::Supervisor(event)).is_err() {
                break;
            }
        }
    });

    let working_dir = std::env::current_dir().context("Failed to read current directory")?;

    // Create app state
    let mut app = App::new();

    // Main event loop
    let result = loop {
        // Process any pending actions from the app
        let pending = app.take_pending_actions();
        let refresh = !pending.is_empty();
        for pending_action in pending {
            match pending_action {
                Action::CreateSession { ref name, engine } => {
                    match supervisor
                        .create_session(name, engine, working_dir.clone())
                        .await
                    {
                        Ok(_) => {
                            app.error_message = Some(format!("Session '{}' created", name));
                        }
                        Err(e) => {
                            app.error_message = Some(format!("Failed to create: {}", e));
                        }
                    }
                }
                Action::SendCommand {
                    ref session_id,
                    ref text,
                } => {
                    if let Err(e) = supervisor.send_command(session_id, text).await {
                        app.error_message = Some(format!("Failed to send: {}", e));
                    }
                }
                Action::RestartSession(ref session_id) => {
                    match supervisor.restart_session(session_id).await {
                        Ok(()) => {
                            app.error_message = Some(format!("Session '{}' restarted", session_id));
                        }
                        Err(e) => {
                            app.error_message = Some(format!("Failed to restart: {}", e));
                        }
                    }
                }
                Action::DeleteSession(ref session_id) => {
                    match supervisor.destroy_session(session_id).await {
                        Ok(()) => {
                            app.error_message = Some("Session deleted".to_string());
                        }
                        Err(e) => {
                            app.error_message = Some(format!("Failed to delete: {}", e));
                        }
                    }
                }
                Action::Interrupt(ref session_id) => {
                    if let Err(e) = supervisor.write(session_id, b"\x1b").await {
                        app.error_message = Some(format!("Failed to interrupt: {}", e));
                    }
                }
                Action::Resize { cols, rows } => {
                    for session in supervisor.sessions().await {
                        if let Err(e) = supervisor.resize(&session.id, cols, rows).await {
                            tracing::debug!(session_id = %session.id, "Resize skipped: {}", e);
                        }
                    }
                }
                _ => {}
            }
        }
        if refresh {
            app.set_sessions(supervisor.sessions().await);
        }
        if let Some(session_id) = app.preview_request() {
            let buffer = supervisor.get_buffer(&session_id).await;
            app.set_preview(session_id, buffer);
        }

        // Render
        terminal.draw(|f| app.render(f))?;

        // Handle events from channel
        tokio::select! {
            Some(action) = rx.recv() => {
                match app.handle_action(action) {
                    Ok(should_quit) => {
                        if should_quit {
                            break Ok(());
                        }
                    }
                    Err(e) => {
                        break Err(e);
                    }
                }
            }
        }
    };

    // Restore terminal
    ratatui::restore();

    for handle in maintenance {
        handle.abort();
    }
    for session in supervisor.sessions().await {
        let _ = supervisor.kill(&session.id).await;
    }
    result
}
