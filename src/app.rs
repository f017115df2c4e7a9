use anyhow::Result;
use std::collections::HashMap;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};

use crate::actions::Action;
use crate::engine::{strip_ansi, EngineKind, SessionStatus};
use crate::supervisor::{Session, SupervisorEvent};

/// Lines of scrollback shown in the preview pane
const PREVIEW_LINES: usize = 200;

/// Theme colors inspired by Claude Code
pub struct Theme {
    pub bg: Color,
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            bg: Color::Rgb(30, 30, 30),
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(217, 119, 87), // Claude orange
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

/// Input mode for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    /// Typing the new session's name
    Creating,
    /// Picking the engine for the named session
    ChoosingEngine,
    /// Typing a command for the selected session
    Commanding,
    Confirming,
}

/// Main application state
pub struct App {
    /// Supervised sessions, sorted by id
    pub sessions: Vec<Session>,
    /// Currently selected session index
    pub list_state: ListState,
    /// Current message to display (info or error)
    pub error_message: Option<String>,
    /// Theme
    pub theme: Theme,
    /// Current input mode
    pub input_mode: InputMode,
    /// Text input buffer
    pub input_buffer: String,
    /// Name entered for the session being created
    pending_name: String,
    /// Escape-stripped scrollback of the selected session
    preview: Option<(String, String)>,
    preview_stale: bool,
    /// Output bytes received by sessions since they were last selected
    unread: HashMap<String, usize>,
    /// Pending action queue
    pub pending_actions: Vec<Action>,
}

impl App {
    pub fn new() -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            sessions: Vec::new(),
            list_state,
            error_message: None,
            theme: Theme::default(),
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            pending_name: String::new(),
            preview: None,
            preview_stale: true,
            unread: HashMap::new(),
            pending_actions: Vec::new(),
        }
    }

    /// Get the currently selected session
    pub fn selected_session(&self) -> Option<&Session> {
        self.list_state
            .selected()
            .and_then(|i| self.sessions.get(i))
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    /// Replace the session list, keeping the selection on the same session when possible
    pub fn set_sessions(&mut self, sessions: Vec<Session>) {
        let selected_id = self.selected_session().map(|s| s.id.clone());
        self.sessions = sessions;

        let index = selected_id
            .and_then(|id| self.sessions.iter().position(|s| s.id == id))
            .unwrap_or_else(|| {
                self.list_state
                    .selected()
                    .unwrap_or(0)
                    .min(self.sessions.len().saturating_sub(1))
            });
        self.select(index);
    }

    /// Session whose preview needs reloading, if any
    pub fn preview_request(&mut self) -> Option<String> {
        if !self.preview_stale {
            return None;
        }
        self.preview_stale = false;
        self.selected_session().map(|s| s.id.clone())
    }

    pub fn set_preview(&mut self, session_id: String, buffer: Option<String>) {
        self.preview = buffer.map(|raw| (session_id, tail(&strip_ansi(&raw), PREVIEW_LINES)));
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            Action::Supervisor(event) => {
                self.handle_supervisor_event(event);
                Ok(false)
            }
            Action::Error(msg) => {
                self.error_message = Some(msg);
                Ok(false)
            }
            Action::Resize { cols, rows } => {
                self.pending_actions.push(Action::Resize { cols, rows });
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Output { session_id, chunk } => {
                if self.selected_session().is_some_and(|s| s.id == session_id) {
                    self.preview_stale = true;
                } else {
                    *self.unread.entry(session_id).or_default() += chunk.len();
                }
            }
            SupervisorEvent::StateChange { session_id, change } => {
                if let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) {
                    session.status = change.status;
                    session.detected_engine = change.engine;
                }
            }
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        // Clear error message on any key press
        if self.error_message.is_some() && self.input_mode == InputMode::Normal {
            self.error_message = None;
        }

        match self.input_mode {
            InputMode::Normal => self.handle_normal_key(key),
            InputMode::Creating => self.handle_creating_key(key),
            InputMode::ChoosingEngine => self.handle_engine_key(key),
            InputMode::Commanding => self.handle_command_key(key),
            InputMode::Confirming => self.handle_confirming_key(key),
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => self.next_session(),
            KeyCode::Char('k') | KeyCode::Up => self.previous_session(),
            KeyCode::Enter => {
                if self.selected_session().is_some() {
                    self.input_mode = InputMode::Commanding;
                    self.input_buffer.clear();
                }
            }
            KeyCode::Char('n') => {
                self.input_mode = InputMode::Creating;
                self.input_buffer.clear();
            }
            KeyCode::Char('i') => {
                if let Some(session) = self.selected_session() {
                    self.pending_actions
                        .push(Action::Interrupt(session.id.clone()));
                }
            }
            KeyCode::Char('r') => {
                if let Some(session) = self.selected_session() {
                    self.pending_actions
                        .push(Action::RestartSession(session.id.clone()));
                }
            }
            KeyCode::Char('d') => {
                if self.selected_session().is_some() {
                    self.input_mode = InputMode::Confirming;
                }
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok(true);
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_creating_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                if self.input_buffer.is_empty() {
                    self.input_mode = InputMode::Normal;
                } else {
                    self.pending_name = std::mem::take(&mut self.input_buffer);
                    self.input_mode = InputMode::ChoosingEngine;
                }
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => {
                // Only allow valid session name characters
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    self.input_buffer.push(c);
                }
            }
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_engine_key(&mut self, key: KeyEvent) -> Result<bool> {
        let engine = match key.code {
            KeyCode::Char('1') => Some(EngineKind::Claude),
            KeyCode::Char('2') => Some(EngineKind::Gemini),
            KeyCode::Char('3') => Some(EngineKind::Codex),
            KeyCode::Char('0') => None,
            KeyCode::Esc => {
                self.pending_name.clear();
                self.input_mode = InputMode::Normal;
                return Ok(false);
            }
            _ => return Ok(false),
        };
        self.pending_actions.push(Action::CreateSession {
            name: std::mem::take(&mut self.pending_name),
            engine,
        });
        self.input_mode = InputMode::Normal;
        Ok(false)
    }

    fn handle_command_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                let text = std::mem::take(&mut self.input_buffer);
                if let Some(session) = self.selected_session() {
                    self.pending_actions.push(Action::SendCommand {
                        session_id: session.id.clone(),
                        text,
                    });
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_confirming_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                if let Some(session) = self.selected_session() {
                    self.pending_actions
                        .push(Action::DeleteSession(session.id.clone()));
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
            }
            _ => {}
        }
        Ok(false)
    }

    fn select(&mut self, index: usize) {
        if self.list_state.selected() != Some(index) {
            self.preview_stale = true;
        }
        self.list_state.select(Some(index));
        if let Some(id) = self.sessions.get(index).map(|s| s.id.clone()) {
            self.unread.remove(&id);
        }
    }

    fn next_session(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) if i + 1 < self.sessions.len() => i + 1,
            _ => 0,
        };
        self.select(i);
    }

    fn previous_session(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(0) | None => self.sessions.len() - 1,
            Some(i) => i - 1,
        };
        self.select(i);
    }

    fn status_style(&self, status: SessionStatus) -> (&'static str, Style) {
        let (icon, color) = match status {
            SessionStatus::Idle => ("○ ", self.theme.dim),
            SessionStatus::Starting => ("◌ ", self.theme.dim),
            SessionStatus::Working => ("● ", self.theme.warning),
            SessionStatus::Ready => ("● ", self.theme.success),
            SessionStatus::Error => ("✗ ", self.theme.error),
            SessionStatus::Completed => ("✓ ", self.theme.accent),
        };
        (icon, Style::default().fg(color))
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Main content
                Constraint::Length(3), // Footer/status
            ])
            .split(frame.area());

        frame.render_widget(
            Block::default().style(Style::default().bg(self.theme.bg)),
            frame.area(),
        );
        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        // Render modal dialogs on top
        match self.input_mode {
            InputMode::Creating => self.render_input_dialog(
                frame,
                " Create New Session ",
                "Enter session name:",
                "Press Enter to continue, Esc to cancel",
            ),
            InputMode::ChoosingEngine => self.render_engine_dialog(frame),
            InputMode::Commanding => self.render_input_dialog(
                frame,
                " Send Command ",
                "Enter command:",
                "Press Enter to send, Esc to cancel",
            ),
            InputMode::Confirming => self.render_confirm_dialog(frame),
            InputMode::Normal => {}
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " Agent Deck ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                "│ Claude · Gemini · Codex sessions",
                Style::default().fg(self.theme.dim),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(30), // Session list
                Constraint::Percentage(70), // Detail and preview
            ])
            .split(area);

        let right = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(7), Constraint::Min(0)])
            .split(chunks[1]);

        self.render_session_list(frame, chunks[0]);
        self.render_detail_pane(frame, right[0]);
        self.render_preview(frame, right[1]);
    }

    fn render_session_list(&mut self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = if self.sessions.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  No sessions. Press 'n' to create one.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.sessions
                .iter()
                .map(|session| {
                    let (icon, style) = self.status_style(session.status);
                    let name = Span::styled(&session.id, Style::default().fg(self.theme.fg));
                    let mut spans = vec![Span::styled(icon, style), name];
                    if self.unread.get(&session.id).is_some_and(|&n| n > 0) {
                        spans.push(Span::styled(" *", Style::default().fg(self.theme.accent)));
                    }
                    ListItem::new(Line::from(spans))
                })
                .collect()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .title(" Sessions ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            )
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn render_detail_pane(&self, frame: &mut Frame, area: Rect) {
        let engine_name = |engine: Option<EngineKind>| {
            engine.map_or_else(|| "shell".to_string(), |e| e.to_string())
        };

        let content = if let Some(session) = self.selected_session() {
            let (_, status_style) = self.status_style(session.status);
            vec![
                Line::from(vec![
                    Span::styled("Engine: ", Style::default().fg(self.theme.dim)),
                    Span::styled(engine_name(session.engine), Style::default().fg(self.theme.fg)),
                    Span::styled("  Detected: ", Style::default().fg(self.theme.dim)),
                    Span::styled(
                        engine_name(session.detected_engine),
                        Style::default().fg(self.theme.fg),
                    ),
                ]),
                Line::from(vec![
                    Span::styled("Status: ", Style::default().fg(self.theme.dim)),
                    Span::styled(format!("{:?}", session.status), status_style),
                ]),
                Line::from(vec![
                    Span::styled("Directory: ", Style::default().fg(self.theme.dim)),
                    Span::styled(
                        session.working_dir.display().to_string(),
                        Style::default().fg(self.theme.fg),
                    ),
                ]),
                Line::from(""),
                Line::from(Span::styled(
                    "Enter: send command │ i: interrupt │ r: restart",
                    Style::default().fg(self.theme.dim),
                )),
            ]
        } else {
            vec![
                Line::from(Span::styled(
                    "No session selected",
                    Style::default().fg(self.theme.dim),
                )),
                Line::from(""),
                Line::from(Span::styled(
                    "Press 'n' to create a new session",
                    Style::default().fg(self.theme.dim),
                )),
            ]
        };

        let detail = Paragraph::new(content).block(
            Block::default()
                .title(" Details ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(detail, area);
    }

    fn render_preview(&self, frame: &mut Frame, area: Rect) {
        let selected = self.selected_session().map(|s| s.id.as_str());
        let text = match &self.preview {
            Some((id, text)) if Some(id.as_str()) == selected => text.as_str(),
            _ => "",
        };

        // Show the bottom of the scrollback
        let visible = area.height.saturating_sub(2) as usize;
        let lines: Vec<Line> = tail(text, visible)
            .lines()
            .map(|l| Line::from(Span::styled(l.to_string(), Style::default().fg(self.theme.fg))))
            .collect();

        let preview = Paragraph::new(lines).block(
            Block::default()
                .title(" Output ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(preview, area);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text =
            " q: Quit │ j/k: Navigate │ Enter: Command │ i: Interrupt │ n: New │ r: Restart │ d: Delete ";

        let content = if let Some(ref msg) = self.error_message {
            let style = if msg.contains("created") || msg.contains("deleted") || msg.contains("restarted") {
                Style::default().fg(self.theme.success)
            } else {
                Style::default().fg(self.theme.error)
            };
            Line::from(Span::styled(format!(" {} ", msg), style))
        } else {
            Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim)))
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }

    fn render_input_dialog(&self, frame: &mut Frame, title: &str, prompt: &str, hint: &str) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(title.to_string())
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.accent));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(prompt.to_string(), Style::default().fg(self.theme.fg))),
            Line::from(""),
            Line::from(Span::styled(
                format!("▶ {}_", self.input_buffer),
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
            Line::from(Span::styled(hint.to_string(), Style::default().fg(self.theme.dim))),
        ];

        let paragraph = Paragraph::new(text);
        frame.render_widget(paragraph, inner);
    }

    fn render_engine_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(50, 30, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Choose Engine ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.accent));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let mut text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Engine for '{}':", self.pending_name),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
        ];
        for (key, engine) in ["1", "2", "3"].iter().zip(EngineKind::ALL) {
            text.push(Line::from(vec![
                Span::styled(format!("  {} ", key), Style::default().fg(self.theme.accent)),
                Span::styled(engine.name(), Style::default().fg(self.theme.fg)),
            ]));
        }
        text.push(Line::from(vec![
            Span::styled("  0 ", Style::default().fg(self.theme.accent)),
            Span::styled("plain shell", Style::default().fg(self.theme.fg)),
        ]));
        text.push(Line::from(""));
        text.push(Line::from(Span::styled(
            "Esc to cancel",
            Style::default().fg(self.theme.dim),
        )));

        let paragraph = Paragraph::new(text);
        frame.render_widget(paragraph, inner);
    }

    fn render_confirm_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Confirm Delete ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.error));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let session_name = self
            .selected_session()
            .map(|s| s.id.as_str())
            .unwrap_or("unknown");

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Delete session '{}'?", session_name),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "The process is killed and its scrollback discarded.",
                Style::default().fg(self.theme.warning),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press 'y' to confirm, 'n' or Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];

        let paragraph = Paragraph::new(text);
        frame.render_widget(paragraph, inner);
    }
}

/// Last `lines` lines of `text`
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Helper function to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
