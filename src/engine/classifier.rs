//! Turns raw terminal output into engine identity and busy/ready transitions.
//!
//! Each chunk runs down a fixed ladder of rules. The first rule that claims the
//! chunk decides the outcome, even when that outcome is "no event yet".

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::patterns::{strip_ansi, Identification, PatternRegistry};
use super::{Detected, Detection, EngineKind};

/// Timing and ordering knobs for the classifier
#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    /// Minimum spacing between repeated busy or ready transitions
    pub debounce: Duration,
    /// Silence while busy after which the session is considered ready
    pub implicit_ready: Duration,
    /// Engines whose startup banners are tried first win ties
    pub detection_order: Vec<EngineKind>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            implicit_ready: Duration::from_millis(500),
            detection_order: vec![EngineKind::Codex, EngineKind::Gemini, EngineKind::Claude],
        }
    }
}

/// Per-session classifier memory
#[derive(Debug, Clone)]
struct ClassifierState {
    engine: Option<EngineKind>,
    status: Option<Detected>,
    changed_at: Instant,
}

impl ClassifierState {
    fn new(now: Instant) -> Self {
        Self {
            engine: None,
            status: None,
            changed_at: now,
        }
    }

    fn transition(&mut self, engine: Option<EngineKind>, status: Detected, now: Instant) -> Detection {
        self.engine = engine;
        self.status = Some(status);
        self.changed_at = now;
        Detection::new(engine, status)
    }
}

/// What a rule made of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// The rule does not apply; try the next one
    Pass,
    /// The rule claims the chunk but there is nothing to report
    Hold,
    Emit(Detection),
}

/// The ladder, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    ShellExit,
    Startup,
    Busy,
    Ready,
    ImplicitReady,
}

const LADDER: [Rule; 5] = [
    Rule::ShellExit,
    Rule::Startup,
    Rule::Busy,
    Rule::Ready,
    Rule::ImplicitReady,
];

/// A chunk in both raw and escape-stripped form
struct Chunk<'a> {
    raw: &'a str,
    clean: String,
}

impl Rule {
    fn evaluate(
        self,
        registry: &PatternRegistry,
        settings: &ClassifierSettings,
        state: &mut ClassifierState,
        chunk: &Chunk<'_>,
        now: Instant,
    ) -> Verdict {
        let elapsed = now.saturating_duration_since(state.changed_at);
        match self {
            Rule::ShellExit => {
                if registry.is_shell_exit(chunk.raw, &chunk.clean) {
                    Verdict::Emit(state.transition(None, Detected::Ready, now))
                } else {
                    Verdict::Pass
                }
            }
            Rule::Startup => {
                if state.engine.is_some() {
                    return Verdict::Pass;
                }
                match registry.identify(&chunk.clean, &settings.detection_order) {
                    Identification::Engine(kind) => {
                        Verdict::Emit(state.transition(Some(kind), Detected::Ready, now))
                    }
                    Identification::Ambiguous => Verdict::Hold,
                    Identification::Unrecognized => Verdict::Pass,
                }
            }
            Rule::Busy => {
                let Some(kind) = state.engine else {
                    return Verdict::Pass;
                };
                if !registry.engine(kind).busy.matches(&chunk.clean) {
                    return Verdict::Pass;
                }
                if state.status != Some(Detected::Busy) || elapsed >= settings.debounce {
                    Verdict::Emit(state.transition(Some(kind), Detected::Busy, now))
                } else {
                    Verdict::Hold
                }
            }
            Rule::Ready => {
                let Some(kind) = state.engine else {
                    return Verdict::Pass;
                };
                let patterns = registry.engine(kind);
                if !patterns.ready.matches(&chunk.clean) || patterns.busy.matches(&chunk.clean) {
                    return Verdict::Pass;
                }
                if state.status != Some(Detected::Ready) || elapsed >= settings.debounce {
                    Verdict::Emit(state.transition(Some(kind), Detected::Ready, now))
                } else {
                    Verdict::Hold
                }
            }
            Rule::ImplicitReady => {
                if state.status != Some(Detected::Busy) || elapsed < settings.implicit_ready {
                    return Verdict::Pass;
                }
                let busy_now = state
                    .engine
                    .is_some_and(|kind| registry.engine(kind).busy.matches(&chunk.clean));
                if busy_now {
                    Verdict::Pass
                } else {
                    Verdict::Emit(state.transition(state.engine, Detected::Ready, now))
                }
            }
        }
    }
}

/// Classifies output chunks for the sessions it has been told about
pub struct StreamClassifier {
    registry: &'static PatternRegistry,
    settings: ClassifierSettings,
    sessions: HashMap<String, ClassifierState>,
}

impl StreamClassifier {
    pub fn new(settings: ClassifierSettings) -> Self {
        Self {
            registry: PatternRegistry::builtin(),
            settings,
            sessions: HashMap::new(),
        }
    }

    /// Start tracking a session. Re-registering resets its state.
    pub fn register(&mut self, session_id: &str) {
        self.sessions
            .insert(session_id.to_string(), ClassifierState::new(Instant::now()));
    }

    pub fn forget(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn engine(&self, session_id: &str) -> Option<EngineKind> {
        self.sessions.get(session_id).and_then(|s| s.engine)
    }

    pub fn classify(&mut self, session_id: &str, chunk: &str) -> Option<Detection> {
        self.classify_at(session_id, chunk, Instant::now())
    }

    /// Classify `chunk` as if it arrived at `now`. Unknown sessions never produce events.
    pub fn classify_at(&mut self, session_id: &str, chunk: &str, now: Instant) -> Option<Detection> {
        let state = self.sessions.get_mut(session_id)?;
        let chunk = Chunk {
            raw: chunk,
            clean: strip_ansi(chunk),
        };

        for rule in LADDER {
            match rule.evaluate(self.registry, &self.settings, state, &chunk, now) {
                Verdict::Pass => continue,
                Verdict::Hold => return None,
                Verdict::Emit(detection) => {
                    debug!(session_id, ?rule, ?detection, "classifier transition");
                    return Some(detection);
                }
            }
        }
        None
    }

    /// Seed the engine from an outside signal; the session is treated as ready.
    pub fn set_engine(&mut self, session_id: &str, engine: EngineKind) -> Option<Detection> {
        self.set_engine_at(session_id, engine, Instant::now())
    }

    pub fn set_engine_at(
        &mut self,
        session_id: &str,
        engine: EngineKind,
        now: Instant,
    ) -> Option<Detection> {
        let state = self.sessions.get_mut(session_id)?;
        Some(state.transition(Some(engine), Detected::Ready, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "s1";

    fn classifier() -> StreamClassifier {
        let mut classifier = StreamClassifier::new(ClassifierSettings::default());
        classifier.register(SESSION);
        classifier
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn busy_claude(classifier: &mut StreamClassifier, at: Instant) {
        classifier.set_engine_at(SESSION, EngineKind::Claude, at);
        let event = classifier.classify_at(SESSION, "✻ Thinking… (esc to interrupt)", at + ms(1));
        assert_eq!(event, Some(Detection::new(Some(EngineKind::Claude), Detected::Busy)));
    }

    #[test]
    fn test_welcome_busy_silence_scenario() {
        let mut c = classifier();
        let t0 = Instant::now();

        let events = [
            c.classify_at(SESSION, "\x1b[1m✻ Welcome to Claude Code!\x1b[0m", t0),
            c.classify_at(SESSION, "✶ Brewing… (3s · esc to interrupt)", t0 + ms(200)),
            c.classify_at(SESSION, "some streamed text", t0 + ms(800)),
        ];

        let engine = Some(EngineKind::Claude);
        assert_eq!(
            events,
            [
                Some(Detection::new(engine, Detected::Ready)),
                Some(Detection::new(engine, Detected::Busy)),
                Some(Detection::new(engine, Detected::Ready)),
            ]
        );
    }

    #[test]
    fn test_shell_exit_overrides_busy_markers() {
        let mut c = classifier();
        let t0 = Instant::now();
        busy_claude(&mut c, t0);

        let chunk = "✻ Thinking… (esc to interrupt)\n\x1b]133;A\x07elle@box:~$ ";
        let event = c.classify_at(SESSION, chunk, t0 + ms(2));
        assert_eq!(event, Some(Detection::new(None, Detected::Ready)));
        assert_eq!(c.engine(SESSION), None);
    }

    #[test]
    fn test_shared_chrome_waits_for_more_data() {
        let mut c = classifier();
        let t0 = Instant::now();
        assert_eq!(c.classify_at(SESSION, "╭────────╮\n│ >      │\n╰────────╯", t0), None);
        assert_eq!(c.engine(SESSION), None);

        let event = c.classify_at(SESSION, "Gemini CLI v0.1.9", t0 + ms(10));
        assert_eq!(event, Some(Detection::new(Some(EngineKind::Gemini), Detected::Ready)));
    }

    #[test]
    fn test_busy_is_debounced() {
        let mut c = classifier();
        let t0 = Instant::now();
        busy_claude(&mut c, t0);

        let repeat = "✢ Thinking… (esc to interrupt)";
        assert_eq!(c.classify_at(SESSION, repeat, t0 + ms(30)), None);
        assert_eq!(c.classify_at(SESSION, repeat, t0 + ms(90)), None);
        // Outside the window a repeated busy marker is reported again
        assert!(c.classify_at(SESSION, repeat, t0 + ms(150)).is_some());
    }

    #[test]
    fn test_implicit_ready_after_silence() {
        let mut c = classifier();
        let t0 = Instant::now();
        busy_claude(&mut c, t0);

        assert_eq!(c.classify_at(SESSION, "", t0 + ms(300)), None);
        let event = c.classify_at(SESSION, "", t0 + ms(501));
        assert_eq!(event, Some(Detection::new(Some(EngineKind::Claude), Detected::Ready)));
    }

    #[test]
    fn test_ready_requires_absence_of_busy() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.set_engine_at(SESSION, EngineKind::Codex, t0);
        let chunk = "⏎ send\n• Working (4s • esc to interrupt)";
        let event = c.classify_at(SESSION, chunk, t0 + ms(200));
        assert_eq!(event, Some(Detection::new(Some(EngineKind::Codex), Detected::Busy)));
    }

    #[test]
    fn test_ready_is_debounced() {
        let mut c = classifier();
        let t0 = Instant::now();
        c.set_engine_at(SESSION, EngineKind::Claude, t0);
        assert_eq!(c.classify_at(SESSION, "? for shortcuts", t0 + ms(50)), None);
        assert!(c.classify_at(SESSION, "? for shortcuts", t0 + ms(120)).is_some());
    }

    #[test]
    fn test_busy_markers_ignored_without_engine() {
        let mut c = classifier();
        assert_eq!(c.classify(SESSION, "⠋ (esc to cancel, 2s)"), None);
    }

    #[test]
    fn test_unknown_session_is_ignored() {
        let mut c = classifier();
        assert_eq!(c.classify("other", "Welcome to Claude Code"), None);
        assert_eq!(c.set_engine("other", EngineKind::Claude), None);

        c.forget(SESSION);
        assert_eq!(c.classify(SESSION, "Welcome to Claude Code"), None);
    }
}
