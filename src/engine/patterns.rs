use once_cell::sync::Lazy;
use regex::Regex;

use super::EngineKind;

/// An ordered set of recognition rules. A chunk matches the set if any rule matches.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Regex>,
}

impl RuleSet {
    fn compile(patterns: &[&str]) -> Self {
        Self {
            rules: patterns.iter().map(|p| Regex::new(p).unwrap()).collect(),
        }
    }

    pub fn matches(&self, chunk: &str) -> bool {
        self.rules.iter().any(|re| re.is_match(chunk))
    }
}

/// Recognition rules for a single engine
#[derive(Debug, Clone)]
pub struct EnginePatterns {
    /// Banner text only this engine prints on launch
    pub startup: RuleSet,
    /// Spinners and interrupt hints shown while the engine works
    pub busy: RuleSet,
    /// Prompt hints shown while the engine waits for input
    pub ready: RuleSet,
    /// Error output that should put the session into the error state
    pub error: RuleSet,
}

/// Outcome of looking for a startup banner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identification {
    Engine(EngineKind),
    /// Only box-drawing chrome several engines share was seen
    Ambiguous,
    Unrecognized,
}

/// Static per-engine pattern tables plus the shared "returned to shell" rules
#[derive(Debug)]
pub struct PatternRegistry {
    claude: EnginePatterns,
    gemini: EnginePatterns,
    codex: EnginePatterns,
    shared_chrome: RuleSet,
    shell_control: RuleSet,
    shell_prompt: RuleSet,
}

static BUILTIN: Lazy<PatternRegistry> = Lazy::new(|| PatternRegistry {
    claude: EnginePatterns {
        startup: RuleSet::compile(&[
            r"Welcome to Claude Code",
            r"Claude Code v\d",
            r"✻ Welcome to Claude",
        ]),
        busy: RuleSet::compile(&[
            r"(?i)esc to interrupt",
            r"[✻✶✳✢✽·]\s*\w+…",
        ]),
        ready: RuleSet::compile(&[
            r"\? for shortcuts",
            r"Do you want to proceed\?",
        ]),
        error: RuleSet::compile(&[r"API Error", r"(?m)^\s*Error:"]),
    },
    gemini: EnginePatterns {
        startup: RuleSet::compile(&[
            r"Welcome to Gemini",
            r"Gemini CLI",
            r"gemini-\d(?:\.\d)?-(?:pro|flash)",
            r"GEMINI\.md",
        ]),
        busy: RuleSet::compile(&[r"\(esc to cancel", r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]"]),
        ready: RuleSet::compile(&[r"Type your message", r"Waiting for user confirmation"]),
        error: RuleSet::compile(&[r"\[API Error", r"(?m)^\s*✕ "]),
    },
    codex: EnginePatterns {
        startup: RuleSet::compile(&[
            r"Welcome to Codex",
            r"OpenAI Codex",
            r">_ Codex",
        ]),
        busy: RuleSet::compile(&[r"Working \(\d+s", r"(?i)esc to interrupt"]),
        ready: RuleSet::compile(&[r"⏎ send", r"Ask Codex to do anything"]),
        error: RuleSet::compile(&[r"stream error", r"(?m)^ERROR\b"]),
    },
    shared_chrome: RuleSet::compile(&[
        r"╭─",
        r"╰─",
        r"(?i)tips for getting started",
        r"(?m)^\s*│\s*>",
    ]),
    shell_control: RuleSet::compile(&[
        // OSC 133 semantic prompt start and OSC 7 working directory report
        r"\x1b\]133;A",
        r"\x1b\]7;file://",
    ]),
    shell_prompt: RuleSet::compile(&[r"(?m)^[\w.-]+@[\w.-]+[^\n]*?[$#%] ?\r?$"]),
});

impl PatternRegistry {
    pub fn builtin() -> &'static PatternRegistry {
        &BUILTIN
    }

    pub fn engine(&self, kind: EngineKind) -> &EnginePatterns {
        match kind {
            EngineKind::Claude => &self.claude,
            EngineKind::Gemini => &self.gemini,
            EngineKind::Codex => &self.codex,
        }
    }

    /// Control sequences are looked for in `raw`, prompt shapes in the ANSI-stripped `clean`.
    pub fn is_shell_exit(&self, raw: &str, clean: &str) -> bool {
        self.shell_control.matches(raw) || self.shell_prompt.matches(clean)
    }

    /// Checks startup banners in `order`; shared chrome is only consulted last.
    pub fn identify(&self, clean: &str, order: &[EngineKind]) -> Identification {
        for kind in order {
            if self.engine(*kind).startup.matches(clean) {
                return Identification::Engine(*kind);
            }
        }
        if self.shared_chrome.matches(clean) {
            return Identification::Ambiguous;
        }
        Identification::Unrecognized
    }

    /// With no known engine every engine's error rules apply.
    pub fn is_error(&self, engine: Option<EngineKind>, clean: &str) -> bool {
        match engine {
            Some(kind) => self.engine(kind).error.matches(clean),
            None => EngineKind::ALL
                .iter()
                .any(|kind| self.engine(*kind).error.matches(clean)),
        }
    }
}

static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][0-9A-Za-z]|\x1b[=>78DEHMc]",
    )
    .unwrap()
});

/// Remove terminal escape sequences, leaving printable text
pub fn strip_ansi(text: &str) -> String {
    RE_ANSI.replace_all(text, "").into_owned()
}
