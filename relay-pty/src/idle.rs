//! Idle and stuck detection for the wrapped terminal.
//!
//! Combines weighted signals into a confidence score in [0,1]:
//! silence, prompt re-appearance, ghost-text discounting, and (on Linux,
//! when the child pid is known) /proc task state. Stuck detection runs on
//! the same inputs and is purely observational.

use regex::Regex;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;

static ERROR_PATTERN: OnceLock<Regex> = OnceLock::new();
static GHOST_PATTERN: OnceLock<Regex> = OnceLock::new();

fn error_pattern() -> &'static Regex {
    ERROR_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(error|exception|traceback|panicked at)\b").unwrap()
    })
}

/// Dim/gray text between a cursor save and restore: auto-suggest ghost
/// text, not real output.
fn ghost_pattern() -> &'static Regex {
    GHOST_PATTERN.get_or_init(|| {
        Regex::new(r"(?s)\x1B7.*?\x1B\[(?:2|90)m.*?\x1B8|\x1B\[s.*?\x1B\[(?:2|90)m.*?\x1B\[u")
            .unwrap()
    })
}

/// Signal weights; silence + prompt alone clears the default threshold.
const WEIGHT_SILENCE: f64 = 0.45;
const WEIGHT_PROMPT: f64 = 0.35;
const WEIGHT_PROC: f64 = 0.20;

/// Identical trailing chunks needed to call it a loop.
const OUTPUT_LOOP_REPEATS: usize = 3;
/// Error hits inside the window that make an error loop.
const ERROR_LOOP_HITS: usize = 3;
const ERROR_LOOP_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct IdleConfig {
    pub min_silence_ms: u64,
    pub confidence_threshold: f64,
    /// Silence past this long counts as stuck (extended_idle).
    pub stuck_silence_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            min_silence_ms: 1500,
            confidence_threshold: 0.7,
            stuck_silence_ms: 120_000,
        }
    }
}

/// The detector's verdict for one assessment.
#[derive(Debug, Clone)]
pub struct IdleVerdict {
    pub is_idle: bool,
    pub confidence: f64,
    pub signals: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    ExtendedIdle,
    ErrorLoop,
    OutputLoop,
}

impl StuckReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtendedIdle => "extended_idle",
            Self::ErrorLoop => "error_loop",
            Self::OutputLoop => "output_loop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckEvent {
    Stuck(StuckReason),
    Unstuck,
}

pub struct IdleDetector {
    config: IdleConfig,
    prompt: Regex,
    child_pid: Option<i32>,
    /// Last output that was not ghost text.
    last_real_output: Instant,
    last_line: String,
    /// Explicit ready marker from the parser.
    ready: bool,
    recent_chunk_hashes: VecDeque<u64>,
    error_hits: VecDeque<Instant>,
    stuck: Option<StuckReason>,
}

impl IdleDetector {
    pub fn new(config: IdleConfig, prompt_pattern: &str, child_pid: Option<i32>) -> Self {
        let prompt = Regex::new(prompt_pattern)
            .unwrap_or_else(|_| Regex::new(r"^[>$%#] $").unwrap());
        Self {
            config,
            prompt,
            child_pid,
            last_real_output: Instant::now(),
            last_line: String::new(),
            ready: false,
            recent_chunk_hashes: VecDeque::new(),
            error_hits: VecDeque::new(),
            stuck: None,
        }
    }

    /// Feed one raw output chunk (ANSI intact) and its cleaned form.
    pub fn record_output(&mut self, raw: &str, clean: &str) {
        let now = Instant::now();
        if !is_ghost_only(raw) {
            self.last_real_output = now;
            self.ready = false;
        }

        if let Some(last) = clean.lines().rev().find(|l| !l.trim().is_empty()) {
            self.last_line = last.to_string();
        }

        if error_pattern().is_match(clean) {
            self.error_hits.push_back(now);
        }
        while matches!(
            self.error_hits.front(),
            Some(t) if now.duration_since(*t) > ERROR_LOOP_WINDOW
        ) {
            self.error_hits.pop_front();
        }

        let trimmed = clean.trim();
        if !trimmed.is_empty() {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            trimmed.hash(&mut hasher);
            self.recent_chunk_hashes.push_back(hasher.finish());
            while self.recent_chunk_hashes.len() > 8 {
                self.recent_chunk_hashes.pop_front();
            }
        }
    }

    /// Mark the explicit `->pty:ready` signal.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Note that input was just injected: the terminal is busy again.
    pub fn mark_injected(&mut self) {
        self.last_real_output = Instant::now();
        self.ready = false;
    }

    pub fn silence_ms(&self) -> u64 {
        self.last_real_output.elapsed().as_millis() as u64
    }

    /// Score the current quiescence.
    pub fn assess(&self) -> IdleVerdict {
        if self.ready {
            return IdleVerdict {
                is_idle: true,
                confidence: 1.0,
                signals: vec!["ready_signal"],
            };
        }

        let mut confidence = 0.0;
        let mut signals = Vec::new();

        if self.silence_ms() >= self.config.min_silence_ms {
            confidence += WEIGHT_SILENCE;
            signals.push("silence");
        }
        if self.prompt.is_match(&self.last_line) || common_prompt(&self.last_line) {
            confidence += WEIGHT_PROMPT;
            signals.push("prompt");
        }
        match self.proc_state_idle() {
            Some(true) => {
                confidence += WEIGHT_PROC;
                signals.push("proc_idle");
            }
            Some(false) => signals.push("proc_busy"),
            None => {}
        }

        let confidence = confidence.min(1.0);
        IdleVerdict {
            is_idle: confidence >= self.config.confidence_threshold,
            confidence,
            signals,
        }
    }

    /// Threshold gate used by the injector.
    pub fn ready_for_injection(&self) -> bool {
        self.assess().is_idle
    }

    /// Whether the last visible line is a bare shell prompt (not the CLI's
    /// own prompt): injecting there would run the message as a command.
    pub fn at_bare_shell_prompt(&self) -> bool {
        let trimmed = self.last_line.trim_end();
        trimmed.ends_with('$') || trimmed.ends_with('#')
    }

    /// Periodic stuck evaluation; returns a transition event when the state
    /// flips. Stuck is observational and never blocks injection.
    pub fn check_stuck(&mut self) -> Option<StuckEvent> {
        let reason = self.current_stuck_reason();
        match (self.stuck, reason) {
            (None, Some(r)) => {
                self.stuck = Some(r);
                debug!(reason = r.as_str(), "terminal looks stuck");
                Some(StuckEvent::Stuck(r))
            }
            (Some(_), None) => {
                self.stuck = None;
                Some(StuckEvent::Unstuck)
            }
            _ => None,
        }
    }

    fn current_stuck_reason(&self) -> Option<StuckReason> {
        if self.error_hits.len() >= ERROR_LOOP_HITS {
            return Some(StuckReason::ErrorLoop);
        }
        if self.recent_chunk_hashes.len() >= OUTPUT_LOOP_REPEATS {
            let tail: Vec<u64> = self
                .recent_chunk_hashes
                .iter()
                .rev()
                .take(OUTPUT_LOOP_REPEATS)
                .copied()
                .collect();
            if tail.windows(2).all(|w| w[0] == w[1]) {
                return Some(StuckReason::OutputLoop);
            }
        }
        if self.silence_ms() >= self.config.stuck_silence_ms {
            return Some(StuckReason::ExtendedIdle);
        }
        None
    }

    /// Linux only: child task state S (sleeping) or I (idle) with the pid
    /// provided. None when unavailable.
    fn proc_state_idle(&self) -> Option<bool> {
        let pid = self.child_pid?;
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        // State is the field after the parenthesized comm, which may itself
        // contain spaces.
        let after_comm = stat.rsplit_once(')')?.1.trim_start();
        let state = after_comm.chars().next()?;
        Some(matches!(state, 'S' | 'I'))
    }
}

/// Whether a chunk is nothing but ghost-text repaint (dim/gray between
/// cursor save/restore).
fn is_ghost_only(raw: &str) -> bool {
    if raw.is_empty() {
        return false;
    }
    let without_ghost = ghost_pattern().replace_all(raw, "");
    without_ghost.trim().is_empty() && without_ghost.len() != raw.len()
}

fn common_prompt(line: &str) -> bool {
    let trimmed = line.trim_start();
    ["> ", ">>> ", "codex> ", "› "]
        .iter()
        .any(|p| trimmed.ends_with(p) || trimmed == p.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(min_silence_ms: u64) -> IdleDetector {
        IdleDetector::new(
            IdleConfig {
                min_silence_ms,
                confidence_threshold: 0.7,
                stuck_silence_ms: 200,
            },
            r"^[>›] $",
            None,
        )
    }

    #[test]
    fn test_silence_plus_prompt_clears_threshold() {
        let mut d = detector(0);
        d.record_output("running...\n> ", "running...\n> ");
        let verdict = d.assess();
        assert!(verdict.signals.contains(&"silence"));
        assert!(verdict.signals.contains(&"prompt"));
        assert!(verdict.confidence >= 0.7);
        assert!(verdict.is_idle);
    }

    #[test]
    fn test_silence_alone_insufficient() {
        let mut d = detector(0);
        d.record_output("still working on it\n", "still working on it\n");
        let verdict = d.assess();
        assert!(verdict.signals.contains(&"silence"));
        assert!(!verdict.is_idle);
    }

    #[test]
    fn test_fresh_output_resets_silence() {
        let mut d = detector(5000);
        d.record_output("burst\n> ", "burst\n> ");
        let verdict = d.assess();
        assert!(!verdict.signals.contains(&"silence"));
        assert!(!verdict.is_idle);
    }

    #[test]
    fn test_ghost_text_does_not_reset_silence() {
        let mut d = detector(0);
        d.record_output("done\n> ", "done\n> ");
        std::thread::sleep(Duration::from_millis(5));
        let before = d.silence_ms();
        // Pure ghost repaint: dim suggestion between cursor save/restore.
        d.record_output("\x1B7\x1B[90msuggestion\x1B[0m\x1B8", "suggestion");
        assert!(d.silence_ms() >= before);
    }

    #[test]
    fn test_ready_signal_overrides() {
        let mut d = detector(60_000);
        d.record_output("busy busy\n", "busy busy\n");
        d.mark_ready();
        let verdict = d.assess();
        assert!(verdict.is_idle);
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn test_injection_marks_busy() {
        let mut d = detector(0);
        d.record_output("x\n> ", "x\n> ");
        d.mark_ready();
        d.mark_injected();
        assert!(d.silence_ms() < 100);
        assert!(!d.assess().signals.contains(&"ready_signal"));
    }

    #[test]
    fn test_stuck_extended_idle_and_recovery() {
        let mut d = detector(0);
        d.record_output("quiet now\n", "quiet now\n");
        std::thread::sleep(Duration::from_millis(220));
        assert_eq!(
            d.check_stuck(),
            Some(StuckEvent::Stuck(StuckReason::ExtendedIdle))
        );
        // Still stuck: no repeat event.
        assert_eq!(d.check_stuck(), None);
        d.record_output("alive again\n", "alive again\n");
        assert_eq!(d.check_stuck(), Some(StuckEvent::Unstuck));
    }

    #[test]
    fn test_stuck_error_loop() {
        let mut d = detector(60_000);
        for _ in 0..3 {
            d.record_output("Error: connection refused\n", "Error: connection refused\n");
        }
        assert_eq!(
            d.check_stuck(),
            Some(StuckEvent::Stuck(StuckReason::ErrorLoop))
        );
    }

    #[test]
    fn test_stuck_output_loop() {
        let mut d = detector(60_000);
        for _ in 0..3 {
            d.record_output("spinner frame\n", "spinner frame\n");
        }
        assert_eq!(
            d.check_stuck(),
            Some(StuckEvent::Stuck(StuckReason::OutputLoop))
        );
    }

    #[test]
    fn test_bare_shell_prompt() {
        let mut d = detector(0);
        d.record_output("user@host:~$ ", "user@host:~$ ");
        assert!(d.at_bare_shell_prompt());
        d.record_output("> ", "> ");
        assert!(!d.at_bare_shell_prompt());
    }
}
