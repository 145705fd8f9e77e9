//! Output parser for relay commands and agent status detection.
//!
//! Scans agent output for:
//! - `->relay:` commands (messages, broadcasts, spawns, releases)
//! - `->continuity:` commands (opaque, routed onward)
//! - Prompt patterns (to detect idle state)
//! - `->pty:ready` explicit ready signal
//!
//! Continuation lines (indented text after a command line) join into the
//! command body. Fenced bodies (`<<< ... >>>`) span chunks. Anything inside
//! a markdown code fence is ignored, and an echo dedup keeps re-rendered
//! commands from firing twice.

use regex::Regex;
use relay_proto::dedup::DedupRing;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, warn};

static RELAY_PATTERN: OnceLock<Regex> = OnceLock::new();
static CONTINUITY_PATTERN: OnceLock<Regex> = OnceLock::new();
static SPAWN_PATTERN: OnceLock<Regex> = OnceLock::new();
static META_PATTERN: OnceLock<Regex> = OnceLock::new();
static PLACEHOLDER_PATTERN: OnceLock<Regex> = OnceLock::new();
static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();

fn relay_pattern() -> &'static Regex {
    RELAY_PATTERN.get_or_init(|| {
        Regex::new(r"^[\s>$%#\-*•]*->relay:(\S+)(?:[ \t]+(.*))?$").unwrap()
    })
}

fn continuity_pattern() -> &'static Regex {
    CONTINUITY_PATTERN.get_or_init(|| {
        Regex::new(r"^[\s>$%#\-*•]*->continuity:(\S+)(?:[ \t]+(.*))?$").unwrap()
    })
}

fn spawn_pattern() -> &'static Regex {
    SPAWN_PATTERN.get_or_init(|| {
        // name, cli, quoted task (task optional for the fenced variant)
        Regex::new(r#"^(\S+)\s+(\S+)(?:\s+"([^"]*)")?\s*$"#).unwrap()
    })
}

fn meta_pattern() -> &'static Regex {
    META_PATTERN.get_or_init(|| Regex::new(r"\s*\[([^\[\]]+)\]\s*$").unwrap())
}

fn placeholder_pattern() -> &'static Regex {
    PLACEHOLDER_PATTERN.get_or_init(|| Regex::new(r"^<[A-Za-z_][A-Za-z0-9_]*>$").unwrap())
}

fn ansi_pattern() -> &'static Regex {
    ANSI_PATTERN.get_or_init(|| {
        Regex::new(r"\x1B\[[0-9;?]*[A-Za-z]|\x1B\].*?(?:\x07|\x1B\\)|\x1B[()][A-Z0-9]|\x1B[78=>M]")
            .unwrap()
    })
}

/// Strip ANSI escape sequences from text.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").to_string()
}

/// Remove control characters that would corrupt an injected line.
pub fn sanitize_for_injection(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// A command extracted from agent output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayCommand {
    Message {
        from: String,
        to: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        importance: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        raw: String,
    },
    Spawn {
        from: String,
        name: String,
        cli: String,
        task: String,
        raw: String,
    },
    Release {
        from: String,
        name: String,
        raw: String,
    },
}

/// Continuity commands are opaque here; they route to an external
/// collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct ContinuityCommand {
    pub action: String,
    pub content: String,
}

/// Result of feeding one output chunk through the parser.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub commands: Vec<RelayCommand>,
    pub continuity: Vec<ContinuityCommand>,
    /// Targets rejected as soft errors (placeholders and the like).
    pub rejected: Vec<String>,
    pub is_idle: bool,
    pub ready_signal: bool,
}

/// What an open `<<<` fence is collecting.
#[derive(Debug)]
enum FenceKind {
    Message { target: String },
    Spawn { name: String, cli: String },
    Continuity { action: String },
}

#[derive(Debug)]
struct Fence {
    kind: FenceKind,
    lines: Vec<String>,
    raw: Vec<String>,
}

/// A single-line command accumulating indented continuation lines.
#[derive(Debug)]
struct PendingMessage {
    target: String,
    lines: Vec<String>,
    raw: Vec<String>,
}

pub struct OutputParser {
    agent: String,
    prompt: Regex,
    /// Carry-over for a partial last line.
    partial: String,
    fence: Option<Fence>,
    pending: Option<PendingMessage>,
    in_code_fence: bool,
    echo_dedup: DedupRing,
    last_line: String,
}

/// Bail out of a runaway fence after this many lines.
const FENCE_MAX_LINES: usize = 400;
/// Echo-dedup key uses the first 100 characters of the body.
const DEDUP_BODY_PREFIX: usize = 100;

impl OutputParser {
    pub fn new(agent: String, prompt_pattern: &str) -> Self {
        let prompt = Regex::new(prompt_pattern)
            .unwrap_or_else(|_| Regex::new(r"^[>$%#] $").unwrap());
        Self {
            agent,
            prompt,
            partial: String::new(),
            fence: None,
            pending: None,
            in_code_fence: false,
            echo_dedup: DedupRing::default(),
            last_line: String::new(),
        }
    }

    /// Feed raw terminal bytes; returns every command completed by this
    /// chunk plus idle hints.
    pub fn process(&mut self, output: &[u8]) -> ParseResult {
        let text = String::from_utf8_lossy(output);
        let clean = strip_ansi(&text);

        let mut result = ParseResult::default();

        self.partial.push_str(&clean);
        // Split off complete lines, keeping the partial tail.
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).take(pos).collect();
            let line = line.trim_end_matches('\r').to_string();
            self.handle_line(&line, &mut result);
        }

        // A command with no further continuation closes at chunk end; only
        // `<<<` fences span chunks.
        self.finish_pending(&mut result);

        if self.partial.contains("->pty:ready") {
            self.partial = self.partial.replace("->pty:ready", "");
            result.ready_signal = true;
        }

        result.is_idle = result.ready_signal || self.check_for_prompt();
        result
    }

    /// Clear all carried state. Used when the terminal session resets.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.fence = None;
        self.pending = None;
        self.in_code_fence = false;
        self.last_line.clear();
    }

    fn handle_line(&mut self, line: &str, result: &mut ParseResult) {
        if !line.trim().is_empty() {
            self.last_line = line.to_string();
        }

        if line.contains("->pty:ready") {
            result.ready_signal = true;
            return;
        }

        // Markdown code fences hide command-looking text.
        if line.trim_start().starts_with("```") {
            self.in_code_fence = !self.in_code_fence;
            self.finish_pending(result);
            return;
        }
        if self.in_code_fence {
            return;
        }

        // An open `<<<` fence swallows lines until `>>>`.
        if self.fence.is_some() {
            self.feed_fence(line, result);
            return;
        }

        if let Some(caps) = relay_pattern().captures(line) {
            self.finish_pending(result);
            let target = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
            self.handle_relay_start(&target, &rest, line, result);
            return;
        }

        if let Some(caps) = continuity_pattern().captures(line) {
            self.finish_pending(result);
            let action = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim().to_string();
            if let Some(stripped) = rest.strip_prefix("<<<") {
                self.fence = Some(Fence {
                    kind: FenceKind::Continuity { action },
                    lines: if stripped.trim().is_empty() {
                        Vec::new()
                    } else {
                        vec![stripped.trim().to_string()]
                    },
                    raw: vec![line.to_string()],
                });
            } else {
                result.continuity.push(ContinuityCommand {
                    action,
                    content: rest,
                });
            }
            return;
        }

        // Continuation joining: indented text extends the previous command
        // until a blank line, bullet, or prompt.
        if self.pending.is_some() {
            let is_continuation = (line.starts_with(' ') || line.starts_with('\t'))
                && !line.trim().is_empty()
                && !is_bullet(line)
                && !self.prompt.is_match(line);
            if is_continuation {
                if let Some(pending) = self.pending.as_mut() {
                    pending.lines.push(line.trim().to_string());
                    pending.raw.push(line.to_string());
                }
                return;
            }
            self.finish_pending(result);
        }
    }

    fn handle_relay_start(
        &mut self,
        target: &str,
        rest: &str,
        line: &str,
        result: &mut ParseResult,
    ) {
        match target {
            "spawn" => {
                let rest = rest.trim();
                if let Some(stripped) = rest.strip_suffix("<<<").map(str::trim) {
                    // `->relay:spawn name cli <<<` with the task fenced.
                    if let Some(caps) = spawn_pattern().captures(stripped) {
                        self.fence = Some(Fence {
                            kind: FenceKind::Spawn {
                                name: caps[1].to_string(),
                                cli: caps[2].to_string(),
                            },
                            lines: Vec::new(),
                            raw: vec![line.to_string()],
                        });
                    } else {
                        warn!("unparseable spawn command: {}", line);
                    }
                    return;
                }
                match spawn_pattern().captures(rest) {
                    Some(caps) => {
                        let cmd = RelayCommand::Spawn {
                            from: self.agent.clone(),
                            name: caps[1].to_string(),
                            cli: caps[2].to_string(),
                            task: caps.get(3).map(|m| m.as_str()).unwrap_or("").to_string(),
                            raw: line.to_string(),
                        };
                        debug!(agent = %self.agent, "parsed spawn command");
                        result.commands.push(cmd);
                    }
                    None => warn!("unparseable spawn command: {}", line),
                }
            }
            "release" => {
                let name = rest.trim();
                if name.is_empty() {
                    warn!("release command without a name");
                    return;
                }
                result.commands.push(RelayCommand::Release {
                    from: self.agent.clone(),
                    name: name.to_string(),
                    raw: line.to_string(),
                });
            }
            _ => {
                if placeholder_pattern().is_match(target) {
                    // Template text the agent never substituted.
                    warn!(agent = %self.agent, "placeholder target rejected: {}", target);
                    result.rejected.push(target.to_string());
                    return;
                }
                let rest = rest.trim();
                if let Some(stripped) = rest.strip_prefix("<<<") {
                    let stripped = stripped.trim();
                    // Same-line close: `->relay:Bob <<<body>>>`.
                    if let Some(body) = stripped.strip_suffix(">>>") {
                        self.emit_message(
                            target.to_string(),
                            body.trim().to_string(),
                            line.to_string(),
                            result,
                        );
                    } else {
                        self.fence = Some(Fence {
                            kind: FenceKind::Message {
                                target: target.to_string(),
                            },
                            lines: if stripped.is_empty() {
                                Vec::new()
                            } else {
                                vec![stripped.to_string()]
                            },
                            raw: vec![line.to_string()],
                        });
                    }
                } else {
                    self.pending = Some(PendingMessage {
                        target: target.to_string(),
                        lines: vec![rest.to_string()],
                        raw: vec![line.to_string()],
                    });
                }
            }
        }
    }

    fn feed_fence(&mut self, line: &str, result: &mut ParseResult) {
        let Some(fence) = self.fence.as_mut() else {
            return;
        };
        fence.raw.push(line.to_string());

        if let Some(pos) = line.find(">>>") {
            let head = line[..pos].trim_end();
            if !head.is_empty() {
                fence.lines.push(head.to_string());
            }
            let fence = match self.fence.take() {
                Some(f) => f,
                None => return,
            };
            let body = fence.lines.join("\n").trim().to_string();
            let raw = fence.raw.join("\n");
            match fence.kind {
                FenceKind::Message { target } => {
                    self.emit_message(target, body, raw, result);
                }
                FenceKind::Spawn { name, cli } => {
                    result.commands.push(RelayCommand::Spawn {
                        from: self.agent.clone(),
                        name,
                        cli,
                        task: body,
                        raw,
                    });
                }
                FenceKind::Continuity { action } => {
                    result.continuity.push(ContinuityCommand {
                        action,
                        content: body,
                    });
                }
            }
            return;
        }

        fence.lines.push(line.to_string());
        if fence.lines.len() > FENCE_MAX_LINES {
            warn!("fenced command exceeded {} lines, dropping", FENCE_MAX_LINES);
            self.fence = None;
        }
    }

    fn finish_pending(&mut self, result: &mut ParseResult) {
        if let Some(pending) = self.pending.take() {
            let body = pending.lines.join(" ").trim().to_string();
            if body.is_empty() {
                return;
            }
            let raw = pending.raw.join("\n");
            self.emit_message(pending.target, body, raw, result);
        }
    }

    fn emit_message(
        &mut self,
        target: String,
        body: String,
        raw: String,
        result: &mut ParseResult,
    ) {
        let (body, thread, importance, reply_to) = extract_meta(&body);
        if body.is_empty() {
            return;
        }

        // Echoes of a command the CLI re-renders must not send twice.
        let prefix: String = body.chars().take(DEDUP_BODY_PREFIX).collect();
        let key = format!("{}|{}", target, prefix);
        if self.echo_dedup.check(&key) {
            debug!(target = %target, "echoed command suppressed");
            return;
        }

        debug!(agent = %self.agent, target = %target, "parsed relay command");
        result.commands.push(RelayCommand::Message {
            from: self.agent.clone(),
            to: target,
            body,
            thread,
            importance,
            reply_to,
            raw,
        });
    }

    fn check_for_prompt(&self) -> bool {
        let candidate = if self.partial.trim().is_empty() {
            self.last_line.as_str()
        } else {
            self.partial.as_str()
        };
        if self.prompt.is_match(candidate) {
            return true;
        }
        let trimmed = candidate.trim_start();
        ["> ", "$ ", ">>> ", "codex> ", "› "]
            .iter()
            .any(|p| trimmed.ends_with(p))
    }
}

fn is_bullet(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("• ")
}

/// Pull a trailing `[k=v ...]` meta segment off a body.
fn extract_meta(body: &str) -> (String, Option<String>, Option<u8>, Option<String>) {
    let Some(caps) = meta_pattern().captures(body) else {
        return (body.to_string(), None, None, None);
    };
    let inner = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let mut thread = None;
    let mut importance = None;
    let mut reply_to = None;
    let mut recognized = false;
    for token in inner.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "thread" => {
                thread = Some(value.to_string());
                recognized = true;
            }
            "importance" => {
                importance = value.parse::<u8>().ok();
                recognized = importance.is_some();
            }
            "reply_to" | "reply-to" => {
                reply_to = Some(value.to_string());
                recognized = true;
            }
            _ => {}
        }
    }
    if !recognized {
        // Trailing brackets that aren't meta stay part of the body.
        return (body.to_string(), None, None, None);
    }
    let stripped = meta_pattern().replace(body, "").trim().to_string();
    (stripped, thread, importance, reply_to)
}
