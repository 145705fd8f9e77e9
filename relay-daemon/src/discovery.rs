//! Socket path discovery.
//!
//! Priority order: explicit flag, `AGENT_RELAY_SOCKET` env override, the
//! cloud workspace sub-path (`AGENT_RELAY_WORKSPACE`), the project-local
//! `.agent-relay/relay.sock`, the legacy tmp fallback, and finally a
//! home-directory fallback.

use std::path::{Path, PathBuf};

const LEGACY_TMP_SOCKET: &str = "/tmp/agent-relay.sock";

/// Candidate socket paths in priority order, for the current directory.
pub fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = explicit {
        out.push(p.to_path_buf());
    }
    if let Some(p) = env_path("AGENT_RELAY_SOCKET") {
        out.push(p);
    }
    if let Ok(ws) = std::env::var("AGENT_RELAY_WORKSPACE") {
        let ws = ws.trim();
        if !ws.is_empty() {
            out.push(PathBuf::from(format!("/tmp/agent-relay/{}/relay.sock", ws)));
        }
    }
    out.push(PathBuf::from(".agent-relay/relay.sock"));
    out.push(PathBuf::from(LEGACY_TMP_SOCKET));
    if let Some(home) = env_path("HOME") {
        out.push(home.join(".agent-relay/relay.sock"));
    }
    out
}

/// Path the daemon should bind: the first candidate.
pub fn bind_path(explicit: Option<&Path>) -> PathBuf {
    candidates(explicit)
        .into_iter()
        .next()
        .unwrap_or_else(|| PathBuf::from(LEGACY_TMP_SOCKET))
}

/// Path a client should connect to: the first candidate whose socket file
/// exists, falling back to the project-local default.
pub fn connect_path(explicit: Option<&Path>) -> PathBuf {
    let cands = candidates(explicit);
    for c in &cands {
        if c.exists() {
            return c.clone();
        }
    }
    cands
        .into_iter()
        .next()
        .unwrap_or_else(|| PathBuf::from(LEGACY_TMP_SOCKET))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_wins() {
        let p = bind_path(Some(Path::new("/tmp/explicit.sock")));
        assert_eq!(p, PathBuf::from("/tmp/explicit.sock"));
    }

    #[test]
    fn test_candidate_order_ends_with_fallbacks() {
        let cands = candidates(None);
        let tail: Vec<String> = cands
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        assert!(tail.iter().any(|p| p.ends_with(".agent-relay/relay.sock")));
        assert!(tail.iter().any(|p| p == LEGACY_TMP_SOCKET));
    }

    #[test]
    fn test_connect_falls_back_when_nothing_exists() {
        let p = connect_path(Some(Path::new("/nonexistent/dir/x.sock")));
        assert_eq!(p, PathBuf::from("/nonexistent/dir/x.sock"));
    }
}
