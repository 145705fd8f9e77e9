//! Channel store: definitions round-trip across restarts.
//!
//! A small keyed JSON file next to the socket. Written whole on every
//! mutation through a temp file rename so a crash never leaves a torn file.

use crate::registry::Channel;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize, Default)]
struct StoreFile {
    channels: Vec<Channel>,
}

#[derive(Debug)]
pub struct ChannelStore {
    path: PathBuf,
}

impl ChannelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted channel definitions; an absent file is an empty store.
    pub fn load(&self) -> Result<Vec<Channel>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .context(format!("read channel store {:?}", self.path))?;
        match serde_json::from_str::<StoreFile>(&raw) {
            Ok(file) => {
                debug!(count = file.channels.len(), "channel store loaded");
                Ok(file.channels)
            }
            Err(e) => {
                // A corrupt store should not keep the daemon down.
                warn!("channel store unreadable, starting empty: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Persist the full channel set.
    pub fn save<'a>(&self, channels: impl Iterator<Item = &'a Channel>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("create store directory {:?}", parent))?;
        }
        let file = StoreFile {
            channels: channels.cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file).context("serialize channel store")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).context(format!("write channel store {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path).context("commit channel store")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::envelope::Visibility;
    use std::collections::HashSet;

    fn channel(name: &str, members: &[&str]) -> Channel {
        Channel {
            name: name.to_string(),
            visibility: Visibility::Public,
            members: members.iter().map(|m| m.to_string()).collect::<HashSet<_>>(),
            archived: false,
            created_by: "Alice".to_string(),
            created_at_ms: 1,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChannelStore::new(dir.path().join("channels.json"));

        let channels = vec![channel("#general", &["Alice", "Bob"]), channel("#ops", &[])];
        store.save(channels.iter()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        let general = loaded.iter().find(|c| c.name == "#general").unwrap();
        assert!(general.members.contains("Alice"));
        assert!(general.members.contains("Bob"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChannelStore::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = ChannelStore::new(path);
        assert!(store.load().unwrap().is_empty());
    }
}
