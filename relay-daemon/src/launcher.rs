//! Launcher seam for SPAWN/RELEASE.
//!
//! The daemon owns no subprocess management beyond calling this interface.
//! The default implementation wraps the requested CLI in `relay-pty`; tests
//! substitute a recording launcher.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{info, warn};

/// What SPAWN asks for.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub name: String,
    pub cli: String,
    pub task: Option<String>,
    pub cwd: Option<String>,
    pub team: Option<String>,
    pub shadow_of: Option<String>,
}

/// What a successful spawn reports back.
#[derive(Debug, Clone)]
pub struct Spawned {
    pub pid: Option<u32>,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("no launcher configured")]
    Unavailable,
    #[error("agent {0} is already managed")]
    AlreadyManaged(String),
    #[error("agent {0} is not managed by this launcher")]
    NotManaged(String),
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

pub trait Launcher: Send + Sync {
    fn spawn(&self, spec: SpawnSpec) -> Result<Spawned, LauncherError>;
    fn release(&self, name: &str) -> Result<(), LauncherError>;
}

/// Refuses everything; used when the daemon runs without spawn support.
pub struct NullLauncher;

impl Launcher for NullLauncher {
    fn spawn(&self, _spec: SpawnSpec) -> Result<Spawned, LauncherError> {
        Err(LauncherError::Unavailable)
    }

    fn release(&self, _name: &str) -> Result<(), LauncherError> {
        Err(LauncherError::Unavailable)
    }
}

/// Spawns agents as detached `relay-pty` children wrapping the requested CLI.
pub struct CommandLauncher {
    wrapper_bin: String,
    socket_path: PathBuf,
    children: Mutex<HashMap<String, u32>>,
}

impl CommandLauncher {
    pub fn new(wrapper_bin: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            wrapper_bin: wrapper_bin.into(),
            socket_path: socket_path.into(),
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Launcher for CommandLauncher {
    fn spawn(&self, spec: SpawnSpec) -> Result<Spawned, LauncherError> {
        {
            let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
            if children.contains_key(&spec.name) {
                return Err(LauncherError::AlreadyManaged(spec.name));
            }
        }

        let mut cmd = Command::new(&self.wrapper_bin);
        cmd.arg("--name")
            .arg(&spec.name)
            .arg("--daemon-socket")
            .arg(&self.socket_path)
            .arg("--cli")
            .arg(&spec.cli);
        if let Some(task) = &spec.task {
            cmd.arg("--task").arg(task);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.arg("--").arg(&spec.cli);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn()?;
        let pid = child.id();
        info!(agent = %spec.name, pid, cli = %spec.cli, "spawned wrapper");

        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.insert(spec.name.clone(), pid);
        Ok(Spawned {
            pid: Some(pid),
            name: spec.name,
        })
    }

    fn release(&self, name: &str) -> Result<(), LauncherError> {
        let pid = {
            let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
            children
                .remove(name)
                .ok_or_else(|| LauncherError::NotManaged(name.to_string()))?
        };
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(agent = %name, pid, "release kill failed: {}", e);
        }
        info!(agent = %name, pid, "released");
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Records spawn/release calls for router tests.
    #[derive(Default)]
    pub struct RecordingLauncher {
        pub spawned: Mutex<Vec<SpawnSpec>>,
        pub released: Mutex<Vec<String>>,
    }

    impl Launcher for RecordingLauncher {
        fn spawn(&self, spec: SpawnSpec) -> Result<Spawned, LauncherError> {
            let name = spec.name.clone();
            self.spawned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(spec);
            Ok(Spawned {
                pid: Some(4242),
                name,
            })
        }

        fn release(&self, name: &str) -> Result<(), LauncherError> {
            self.released
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(name.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingLauncher;
    use super::*;

    #[test]
    fn test_null_launcher_refuses() {
        let launcher = NullLauncher;
        assert!(matches!(
            launcher.spawn(SpawnSpec {
                name: "X".to_string(),
                cli: "claude".to_string(),
                task: None,
                cwd: None,
                team: None,
                shadow_of: None,
            }),
            Err(LauncherError::Unavailable)
        ));
        assert!(matches!(
            launcher.release("X"),
            Err(LauncherError::Unavailable)
        ));
    }

    #[test]
    fn test_recording_launcher_round_trip() {
        let launcher = RecordingLauncher::default();
        let spawned = launcher
            .spawn(SpawnSpec {
                name: "Worker".to_string(),
                cli: "codex".to_string(),
                task: Some("build".to_string()),
                cwd: None,
                team: None,
                shadow_of: None,
            })
            .unwrap();
        assert_eq!(spawned.name, "Worker");
        launcher.release("Worker").unwrap();
        assert_eq!(launcher.spawned.lock().unwrap().len(), 1);
        assert_eq!(launcher.released.lock().unwrap()[0], "Worker");
    }
}
