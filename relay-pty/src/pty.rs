//! PTY (pseudo-terminal) management for spawning and communicating with agents.
//!
//! Provides a clean interface for:
//! - Creating a PTY and spawning a child process
//! - Bridging the master fd onto async channels (readiness-driven, no threads)
//! - Handling terminal resize (SIGWINCH) and raw-mode passthrough
//! - Terminating the child and reporting how it actually exited

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvp, fork, setsid, ForkResult, Pid};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, Winsize);
nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

/// SIGTERM grace window before escalating to SIGKILL.
const TERM_GRACE_STEP: Duration = Duration::from_millis(50);
const TERM_GRACE_STEPS: u32 = 40;

/// Original terminal settings, restored on shutdown.
static SAVED_TERMIOS: OnceLock<Mutex<Option<Termios>>> = OnceLock::new();

fn saved_termios() -> &'static Mutex<Option<Termios>> {
    SAVED_TERMIOS.get_or_init(|| Mutex::new(None))
}

/// Terminal state of the wrapped child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal exit with a status code.
    Code(i32),
    /// Killed by a signal.
    Signal(i32),
}

impl ChildExit {
    /// Shell-style exit code: 128 + signal number for signal deaths.
    pub fn code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::Signal(sig) => 128 + sig,
        }
    }
}

impl From<WaitStatus> for ChildExit {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Code(code),
            WaitStatus::Signaled(_, sig, _) => Self::Signal(sig as i32),
            _ => Self::Code(-1),
        }
    }
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// PTY handle for one spawned child.
pub struct Pty {
    master: OwnedFd,
    child: Pid,
    alive: Arc<AtomicBool>,
    /// Exit recorded once the child has been reaped; makes reaping
    /// idempotent across try_wait/terminate/Drop.
    reaped: Option<ChildExit>,
}

impl Pty {
    /// Open a PTY pair and spawn the command on the slave side.
    /// Rows/cols override terminal detection for headless mode.
    pub fn spawn(command: &[String], rows: Option<u16>, cols: Option<u16>) -> Result<Self> {
        let Some(argv0) = command.first() else {
            anyhow::bail!("command cannot be empty");
        };

        let size = match (rows, cols) {
            (Some(r), Some(c)) => winsize(r, c),
            _ => current_winsize().unwrap_or_else(|| winsize(24, 80)),
        };
        let OpenptyResult { master, slave } =
            openpty(&size, None).context("failed to open PTY")?;

        match unsafe { fork() }.context("failed to fork")? {
            ForkResult::Parent { child } => {
                drop(slave);
                set_nonblocking(&master).context("failed to unblock PTY master")?;
                info!(pid = child.as_raw(), cmd = %argv0, "child started on PTY");
                Ok(Self {
                    master,
                    child,
                    alive: Arc::new(AtomicBool::new(true)),
                    reaped: None,
                })
            }
            ForkResult::Child => exec_child(slave, command),
        }
    }

    /// Raw pid for /proc inspection.
    pub fn child_pid_raw(&self) -> i32 {
        self.child.as_raw()
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_tty() -> bool {
        nix::unistd::isatty(libc::STDIN_FILENO).unwrap_or(false)
    }

    /// Put stdin into raw mode for transparent passthrough.
    /// Returns Ok(false) when stdin is not a TTY (headless mode).
    pub fn set_raw_mode() -> Result<bool> {
        if !Self::is_tty() {
            debug!("stdin is not a TTY, skipping raw mode (headless)");
            return Ok(false);
        }

        let stdin = std::io::stdin();
        let original = termios::tcgetattr(stdin.as_fd()).context("tcgetattr failed")?;
        if let Ok(mut saved) = saved_termios().lock() {
            saved.get_or_insert(original.clone());
        }

        let mut raw = original;
        raw.local_flags.remove(
            LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN,
        );
        raw.input_flags.remove(InputFlags::IXON | InputFlags::ICRNL);
        raw.output_flags.remove(OutputFlags::OPOST);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw).context("tcsetattr failed")?;

        debug!("terminal set to raw mode");
        Ok(true)
    }

    /// Restore the pre-raw terminal settings, if any were saved.
    pub fn restore_terminal() {
        let stdin = std::io::stdin();
        if let Ok(saved) = saved_termios().lock() {
            if let Some(original) = saved.as_ref() {
                let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, original);
                debug!("terminal restored");
            }
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let size = winsize(rows, cols);
        unsafe { tiocswinsz(self.master.as_raw_fd(), &size) }
            .context("failed to resize PTY")?;
        debug!("PTY resized to {}x{}", cols, rows);
        Ok(())
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        Ok(signal::kill(self.child, sig)?)
    }

    /// Non-blocking reap probe. Records the exit so later calls are cheap.
    pub fn try_wait(&mut self) -> Option<ChildExit> {
        if let Some(exit) = self.reaped {
            return Some(exit);
        }
        let exit = match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return None,
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => status.into(),
            Ok(_) => return None,
            // Someone else reaped it; nothing more to learn.
            Err(Errno::ECHILD) => ChildExit::Code(0),
            Err(_) => return None,
        };
        self.record_exit(exit);
        Some(exit)
    }

    /// Terminate the child and report how it died: SIGTERM, a short grace
    /// window of reap probes, then SIGKILL and a blocking reap.
    pub fn terminate(&mut self) -> Option<ChildExit> {
        if let Some(exit) = self.try_wait() {
            return Some(exit);
        }

        let _ = signal::kill(self.child, Signal::SIGTERM);
        for _ in 0..TERM_GRACE_STEPS {
            std::thread::sleep(TERM_GRACE_STEP);
            if let Some(exit) = self.try_wait() {
                return Some(exit);
            }
        }

        let _ = signal::kill(self.child, Signal::SIGKILL);
        let exit = match waitpid(self.child, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => status.into(),
            _ => ChildExit::Signal(libc::SIGKILL),
        };
        self.record_exit(exit);
        Some(exit)
    }

    fn record_exit(&mut self, exit: ChildExit) {
        self.alive.store(false, Ordering::SeqCst);
        self.reaped = Some(exit);
        debug!(code = exit.code(), "child reaped");
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        // Unreaped child: the terminal is going away. Best-effort HUP plus
        // a non-blocking reap; terminate() is the orderly path.
        if self.reaped.is_none() {
            let _ = signal::kill(self.child, Signal::SIGHUP);
            let _ = waitpid(self.child, Some(WaitPidFlag::WNOHANG));
        }
    }
}

/// Child-side half of `spawn`: wire the slave fd up as the controlling
/// terminal and exec. Never returns.
fn exec_child(slave: OwnedFd, command: &[String]) -> ! {
    let _ = setsid();
    let _ = unsafe { tiocsctty(slave.as_raw_fd(), 0) };

    for stdio in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        let _ = dup2(slave.as_raw_fd(), stdio);
    }
    if slave.as_raw_fd() > 2 {
        drop(slave);
    }

    let argv: Vec<CString> = command
        .iter()
        .filter_map(|arg| CString::new(arg.as_str()).ok())
        .collect();
    if let Some(program) = argv.first() {
        let _ = execvp(program, &argv);
    }
    // exec only returns on failure; nothing sane to do but vanish.
    std::process::exit(127);
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Current size of the controlling terminal, if there is one.
pub fn current_winsize() -> Option<Winsize> {
    let mut size = winsize(0, 0);
    unsafe { tiocgwinsz(libc::STDOUT_FILENO, &mut size) }.ok()?;
    (size.ws_row > 0 || size.ws_col > 0).then_some(size)
}

/// Async bridge over the PTY.
///
/// One task drives both directions off fd readiness (`AsyncFd`), matching
/// the channel-based style of the rest of the wrapper; partial writes stay
/// pending until the master signals writable again.
pub struct AsyncPty {
    pty: Pty,
    output_rx: mpsc::Receiver<Vec<u8>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    io_task: JoinHandle<()>,
}

impl AsyncPty {
    pub fn new(pty: Pty) -> Result<Self> {
        // The bridge gets its own dup of the master so resize/ioctl on the
        // original never race the reactor registration.
        let bridge_fd = pty.master.try_clone().context("failed to dup PTY master")?;
        let master = AsyncFd::new(bridge_fd).context("failed to register PTY with reactor")?;

        let (output_tx, output_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);
        let alive = Arc::clone(&pty.alive);
        let io_task = tokio::spawn(io_loop(master, input_rx, output_tx, alive));

        Ok(Self {
            pty,
            output_rx,
            input_tx,
            io_task,
        })
    }

    /// Receive output from the child; None when the PTY closes.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    /// Queue input for the child.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| anyhow::anyhow!("PTY channel closed"))
    }

    pub fn is_running(&self) -> bool {
        self.pty.is_running()
    }

    pub fn child_pid_raw(&self) -> i32 {
        self.pty.child_pid_raw()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.pty.resize(rows, cols)
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        self.pty.signal(sig)
    }

    /// Stop the bridge, terminate the child, and report how it exited.
    pub fn shutdown(&mut self) -> Option<ChildExit> {
        self.io_task.abort();
        self.pty.terminate()
    }
}

impl Drop for AsyncPty {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Readiness-driven pump between the PTY master and the async channels.
async fn io_loop(
    master: AsyncFd<OwnedFd>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    output_tx: mpsc::Sender<Vec<u8>>,
    alive: Arc<AtomicBool>,
) {
    let mut read_buf = [0u8; 4096];
    let mut pending: Option<(Vec<u8>, usize)> = None;

    loop {
        tokio::select! {
            ready = master.readable() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(_) => break,
                };
                match guard.try_io(|fd| {
                    nix::unistd::read(fd.get_ref().as_raw_fd(), &mut read_buf)
                        .map_err(errno_to_io)
                }) {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        if output_tx.send(read_buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        // EIO is the PTY's way of saying the child hung up.
                        if e.raw_os_error() != Some(libc::EIO) {
                            error!("PTY read failed: {}", e);
                        }
                        break;
                    }
                    // Spurious readiness; wait again.
                    Err(_) => {}
                }
            }

            chunk = input_rx.recv(), if pending.is_none() => {
                match chunk {
                    Some(data) => pending = Some((data, 0)),
                    None => break,
                }
            }

            ready = master.writable(), if pending.is_some() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(_) => break,
                };
                let Some((data, offset)) = pending.as_mut() else {
                    continue;
                };
                let at = *offset;
                match guard.try_io(|fd| {
                    nix::unistd::write(fd.get_ref(), &data[at..]).map_err(errno_to_io)
                }) {
                    Ok(Ok(written)) => {
                        *offset += written;
                        if *offset >= data.len() {
                            pending = None;
                        }
                    }
                    Ok(Err(e)) => {
                        error!("PTY write failed: {}", e);
                        break;
                    }
                    Err(_) => {}
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    debug!("PTY bridge ended");
}

fn errno_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_child_exit_codes() {
        assert_eq!(ChildExit::Code(0).code(), 0);
        assert_eq!(ChildExit::Code(3).code(), 3);
        assert_eq!(ChildExit::Signal(libc::SIGTERM).code(), 143);
        assert_eq!(ChildExit::Signal(libc::SIGKILL).code(), 137);
    }

    #[test]
    fn test_current_winsize_smoke() {
        // May be None in CI without a terminal; both outcomes are fine.
        if let Some(ws) = current_winsize() {
            assert!(ws.ws_row > 0 || ws.ws_col > 0);
        }
    }

    #[tokio::test]
    async fn test_spawn_echo_round_trip() {
        let pty = Pty::spawn(&["cat".to_string()], Some(24), Some(80)).unwrap();
        assert!(pty.child_pid_raw() > 0);

        let mut bridge = AsyncPty::new(pty).unwrap();
        bridge.send(b"hello pty\n".to_vec()).await.unwrap();

        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), bridge.recv()).await {
                Ok(Some(chunk)) => {
                    collected.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&collected).contains("hello pty") {
                        break;
                    }
                }
                _ => {}
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hello pty"));

        // cat dies to the SIGTERM in the grace window.
        let exit = bridge.shutdown().expect("exit status");
        assert_eq!(exit, ChildExit::Signal(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_natural_exit_reports_code() {
        let pty = Pty::spawn(
            &["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
            Some(24),
            Some(80),
        )
        .unwrap();
        let mut bridge = AsyncPty::new(pty).unwrap();

        // Drain until the PTY reports the child is gone.
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), bridge.recv()).await {
                Ok(None) => break,
                Ok(Some(_)) => {}
                Err(_) => {
                    if !bridge.is_running() {
                        break;
                    }
                }
            }
        }

        let exit = bridge.shutdown().expect("exit status");
        assert_eq!(exit, ChildExit::Code(7));
    }
}
