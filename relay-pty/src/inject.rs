//! Injection logic for delivering messages to the agent.
//!
//! Handles:
//! - Idle gating (URGENT messages may bypass)
//! - Formatting and CLI-specific quirks (bracketed paste, Gemini backticks)
//! - Writing to the PTY, ENTER after a short delay
//! - Echo verification with retries and a late-appearance re-check
//! - An adaptive throttle between messages

use crate::idle::IdleDetector;
use crate::protocol::{CliKind, Config, Priority, QueuedMessage};
use crate::queue::MessageQueue;
use anyhow::Result;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Throttle floor/start/ceiling in milliseconds.
const THROTTLE_MIN_MS: u64 = 20;
const THROTTLE_START_MS: u64 = 100;
const THROTTLE_MAX_MS: u64 = 500;
/// How long to keep waiting for an idle window before pushing through.
const IDLE_WAIT_MAX: Duration = Duration::from_secs(10);
/// Poll cadence while waiting for idle or verifying.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bracketed paste delimiters.
const PASTE_BEGIN: &str = "\x1b[200~";
const PASTE_END: &str = "\x1b[201~";

/// Outcome reported to the orchestrator per message.
#[derive(Debug)]
pub enum InjectOutcome {
    Delivered(QueuedMessage),
    Failed { msg: QueuedMessage, error: String },
    /// Dropped without injection (e.g. bare shell prompt under Gemini).
    Skipped { msg: QueuedMessage, reason: String },
}

/// Counters surfaced through the daemon's METRICS relay.
#[derive(Debug, Default)]
pub struct InjectMetrics {
    pub total: AtomicU64,
    pub success_first_try: AtomicU64,
    pub success_with_retry: AtomicU64,
    pub failed: AtomicU64,
}

impl InjectMetrics {
    pub fn success_rate(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        let ok = self.success_first_try.load(Ordering::Relaxed)
            + self.success_with_retry.load(Ordering::Relaxed);
        ok as f64 / total as f64
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.success_first_try.load(Ordering::Relaxed),
            self.success_with_retry.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

pub struct Injector {
    pty_tx: mpsc::Sender<Vec<u8>>,
    queue: Arc<MessageQueue>,
    detector: Arc<StdMutex<IdleDetector>>,
    config: Config,
    /// Visible output since the last clear, for echo verification.
    recent_output: Mutex<String>,
    current_delay_ms: AtomicU64,
    consecutive_failures: AtomicU32,
    pub metrics: InjectMetrics,
    outcome_tx: mpsc::Sender<InjectOutcome>,
}

impl Injector {
    pub fn new(
        pty_tx: mpsc::Sender<Vec<u8>>,
        queue: Arc<MessageQueue>,
        detector: Arc<StdMutex<IdleDetector>>,
        config: Config,
        outcome_tx: mpsc::Sender<InjectOutcome>,
    ) -> Self {
        Self {
            pty_tx,
            queue,
            detector,
            config,
            recent_output: Mutex::new(String::new()),
            current_delay_ms: AtomicU64::new(THROTTLE_START_MS),
            consecutive_failures: AtomicU32::new(0),
            metrics: InjectMetrics::default(),
            outcome_tx,
        }
    }

    /// Record terminal output for verification and bare-prompt checks.
    pub async fn record_output(&self, output: &str) {
        let mut recent = self.recent_output.lock().await;
        recent.push_str(output);
        if recent.len() > 10_000 {
            let cut = recent.len() - 10_000;
            *recent = recent[cut..].to_string();
        }
    }

    pub fn current_delay_ms(&self) -> u64 {
        self.current_delay_ms.load(Ordering::Relaxed)
    }

    /// Consume the queue forever.
    pub async fn run(&self) -> Result<()> {
        info!("injection loop started");
        loop {
            let msg = self.queue.wait_and_dequeue().await;
            debug!(id = %msg.id, priority = ?msg.priority, "processing message");

            // Adaptive throttle between messages.
            let delay = self.current_delay_ms.load(Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.metrics.total.fetch_add(1, Ordering::Relaxed);
            match self.inject_one(&msg).await {
                InjectAttempt::Delivered { retried } => {
                    if retried {
                        self.metrics.success_with_retry.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.metrics.success_first_try.fetch_add(1, Ordering::Relaxed);
                    }
                    self.on_success();
                    let _ = self.outcome_tx.send(InjectOutcome::Delivered(msg)).await;
                }
                InjectAttempt::Retry => {
                    // Partial credit against the total: the retry will count
                    // itself when it comes back around.
                    self.metrics.total.fetch_sub(1, Ordering::Relaxed);
                    self.on_failure();
                    let retry_in = self.config.retry_delay_ms * (msg.retries as u64 + 1);
                    warn!(
                        id = %msg.id,
                        attempt = msg.retries + 1,
                        "verification missed, retrying in {}ms",
                        retry_in
                    );
                    tokio::time::sleep(Duration::from_millis(retry_in)).await;
                    self.queue.retry(msg).await;
                }
                InjectAttempt::Failed(error) => {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    self.on_failure();
                    error!(id = %msg.id, "injection failed: {}", error);
                    let _ = self
                        .outcome_tx
                        .send(InjectOutcome::Failed { msg, error })
                        .await;
                }
                InjectAttempt::Skipped(reason) => {
                    self.metrics.total.fetch_sub(1, Ordering::Relaxed);
                    let _ = self
                        .outcome_tx
                        .send(InjectOutcome::Skipped { msg, reason })
                        .await;
                }
            }
        }
    }

    async fn inject_one(&self, msg: &QueuedMessage) -> InjectAttempt {
        // URGENT bypasses the idle gate; everyone else waits for a window.
        if msg.priority != Priority::Urgent {
            self.wait_for_idle().await;
        }

        if self.config.cli == CliKind::Gemini {
            let bare = self
                .detector
                .lock()
                .map(|d| d.at_bare_shell_prompt())
                .unwrap_or(false);
            if bare {
                return InjectAttempt::Skipped("bare shell prompt".to_string());
            }
        }

        let mut formatted = msg.format_for_injection();
        if self.config.cli.backtick_body() && !formatted.contains('`') {
            formatted = format!("`{}`", formatted);
        }
        let formatted = crate::parser::sanitize_for_injection(&formatted);

        // Reset the verification window right before the write so the echo
        // search only sees post-write output.
        {
            let mut recent = self.recent_output.lock().await;
            recent.clear();
        }

        debug!(id = %msg.id, "injecting: {}", formatted);
        let payload = if self.config.cli.bracketed_paste() {
            format!("{}{}{}", PASTE_BEGIN, formatted, PASTE_END)
        } else {
            formatted.clone()
        };
        if self
            .pty_tx
            .send(payload.into_bytes())
            .await
            .is_err()
        {
            return InjectAttempt::Failed("PTY channel closed".to_string());
        }
        tokio::time::sleep(Duration::from_millis(self.config.enter_delay_ms)).await;
        if self.pty_tx.send(b"\r".to_vec()).await.is_err() {
            return InjectAttempt::Failed("PTY channel closed".to_string());
        }

        if let Ok(mut detector) = self.detector.lock() {
            detector.mark_injected();
        }

        if self.config.skip_verification {
            // Raw PTYs where the child does not echo input: trust the write.
            return InjectAttempt::Delivered {
                retried: msg.retries > 0,
            };
        }

        let marker = msg.verification_marker();
        if self.verify(&marker).await {
            return InjectAttempt::Delivered {
                retried: msg.retries > 0,
            };
        }

        // Race check: the echo can land between the last poll and here.
        if self.recent_output.lock().await.contains(&marker) {
            return InjectAttempt::Delivered {
                retried: msg.retries > 0,
            };
        }

        if msg.retries < self.config.max_retries {
            InjectAttempt::Retry
        } else {
            InjectAttempt::Failed(format!(
                "echo not observed after {} attempts",
                msg.retries + 1
            ))
        }
    }

    /// Poll until the idle gate opens or the wait ceiling passes; timing
    /// out proceeds anyway, matching terminals that accept input mid-burst.
    async fn wait_for_idle(&self) {
        let start = Instant::now();
        while start.elapsed() < IDLE_WAIT_MAX {
            let idle = self
                .detector
                .lock()
                .map(|d| d.ready_for_injection())
                .unwrap_or(true);
            if idle {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        warn!("idle window never opened, injecting anyway");
    }

    /// Poll the captured output for the echo marker.
    async fn verify(&self, marker: &str) -> bool {
        let deadline = Instant::now() + Duration::from_millis(self.config.verification_timeout_ms);
        while Instant::now() < deadline {
            if self.recent_output.lock().await.contains(marker) {
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        false
    }

    /// Success decays the throttle toward the floor.
    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let delay = self.current_delay_ms.load(Ordering::Relaxed);
        let next = ((delay as f64) * 0.8) as u64;
        self.current_delay_ms
            .store(next.max(THROTTLE_MIN_MS), Ordering::Relaxed);
    }

    /// Two consecutive failures grow the throttle by 1.5x up to the cap.
    fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= 2 {
            let delay = self.current_delay_ms.load(Ordering::Relaxed);
            let next = ((delay as f64) * 1.5) as u64;
            self.current_delay_ms
                .store(next.min(THROTTLE_MAX_MS), Ordering::Relaxed);
        }
    }
}

enum InjectAttempt {
    Delivered { retried: bool },
    Retry,
    Failed(String),
    Skipped(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::IdleConfig;

    fn make_injector(config: Config) -> (Arc<Injector>, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<InjectOutcome>) {
        let (pty_tx, pty_rx) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let queue = Arc::new(MessageQueue::new(16));
        let detector = Arc::new(StdMutex::new(IdleDetector::new(
            IdleConfig {
                min_silence_ms: 0,
                confidence_threshold: 0.7,
                stuck_silence_ms: 60_000,
            },
            r"^> $",
            None,
        )));
        let injector = Arc::new(Injector::new(pty_tx, queue, detector, config, outcome_tx));
        (injector, pty_rx, outcome_rx)
    }

    fn msg(body: &str) -> QueuedMessage {
        QueuedMessage::new(
            "abcdef1234567890".to_string(),
            "Tester".to_string(),
            body.to_string(),
            Some(95), // urgent: skip the idle wait in tests
        )
    }

    #[tokio::test]
    async fn test_skip_verification_trusts_write() {
        let config = Config {
            skip_verification: true,
            enter_delay_ms: 0,
            ..Config::default()
        };
        let (injector, mut pty_rx, _outcomes) = make_injector(config);
        let attempt = injector.inject_one(&msg("hello")).await;
        assert!(matches!(attempt, InjectAttempt::Delivered { retried: false }));

        let written = pty_rx.recv().await.unwrap();
        let text = String::from_utf8(written).unwrap();
        assert!(text.contains("Relay message from Tester [abcdef12]: hello"));
        let enter = pty_rx.recv().await.unwrap();
        assert_eq!(enter, b"\r");
    }

    #[tokio::test]
    async fn test_verification_sees_echo() {
        let config = Config {
            enter_delay_ms: 0,
            verification_timeout_ms: 500,
            ..Config::default()
        };
        let (injector, _pty_rx, _outcomes) = make_injector(config);

        let injector_clone = Arc::clone(&injector);
        let echo = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            injector_clone
                .record_output("Relay message from Tester [abcdef12]: hello\n")
                .await;
        });

        let attempt = injector.inject_one(&msg("hello")).await;
        echo.await.unwrap();
        assert!(matches!(attempt, InjectAttempt::Delivered { .. }));
    }

    #[tokio::test]
    async fn test_verification_miss_requests_retry() {
        let config = Config {
            enter_delay_ms: 0,
            verification_timeout_ms: 100,
            max_retries: 3,
            ..Config::default()
        };
        let (injector, _pty_rx, _outcomes) = make_injector(config);
        let attempt = injector.inject_one(&msg("unechoed")).await;
        assert!(matches!(attempt, InjectAttempt::Retry));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let config = Config {
            enter_delay_ms: 0,
            verification_timeout_ms: 50,
            max_retries: 2,
            ..Config::default()
        };
        let (injector, _pty_rx, _outcomes) = make_injector(config);
        let mut m = msg("never echoed");
        m.retries = 2;
        let attempt = injector.inject_one(&m).await;
        assert!(matches!(attempt, InjectAttempt::Failed(_)));
    }

    #[tokio::test]
    async fn test_bracketed_paste_wrapping() {
        let config = Config {
            cli: CliKind::Claude,
            skip_verification: true,
            enter_delay_ms: 0,
            ..Config::default()
        };
        let (injector, mut pty_rx, _outcomes) = make_injector(config);
        injector.inject_one(&msg("wrapped")).await;
        let written = String::from_utf8(pty_rx.recv().await.unwrap()).unwrap();
        assert!(written.starts_with(PASTE_BEGIN));
        assert!(written.ends_with(PASTE_END));
    }

    #[tokio::test]
    async fn test_gemini_backticks_body() {
        let config = Config {
            cli: CliKind::Gemini,
            skip_verification: true,
            enter_delay_ms: 0,
            ..Config::default()
        };
        let (injector, mut pty_rx, _outcomes) = make_injector(config);
        injector.inject_one(&msg("rm could be a keyword")).await;
        let written = String::from_utf8(pty_rx.recv().await.unwrap()).unwrap();
        assert!(written.starts_with('`'));
        assert!(written.ends_with('`'));
    }

    #[tokio::test]
    async fn test_throttle_adapts() {
        let (injector, _pty_rx, _outcomes) = make_injector(Config::default());
        assert_eq!(injector.current_delay_ms(), THROTTLE_START_MS);

        // One failure alone does not grow the delay.
        injector.on_failure();
        assert_eq!(injector.current_delay_ms(), THROTTLE_START_MS);
        // The second consecutive failure does.
        injector.on_failure();
        assert_eq!(injector.current_delay_ms(), 150);

        injector.on_success();
        assert_eq!(injector.current_delay_ms(), 120);

        for _ in 0..20 {
            injector.on_failure();
        }
        assert_eq!(injector.current_delay_ms(), THROTTLE_MAX_MS);
        for _ in 0..40 {
            injector.on_success();
        }
        assert_eq!(injector.current_delay_ms(), THROTTLE_MIN_MS);
    }
}
