//! In-flight chat run tracking.
//!
//! State machine per run: pending -> streaming -> {completed | aborted |
//! timed-out | errored}. Runs are created when a chat-send request is
//! accepted (after its idempotency key cleared the dedupe cache), accumulate
//! partial output while streaming, and are removed on any terminal
//! transition. Aborted and timed-out runs linger in a bounded
//! "recently aborted" set so a late duplicate signal for the same run id is
//! recognized and ignored instead of reprocessed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_RUN_DEADLINE_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_ABORTED_RETENTION_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRunStatus {
    Pending,
    Streaming,
    Completed,
    Aborted,
    TimedOut,
    Errored,
}

impl ChatRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatRunStatus::Completed
                | ChatRunStatus::Aborted
                | ChatRunStatus::TimedOut
                | ChatRunStatus::Errored
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRunStatus::Pending => "pending",
            ChatRunStatus::Streaming => "streaming",
            ChatRunStatus::Completed => "completed",
            ChatRunStatus::Aborted => "aborted",
            ChatRunStatus::TimedOut => "timed-out",
            ChatRunStatus::Errored => "errored",
        }
    }
}

impl std::fmt::Display for ChatRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result delivered to waiters.
#[derive(Debug, Clone)]
pub struct ChatRunOutcome {
    pub run_id: String,
    pub status: ChatRunStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

pub struct ChatRun {
    pub run_id: String,
    pub session_key: String,
    pub status: ChatRunStatus,
    buffered: String,
    deadline: Instant,
    pub cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<ChatRunOutcome>>,
}

/// Result of attempting to register a run id.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// A new run was created; the token cancels the underlying agent turn.
    Created(CancellationToken),
    /// A run with this id is already active.
    DuplicateActive,
    /// This id was aborted within the retention window; the signal is stale.
    RecentlyAborted,
}

pub struct ChatRunRegistry {
    runs: HashMap<String, ChatRun>,
    recently_aborted: HashMap<String, Instant>,
    run_deadline: Duration,
    aborted_retention: Duration,
}

impl ChatRunRegistry {
    pub fn new(run_deadline: Duration, aborted_retention: Duration) -> Self {
        Self {
            runs: HashMap::new(),
            recently_aborted: HashMap::new(),
            run_deadline,
            aborted_retention,
        }
    }

    pub fn register(&mut self, run_id: &str, session_key: &str) -> RegisterOutcome {
        if self.was_recently_aborted(run_id) {
            return RegisterOutcome::RecentlyAborted;
        }
        if self.runs.contains_key(run_id) {
            return RegisterOutcome::DuplicateActive;
        }
        let cancel = CancellationToken::new();
        self.runs.insert(
            run_id.to_string(),
            ChatRun {
                run_id: run_id.to_string(),
                session_key: session_key.to_string(),
                status: ChatRunStatus::Pending,
                buffered: String::new(),
                deadline: Instant::now() + self.run_deadline,
                cancel: cancel.clone(),
                waiters: Vec::new(),
            },
        );
        RegisterOutcome::Created(cancel)
    }

    /// Pending -> streaming. Returns false when the run is gone or was
    /// cancelled between acceptance and the first delta.
    pub fn mark_streaming(&mut self, run_id: &str) -> bool {
        match self.runs.get_mut(run_id) {
            Some(run) if run.status == ChatRunStatus::Pending => {
                if run.cancel.is_cancelled() {
                    return false;
                }
                run.status = ChatRunStatus::Streaming;
                true
            }
            _ => false,
        }
    }

    /// Append partial output; only streaming runs accumulate.
    pub fn append_delta(&mut self, run_id: &str, delta: &str) -> bool {
        match self.runs.get_mut(run_id) {
            Some(run) if run.status == ChatRunStatus::Streaming => {
                run.buffered.push_str(delta);
                true
            }
            _ => false,
        }
    }

    pub fn buffered_output(&self, run_id: &str) -> Option<&str> {
        self.runs.get(run_id).map(|r| r.buffered.as_str())
    }

    pub fn session_key(&self, run_id: &str) -> Option<&str> {
        self.runs.get(run_id).map(|r| r.session_key.as_str())
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn active_count(&self) -> usize {
        self.runs.len()
    }

    pub fn was_recently_aborted(&self, run_id: &str) -> bool {
        match self.recently_aborted.get(run_id) {
            Some(at) => at.elapsed() < self.aborted_retention,
            None => false,
        }
    }

    /// Attach a waiter for the run's terminal outcome. Returns the sender
    /// back when the run does not exist.
    pub fn add_waiter(
        &mut self,
        run_id: &str,
        tx: oneshot::Sender<ChatRunOutcome>,
    ) -> Result<(), oneshot::Sender<ChatRunOutcome>> {
        match self.runs.get_mut(run_id) {
            Some(run) => {
                run.waiters.push(tx);
                Ok(())
            }
            None => Err(tx),
        }
    }

    pub fn complete(&mut self, run_id: &str, output: Option<String>) -> Option<ChatRunOutcome> {
        self.finish(run_id, ChatRunStatus::Completed, output, None)
    }

    pub fn fail(&mut self, run_id: &str, error: &str) -> Option<ChatRunOutcome> {
        self.finish(run_id, ChatRunStatus::Errored, None, Some(error.to_string()))
    }

    /// Abort a run, explicitly or from the deadline sweep. Cancels the
    /// underlying turn and records the id so late duplicates are absorbed.
    pub fn abort(&mut self, run_id: &str, status: ChatRunStatus) -> Option<ChatRunOutcome> {
        debug_assert!(matches!(
            status,
            ChatRunStatus::Aborted | ChatRunStatus::TimedOut
        ));
        let outcome = self.finish(run_id, status, None, None)?;
        self.recently_aborted
            .insert(run_id.to_string(), Instant::now());
        Some(outcome)
    }

    /// Deadline sweep plus recently-aborted retention purge. Returns the ids
    /// of runs that timed out in this pass.
    pub fn sweep(&mut self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .runs
            .values()
            .filter(|run| now >= run.deadline)
            .map(|run| run.run_id.clone())
            .collect();
        for run_id in &expired {
            debug!(target: "gateway", run_id = %run_id, "chat run hit hard deadline");
            self.abort(run_id, ChatRunStatus::TimedOut);
        }
        let retention = self.aborted_retention;
        self.recently_aborted
            .retain(|_, at| at.elapsed() < retention);
        expired
    }

    /// Single cleanup path shared by completion, error, and abort: remove
    /// the run (its buffer goes with it), cancel its token, and notify
    /// waiters.
    fn finish(
        &mut self,
        run_id: &str,
        status: ChatRunStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Option<ChatRunOutcome> {
        let mut run = self.runs.remove(run_id)?;
        run.cancel.cancel();
        let output = output.or_else(|| {
            if run.buffered.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut run.buffered))
            }
        });
        let outcome = ChatRunOutcome {
            run_id: run.run_id.clone(),
            status,
            output,
            error,
        };
        for tx in run.waiters.drain(..) {
            let _ = tx.send(outcome.clone());
        }
        Some(outcome)
    }
}

impl Default for ChatRunRegistry {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_RUN_DEADLINE_MS),
            Duration::from_millis(DEFAULT_ABORTED_RETENTION_MS),
        )
    }
}
