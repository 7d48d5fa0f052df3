//! The job record and the transitions that mutate it.
//!
//! [`Job::apply`] is the single place where a transition is checked against
//! the state machine and folded into a record. Every store backend calls it
//! while holding its per-key lock, so the rules cannot drift between the
//! in-memory and PostgreSQL implementations.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::state_machine;
use crate::types::{new_job_id, JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Started,
    Progress,
    Success,
    Failure,
    Revoked,
}

/// States a job can be in while it still needs (or is receiving) a worker.
pub const ACTIVE_STATES: [JobState; 3] = [JobState::Pending, JobState::Started, JobState::Progress];

/// States from which no further transition is permitted.
pub const TERMINAL_STATES: [JobState; 3] = [JobState::Success, JobState::Failure, JobState::Revoked];

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Progress => "PROGRESS",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
            JobState::Revoked => "REVOKED",
        }
    }

    pub fn is_terminal(self) -> bool {
        TERMINAL_STATES.contains(&self)
    }

    /// A job is running once a worker has claimed it and until it finishes.
    pub fn is_running(self) -> bool {
        matches!(self, JobState::Started | JobState::Progress)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "STARTED" => Ok(JobState::Started),
            "PROGRESS" => Ok(JobState::Progress),
            "SUCCESS" => Ok(JobState::Success),
            "FAILURE" => Ok(JobState::Failure),
            "REVOKED" => Ok(JobState::Revoked),
            other => Err(CoreError::Internal(format!("Unknown job state '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// Failure details recorded on a job in the `FAILURE` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Human-readable description.
    pub message: String,
    /// Class of failure, when the handler provided one.
    pub kind: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A submitted unit of work and its lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub type_name: String,
    pub input: serde_json::Value,
    pub state: JobState,
    pub progress: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub worker_id: Option<String>,
    /// Set by the cancellation coordinator on a running job; the executing
    /// worker observes it and revokes the job cooperatively.
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Only set once the job is terminal.
    pub expires_at: Option<Timestamp>,
}

impl Job {
    /// Build a fresh `PENDING` job with a new id.
    ///
    /// `input` must already have passed the type's schema.
    pub fn new(type_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: new_job_id(),
            type_name: type_name.into(),
            input,
            state: JobState::Pending,
            progress: None,
            result: None,
            error: None,
            worker_id: None,
            cancel_requested: false,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            expires_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the record's retention window has elapsed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Fold `transition` into this record.
    ///
    /// Returns [`Applied::Unchanged`] when the record already reflects the
    /// transition (same target state and same payload), so repeated progress
    /// reports and duplicate terminal writes are harmless. Any other edge not
    /// in the state machine yields [`CoreError::IllegalTransition`].
    pub fn apply(
        &self,
        transition: &Transition,
        now: Timestamp,
        retention: Duration,
    ) -> Result<Applied, CoreError> {
        if self.already_reflects(transition) {
            return Ok(Applied::Unchanged);
        }

        let to = transition.target(self.state);
        if !transition.permitted_from(self.state) {
            return Err(CoreError::IllegalTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }

        let mut next = self.clone();
        next.state = to;

        match transition {
            Transition::Start { worker_id } => {
                next.worker_id = Some(worker_id.clone());
                next.started_at = Some(now);
            }
            Transition::Reassign { worker_id } => next.worker_id = Some(worker_id.clone()),
            Transition::Progress(meta) => next.progress = Some(meta.clone()),
            Transition::Succeed(result) => next.result = Some(result.clone()),
            Transition::Fail(error) => next.error = Some(error.clone()),
            Transition::RevokePending | Transition::Revoke => {}
        }

        if to.is_terminal() {
            next.progress = None;
            next.finished_at = Some(now);
            let retention = chrono::TimeDelta::from_std(retention).unwrap_or(chrono::TimeDelta::MAX);
            next.expires_at = now.checked_add_signed(retention);
        }

        Ok(Applied::Changed(next))
    }

    fn already_reflects(&self, transition: &Transition) -> bool {
        if let Transition::Reassign { worker_id } = transition {
            return self.state.is_running() && self.worker_id.as_ref() == Some(worker_id);
        }
        if self.state != transition.target(self.state) {
            return false;
        }
        match transition {
            Transition::Start { worker_id } | Transition::Reassign { worker_id } => {
                self.worker_id.as_ref() == Some(worker_id)
            }
            Transition::Progress(meta) => self.progress.as_ref() == Some(meta),
            Transition::Succeed(result) => self.result.as_ref() == Some(result),
            Transition::Fail(error) => self.error.as_ref() == Some(error),
            Transition::RevokePending | Transition::Revoke => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// A requested change to a job's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Transition {
    /// A worker claimed the job.
    Start { worker_id: String },
    /// A redelivered running job was taken over by another worker. The
    /// state is kept; only `worker_id` changes.
    Reassign { worker_id: String },
    /// The handler reported progress; replaces any earlier metadata.
    Progress(serde_json::Value),
    /// The handler returned.
    Succeed(serde_json::Value),
    /// The handler raised.
    Fail(JobError),
    /// Cancelled before any worker claimed the job. Rejected once the job
    /// has started.
    RevokePending,
    /// Cancelled cooperatively by the worker running the job.
    Revoke,
}

impl Transition {
    /// The state a job in `from` ends up in if the transition is applied.
    pub fn target(&self, from: JobState) -> JobState {
        match self {
            Transition::Start { .. } => JobState::Started,
            Transition::Reassign { .. } => from,
            Transition::Progress(_) => JobState::Progress,
            Transition::Succeed(_) => JobState::Success,
            Transition::Fail(_) => JobState::Failure,
            Transition::RevokePending | Transition::Revoke => JobState::Revoked,
        }
    }

    fn permitted_from(&self, from: JobState) -> bool {
        match self {
            Transition::Reassign { .. } => from.is_running(),
            Transition::RevokePending => from == JobState::Pending,
            other => state_machine::validate_transition(from, other.target(from)).is_ok(),
        }
    }
}

/// Outcome of [`Job::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The record changed; this is the new version.
    Changed(Job),
    /// The record already reflected the transition.
    Unchanged,
}

// ---------------------------------------------------------------------------
// JobFilter
// ---------------------------------------------------------------------------

/// State-set filter for listing jobs. An empty set matches every state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub states: Vec<JobState>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Pending, started and in-progress jobs.
    pub fn active() -> Self {
        Self::with_states(&ACTIVE_STATES)
    }

    pub fn with_states(states: &[JobState]) -> Self {
        Self {
            states: states.to_vec(),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.states.is_empty() || self.states.contains(&job.state)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
