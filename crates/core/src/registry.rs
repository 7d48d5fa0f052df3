//! Dispatch registry: job-type name → input schema + handler.
//!
//! The registry is built once at startup and shared (`Arc<DispatchRegistry>`)
//! between the submission path, which validates input through it, and the
//! worker pool, which looks handlers up through it. There is no global
//! registration; tests construct as many isolated registries as they like.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::error::CoreError;
use crate::job::JobError;
use crate::types::JobId;

/// Maximum length of a job type name.
const MAX_TYPE_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Handler API
// ---------------------------------------------------------------------------

/// Error returned by a job handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// The job's own logic failed; recorded as `FAILURE`.
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    /// The handler observed the cancellation signal and stopped.
    #[error("Job cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<HandlerError> for JobError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Failed { kind, message } => JobError::new(message).with_kind(kind),
            HandlerError::Cancelled => JobError::new("Job cancelled").with_kind("Cancelled"),
        }
    }
}

/// Destination for progress reports emitted by a running handler.
///
/// Implemented by the job record store; each report becomes a `PROGRESS`
/// transition on the job.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, job_id: JobId, meta: serde_json::Value) -> Result<(), CoreError>;
}

/// Everything a handler may touch besides its input: a progress callback and
/// a cancellation check.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: JobId, progress: Arc<dyn ProgressSink>, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            progress,
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report progress metadata. Failures are logged, never surfaced to the
    /// handler: a lost progress update must not fail the job.
    pub async fn report_progress(&self, meta: serde_json::Value) {
        if let Err(e) = self.progress.report(self.job_id, meta).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to record job progress");
        }
    }

    /// Whether cancellation has been requested for this job.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Safe point for cooperative cancellation: `Err(Cancelled)` once the job
    /// has been asked to stop.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The computation behind a job type.
///
/// Handlers are invoked at least once per job; after a worker crash the
/// broker may redeliver and the handler runs again, so it must be safe to
/// re-invoke.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        input: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Deserialize a handler's (already validated) input into its typed form.
pub fn parse_input<T: DeserializeOwned>(input: serde_json::Value) -> Result<T, HandlerError> {
    serde_json::from_value(input).map_err(|e| HandlerError::failed("InvalidInput", e.to_string()))
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

/// Validates raw submission input for one job type.
pub trait InputSchema: Send + Sync {
    /// Return the normalized input, or `CoreError::Validation`.
    fn validate(&self, raw: &serde_json::Value) -> Result<serde_json::Value, CoreError>;
}

/// Schema backed by a `serde` + `validator` struct.
///
/// Input must deserialize into `T` (unknown enum values, wrong types and
/// missing fields are rejected) and then pass `T::validate` (ranges,
/// lengths). The normalized input is `T` serialized back to JSON.
pub struct TypedSchema<T>(PhantomData<fn() -> T>);

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InputSchema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize + Validate,
{
    fn validate(&self, raw: &serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let parsed: T = serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::Validation(format!("Malformed input: {e}")))?;
        parsed
            .validate()
            .map_err(|e| CoreError::Validation(e.to_string().replace('\n', "; ")))?;
        serde_json::to_value(parsed).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// DispatchRegistry
// ---------------------------------------------------------------------------

/// A registered job type.
#[derive(Clone)]
pub struct JobType {
    pub name: String,
    pub schema: Arc<dyn InputSchema>,
    pub handler: Arc<dyn JobHandler>,
}

/// Maps job-type names to their schema and handler.
#[derive(Default)]
pub struct DispatchRegistry {
    types: BTreeMap<String, JobType>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type. Each name may be registered once.
    pub fn register(
        &mut self,
        type_name: &str,
        schema: Arc<dyn InputSchema>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), CoreError> {
        validate_type_name(type_name)?;
        if self.types.contains_key(type_name) {
            return Err(CoreError::Conflict(format!(
                "Job type '{type_name}' is already registered"
            )));
        }
        self.types.insert(
            type_name.to_string(),
            JobType {
                name: type_name.to_string(),
                schema,
                handler,
            },
        );
        Ok(())
    }

    /// Register a job type whose schema is the typed input struct `T`.
    pub fn register_typed<T>(
        &mut self,
        type_name: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), CoreError>
    where
        T: DeserializeOwned + Serialize + Validate + 'static,
    {
        self.register(type_name, Arc::new(TypedSchema::<T>::new()), handler)
    }

    /// Check `raw_input` against the type's schema and return the input the
    /// job will carry. Unknown types are a validation error.
    pub fn validate_and_wrap(
        &self,
        type_name: &str,
        raw_input: &serde_json::Value,
    ) -> Result<serde_json::Value, CoreError> {
        let job_type = self
            .types
            .get(type_name)
            .ok_or_else(|| CoreError::Validation(format!("Unknown job type '{type_name}'")))?;
        job_type.schema.validate(raw_input)
    }

    pub fn handler(&self, type_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.types.get(type_name).map(|t| Arc::clone(&t.handler))
    }

    /// Registered type names in lexical order.
    pub fn type_names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }
}

/// Validate a job type name.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_TYPE_NAME_LEN` characters.
/// - Lowercase alphanumeric, hyphen or underscore only (names appear in URLs).
fn validate_type_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Job type name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_TYPE_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Job type name must not exceed {MAX_TYPE_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!(
            "Job type name '{name}' may only contain lowercase alphanumeric, hyphen, or underscore characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
