//! Job entity, status machine, and submission input validation.
//!
//! A [`Job`] is decoded once at the store boundary; everything downstream
//! works with these types and never with raw rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, OwnerId, Timestamp};

/// Maximum prompt length in characters.
pub const MAX_PROMPT_LEN: usize = 10_000;

/// Progress is reported as a whole percentage.
pub const MAX_PROGRESS: u8 = 100;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// `queued -> processing -> {completed | failed}`, with `cancelled`
/// reachable only from `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Statuses counted against the per-owner admission limit.
pub const ACTIVE_STATUSES: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Processing];

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed, and cancelled admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Queued or processing.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether the lifecycle graph allows moving from `self` to `next`.
    ///
    /// A status may always be rewritten with itself (progress updates).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(CoreError::Validation(format!("Unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// What the generation worker is asked to do with the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Create,
    Modify,
    Fix,
}

impl JobAction {
    pub fn as_str(self) -> &'static str {
        match self {
            JobAction::Create => "create",
            JobAction::Modify => "modify",
            JobAction::Fix => "fix",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(JobAction::Create),
            "modify" => Ok(JobAction::Modify),
            "fix" => Ok(JobAction::Fix),
            other => Err(CoreError::Validation(format!(
                "Unknown job action: {other} (expected create, modify, or fix)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A snapshot of one code-generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub prompt: String,
    pub action: JobAction,
    pub context: serde_json::Value,
    pub status: JobStatus,
    pub progress: u8,
    pub status_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub model_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl Job {
    /// Build the initial queued snapshot for a freshly inserted record.
    pub fn queued(id: JobId, record: &NewJobRecord, created_at: Timestamp) -> Self {
        Self {
            id,
            owner_id: record.owner_id.clone(),
            prompt: record.prompt.clone(),
            action: record.action,
            context: record.context.clone(),
            status: JobStatus::Queued,
            progress: 0,
            status_message: None,
            result: None,
            error_message: None,
            attempts: 0,
            max_attempts: record.max_attempts,
            created_at,
            started_at: None,
            completed_at: None,
            model_id: None,
            tokens_used: None,
            duration_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a patch in place. Fields absent from the patch are untouched.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress.min(MAX_PROGRESS);
        }
        if let Some(message) = &patch.status_message {
            self.status_message = message.clone();
        }
        if let Some(result) = &patch.result {
            self.result = Some(result.clone());
        }
        if let Some(error) = &patch.error_message {
            self.error_message = Some(error.clone());
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(at) = patch.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(model) = &patch.model_id {
            self.model_id = Some(model.clone());
        }
        if let Some(tokens) = patch.tokens_used {
            self.tokens_used = Some(tokens);
        }
        if let Some(duration) = patch.duration_ms {
            self.duration_ms = Some(duration);
        }
    }

    /// Check the outcome invariants:
    ///
    /// - `result` is present iff the job completed.
    /// - `error_message` is present iff the job failed.
    /// - `progress` never exceeds 100.
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        let completed = self.status == JobStatus::Completed;
        if self.result.is_some() != completed {
            return Err(CoreError::Validation(format!(
                "Job {} has status {} but result is {}",
                self.id,
                self.status,
                if self.result.is_some() { "set" } else { "missing" },
            )));
        }
        let failed = self.status == JobStatus::Failed;
        if self.error_message.is_some() != failed {
            return Err(CoreError::Validation(format!(
                "Job {} has status {} but error_message is {}",
                self.id,
                self.status,
                if self.error_message.is_some() { "set" } else { "missing" },
            )));
        }
        if self.progress > MAX_PROGRESS {
            return Err(CoreError::Validation(format!(
                "Job {} progress {} exceeds {MAX_PROGRESS}",
                self.id, self.progress
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// What a caller submits: the prompt, the action, and opaque context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub prompt: String,
    pub action: JobAction,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl JobRequest {
    pub fn new(prompt: impl Into<String>, action: JobAction) -> Self {
        Self {
            prompt: prompt.into(),
            action,
            context: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// A validated record ready for insertion into the row store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJobRecord {
    pub owner_id: OwnerId,
    pub prompt: String,
    pub action: JobAction,
    pub context: serde_json::Value,
    pub max_attempts: i32,
}

/// Validate a prompt.
///
/// Rules:
/// - Must contain at least one non-whitespace character.
/// - Must not exceed `MAX_PROMPT_LEN` characters.
pub fn validate_prompt(prompt: &str) -> Result<(), CoreError> {
    if prompt.trim().is_empty() {
        return Err(CoreError::Validation(
            "Prompt must not be empty".to_string(),
        ));
    }
    if prompt.chars().count() > MAX_PROMPT_LEN {
        return Err(CoreError::Validation(format!(
            "Prompt must not exceed {MAX_PROMPT_LEN} characters"
        )));
    }
    Ok(())
}

/// Normalise and validate the opaque context. `null` becomes `{}`.
pub fn normalize_context(context: serde_json::Value) -> Result<serde_json::Value, CoreError> {
    match context {
        serde_json::Value::Null => Ok(serde_json::Value::Object(Default::default())),
        serde_json::Value::Object(_) => Ok(context),
        _ => Err(CoreError::Validation(
            "Context must be a JSON object".to_string(),
        )),
    }
}

impl NewJobRecord {
    /// Validate a request and attach the owner.
    pub fn from_request(
        owner_id: OwnerId,
        request: JobRequest,
        max_attempts: i32,
    ) -> Result<Self, CoreError> {
        validate_prompt(&request.prompt)?;
        let context = normalize_context(request.context)?;
        Ok(Self {
            owner_id,
            prompt: request.prompt,
            action: request.action,
            context,
            max_attempts,
        })
    }
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// A partial update to a job row. `None` leaves the field untouched.
///
/// `status_message` is doubly optional so a writer can clear it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub status_message: Option<Option<String>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempts: Option<i32>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub model_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl JobPatch {
    /// The patch written by a cancel: `cancelled`, stamped now.
    pub fn cancelled(at: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            status_message: Some(None),
            completed_at: Some(at),
            ..Default::default()
        }
    }

    /// A progress report from the worker while processing.
    pub fn progress(percent: u8, message: Option<&str>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            progress: Some(percent.min(MAX_PROGRESS)),
            status_message: Some(message.map(str::to_string)),
            ..Default::default()
        }
    }

    /// The worker finished successfully with `result`.
    pub fn completed(result: serde_json::Value, at: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(MAX_PROGRESS),
            status_message: Some(None),
            result: Some(result),
            completed_at: Some(at),
            ..Default::default()
        }
    }

    /// The worker gave up with `error`.
    pub fn failed(error: impl Into<String>, at: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            status_message: Some(None),
            error_message: Some(error.into()),
            completed_at: Some(at),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
