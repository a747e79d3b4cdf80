// quill/src/job.rs
//!
//! Job lifecycle controller.
//!
//! Runs one streaming job at a time: `Idle -> Starting -> Streaming ->
//! Settling -> Idle`, or out to `Idle` through cancellation or failure.
//! The loading flag, the streaming preview and the error slot are shared
//! state owned by the controller. Every write to them made after the backend
//! call started first checks that the writer's cancellation token is still
//! the active one, so a stale job can never clobber a newer job's state.

use crate::backend::{BackendError, CancellationToken, GenerationBackend, GenerationRequest, TokenUsage};
use crate::extraction;
use crate::normalize::{self, Normalizer};
use crate::settings::GenerationSettings;
use crate::stream_tags;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const PARSE_FAILURE_MESSAGE: &str =
    "The response format could not be parsed. Please try again.";
pub const STRUCTURE_FAILURE_MESSAGE: &str =
    "The response had an unexpected structure. Please try again.";
pub const TRANSPORT_FAILURE_MESSAGE: &str = "The request failed. Please try again.";
pub const APPLICATION_ERROR_MESSAGE: &str = "The service reported an error.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    LogicCheck,
    GrammarCheck,
    Scoring,
    LetterLogic,
    LetterScoring,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::LogicCheck,
        JobType::GrammarCheck,
        JobType::Scoring,
        JobType::LetterLogic,
        JobType::LetterScoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::LogicCheck => "logic-check",
            JobType::GrammarCheck => "grammar-check",
            JobType::Scoring => "scoring",
            JobType::LetterLogic => "letter-logic",
            JobType::LetterScoring => "letter-scoring",
        }
    }

    /// The schema normalizer for this job type.
    pub fn normalizer(&self) -> Normalizer {
        normalize::schemas::normalizer_for(*self)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown job type '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    #[default]
    Idle,
    Starting,
    Streaming,
    Settling,
}

/// Live preview of the active job; the empty sentinel between jobs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingState {
    pub job_type: Option<JobType>,
    pub id: Option<String>,
    /// Display-only prefix of the stream so far.
    pub text: String,
}

impl StreamingState {
    pub fn is_empty(&self) -> bool {
        self.job_type.is_none() && self.id.is_none() && self.text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// No candidate in the final text parsed.
    Parse,
    /// The payload itself reported an error.
    Application,
    /// The payload parsed but could not be normalized.
    Structure,
    /// The backend call failed.
    Transport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    pub id: String,
    pub job_type: JobType,
    pub kind: ErrorKind,
    /// Prose already shown when a transport failure cut the stream short.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSuccess {
    /// Normalized payload (or the parsed payload when no normalizer is set).
    pub json: Value,
    pub display_text: String,
    pub raw: String,
    pub usage: Option<TokenUsage>,
}

/// A payload that carried its own error indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRejection {
    pub error: ErrorRecord,
    pub json: Value,
    pub display_text: String,
    pub raw: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub error: ErrorRecord,
    /// Final text, when the stream completed but could not be used.
    pub raw: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(JobSuccess),
    Rejected(JobRejection),
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            JobOutcome::Completed(_) => None,
            JobOutcome::Rejected(rejection) => Some(&rejection.error),
            JobOutcome::Failed(failure) => Some(&failure.error),
        }
    }
}

#[derive(Clone)]
pub struct JobDescriptor {
    pub job_type: JobType,
    /// Caller-chosen correlation key for routing updates and errors.
    pub id: String,
    pub prompt: String,
    pub json_mode: bool,
    pub normalizer: Option<Normalizer>,
    pub fallback_error: Option<String>,
    pub settings: Option<GenerationSettings>,
}

impl JobDescriptor {
    pub fn new(job_type: JobType, id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            job_type,
            id: id.into(),
            prompt: prompt.into(),
            json_mode: true,
            normalizer: Some(job_type.normalizer()),
            fallback_error: None,
            settings: None,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn without_normalizer(mut self) -> Self {
        self.normalizer = None;
        self
    }

    pub fn json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    pub fn fallback_error(mut self, message: impl Into<String>) -> Self {
        self.fallback_error = Some(message.into());
        self
    }

    pub fn settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("job_type", &self.job_type)
            .field("id", &self.id)
            .field("prompt_len", &self.prompt.len())
            .field("json_mode", &self.json_mode)
            .field("has_normalizer", &self.normalizer.is_some())
            .finish()
    }
}

/// Optional hooks invoked on the thread running the job.
#[derive(Default)]
pub struct JobCallbacks<'a> {
    on_start: Option<Box<dyn FnOnce() + 'a>>,
    on_progress: Option<Box<dyn FnMut(&StreamingState) + 'a>>,
    on_success: Option<Box<dyn FnOnce(&JobSuccess) + 'a>>,
    on_error: Option<Box<dyn FnOnce(&ErrorRecord, Option<&Value>) + 'a>>,
}

impl<'a> JobCallbacks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl FnOnce() + 'a) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Called after each chunk with the recomputed preview.
    pub fn on_progress(mut self, f: impl FnMut(&StreamingState) + 'a) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(&JobSuccess) + 'a) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Receives the error record and, for application-level errors, the
    /// parsed payload.
    pub fn on_error(mut self, f: impl FnOnce(&ErrorRecord, Option<&Value>) + 'a) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// What a presentation layer renders: loading, preview, error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub loading: Option<JobType>,
    pub phase: JobPhase,
    pub streaming: StreamingState,
    pub error: Option<ErrorRecord>,
}

#[derive(Default)]
struct EngineState {
    loading: Option<JobType>,
    phase: JobPhase,
    streaming: StreamingState,
    error: Option<ErrorRecord>,
    active: Option<CancellationToken>,
}

impl EngineState {
    fn is_active(&self, token: &CancellationToken) -> bool {
        self.active.as_ref().is_some_and(|active| active.same_as(token))
    }

    fn reset(&mut self) {
        self.loading = None;
        self.phase = JobPhase::Idle;
        self.streaming = StreamingState::default();
        self.active = None;
    }
}

pub struct JobController {
    backend: Arc<dyn GenerationBackend>,
    state: Mutex<EngineState>,
}

impl JobController {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(EngineState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.lock();
        EngineSnapshot {
            loading: state.loading,
            phase: state.phase,
            streaming: state.streaming.clone(),
            error: state.error.clone(),
        }
    }

    /// Run one job to completion on the calling thread.
    ///
    /// Returns `None` without touching any state when the prompt is empty or
    /// another job is active, and `None` when the job is cancelled. Every
    /// other failure is reported through the error slot, the error callback
    /// and the returned outcome.
    pub fn run_job(
        &self,
        descriptor: JobDescriptor,
        mut callbacks: JobCallbacks<'_>,
    ) -> Option<JobOutcome> {
        if descriptor.prompt.trim().is_empty() {
            tracing::debug!(job_type = %descriptor.job_type, id = %descriptor.id, "ignoring job with empty prompt");
            return None;
        }

        let token = {
            let mut state = self.lock();
            if state.loading.is_some() {
                tracing::debug!(
                    job_type = %descriptor.job_type,
                    id = %descriptor.id,
                    active = ?state.loading,
                    "another job is active, not starting"
                );
                return None;
            }
            let token = CancellationToken::new();
            state.loading = Some(descriptor.job_type);
            state.phase = JobPhase::Starting;
            state.error = None;
            state.streaming = StreamingState {
                job_type: Some(descriptor.job_type),
                id: Some(descriptor.id.clone()),
                text: String::new(),
            };
            state.active = Some(token.clone());
            token
        };

        tracing::info!(job_type = %descriptor.job_type, id = %descriptor.id, "job started");
        if let Some(on_start) = callbacks.on_start.take() {
            on_start();
        }

        let request = GenerationRequest {
            prompt: descriptor.prompt.clone(),
            json_mode: descriptor.json_mode,
            settings: descriptor.settings.clone(),
            cancellation: token.clone(),
        };

        {
            let mut state = self.lock();
            if state.is_active(&token) {
                state.phase = JobPhase::Streaming;
            }
        }

        let mut on_progress = callbacks.on_progress.take();
        let mut last_preview = String::new();
        let result = self.backend.stream(&request, &mut |_chunk, full_text| {
            if token.is_cancelled() {
                return;
            }
            // Always recompute from the cumulative text: a later chunk can
            // move the payload boundary.
            let preview = stream_tags::preview(full_text);
            last_preview.clear();
            last_preview.push_str(preview);

            let streaming = {
                let mut state = self.lock();
                if !state.is_active(&token) {
                    return;
                }
                state.streaming.text = preview.to_string();
                state.streaming.clone()
            };
            if let Some(on_progress) = on_progress.as_mut() {
                on_progress(&streaming);
            }
        });

        if token.is_cancelled() {
            // cancel() already reset the shared state; it may belong to a
            // newer job by now.
            tracing::info!(job_type = %descriptor.job_type, id = %descriptor.id, "job cancelled");
            return None;
        }

        let outcome = match result {
            Ok(generation) => {
                self.complete(&descriptor, &token, generation.text, generation.usage, &mut callbacks)
            }
            Err(BackendError::Cancelled) => {
                tracing::info!(job_type = %descriptor.job_type, id = %descriptor.id, "backend cancelled the stream");
                self.settle(&token);
                return None;
            }
            Err(err) => {
                let message = err.to_string();
                let message = if message.trim().is_empty() {
                    descriptor
                        .fallback_error
                        .clone()
                        .unwrap_or_else(|| TRANSPORT_FAILURE_MESSAGE.to_string())
                } else {
                    message
                };
                let partial = (!last_preview.is_empty()).then_some(last_preview);
                let error = self.fail(
                    &descriptor,
                    &token,
                    ErrorKind::Transport,
                    message,
                    partial,
                    None,
                    &mut callbacks,
                );
                JobOutcome::Failed(JobFailure {
                    error,
                    raw: None,
                    usage: None,
                })
            }
        };

        self.settle(&token);
        if token.is_cancelled() {
            return None;
        }
        tracing::info!(
            job_type = %descriptor.job_type,
            id = %descriptor.id,
            ok = outcome.is_ok(),
            "job settled"
        );
        Some(outcome)
    }

    /// Signal the active job, if any, and reset loading and preview now.
    pub fn cancel(&self) {
        let mut state = self.lock();
        if let Some(token) = state.active.take() {
            token.cancel();
            tracing::info!(job_type = ?state.loading, "cancelling active job");
        }
        state.reset();
    }

    /// Clear the error slot only.
    pub fn clear_error(&self) {
        self.lock().error = None;
    }

    fn complete(
        &self,
        descriptor: &JobDescriptor,
        token: &CancellationToken,
        raw: String,
        usage: Option<TokenUsage>,
        callbacks: &mut JobCallbacks<'_>,
    ) -> JobOutcome {
        {
            let mut state = self.lock();
            if state.is_active(token) {
                state.phase = JobPhase::Settling;
            }
        }

        let extraction = extraction::extract(&raw);
        let Some(json) = extraction.json else {
            tracing::warn!(
                job_type = %descriptor.job_type,
                id = %descriptor.id,
                raw_len = raw.len(),
                "no parsable payload in response"
            );
            let error = self.fail(
                descriptor,
                token,
                ErrorKind::Parse,
                PARSE_FAILURE_MESSAGE.to_string(),
                None,
                None,
                callbacks,
            );
            return JobOutcome::Failed(JobFailure {
                error,
                raw: Some(raw),
                usage,
            });
        };
        tracing::debug!(source = ?extraction.source, "payload extracted");

        if let Some(message) = embedded_error(&json) {
            let error = self.fail(
                descriptor,
                token,
                ErrorKind::Application,
                message,
                None,
                Some(&json),
                callbacks,
            );
            return JobOutcome::Rejected(JobRejection {
                error,
                json,
                display_text: extraction.display_text,
                raw,
                usage,
            });
        }

        let json = match descriptor.normalizer {
            Some(normalizer) => match normalizer(&json, &extraction.display_text) {
                Ok(normalized) if !is_falsy(&normalized) => normalized,
                result => {
                    if let Err(err) = result {
                        tracing::warn!(job_type = %descriptor.job_type, error = %err, "normalization failed");
                    }
                    let error = self.fail(
                        descriptor,
                        token,
                        ErrorKind::Structure,
                        STRUCTURE_FAILURE_MESSAGE.to_string(),
                        None,
                        None,
                        callbacks,
                    );
                    return JobOutcome::Failed(JobFailure {
                        error,
                        raw: Some(raw),
                        usage,
                    });
                }
            },
            None => json,
        };

        let success = JobSuccess {
            json,
            display_text: extraction.display_text,
            raw,
            usage,
        };
        if token.is_cancelled() {
            return JobOutcome::Completed(success);
        }
        if let Some(on_success) = callbacks.on_success.take() {
            on_success(&success);
        }
        JobOutcome::Completed(success)
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &self,
        descriptor: &JobDescriptor,
        token: &CancellationToken,
        kind: ErrorKind,
        message: String,
        partial_text: Option<String>,
        json: Option<&Value>,
        callbacks: &mut JobCallbacks<'_>,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            message,
            id: descriptor.id.clone(),
            job_type: descriptor.job_type,
            kind,
            partial_text,
        };
        {
            let mut state = self.lock();
            // A job cancelled after its stream ended reports nothing.
            if token.is_cancelled() {
                return record;
            }
            if state.is_active(token) {
                state.error = Some(record.clone());
            }
        }
        tracing::warn!(
            job_type = %descriptor.job_type,
            id = %descriptor.id,
            kind = ?kind,
            message = %record.message,
            "job failed"
        );
        if let Some(on_error) = callbacks.on_error.take() {
            on_error(&record, json);
        }
        record
    }

    fn settle(&self, token: &CancellationToken) {
        let mut state = self.lock();
        if state.is_active(token) {
            state.reset();
        }
    }
}

/// JavaScript-style falsiness of a JSON value.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// The error a payload reports about itself, if any.
///
/// A truthy `error` field or `status` equal to `"error"` marks the payload
/// as an application-level error.
fn embedded_error(json: &Value) -> Option<String> {
    let object = json.as_object()?;
    let error = object.get("error").filter(|e| !is_falsy(e));
    let status_error = object
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.trim().eq_ignore_ascii_case("error"));

    if error.is_none() && !status_error {
        return None;
    }

    let own_message = match error {
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Object(inner)) => inner
            .get("message")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string()),
        _ => None,
    };
    let message = own_message
        .or_else(|| {
            object
                .get("message")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| APPLICATION_ERROR_MESSAGE.to_string());
    Some(message)
}
