//! Domain models for workflow runs and the documents that persist them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

/// The state of a workflow run.
///
/// The variants and their wire spellings follow the GA4GH WES API schema.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// The state of the run is unknown.
    Unknown,
    /// The run is queued.
    Queued,
    /// The run has been assigned to a worker and is preparing to run.
    Initializing,
    /// The run is running.
    Running,
    /// The run is paused.
    Paused,
    /// The run has completed running.
    Complete,
    /// The run encountered an error in one of the executor processes.
    ExecutorError,
    /// The run was stopped due to a system error.
    SystemError,
    /// The run was canceled.
    Canceled,
    /// The run is in the process of being canceled.
    Canceling,
}

impl State {
    /// Every defined state, in wire order.
    pub const ALL: [State; 10] = [
        State::Unknown,
        State::Queued,
        State::Initializing,
        State::Running,
        State::Paused,
        State::Complete,
        State::ExecutorError,
        State::SystemError,
        State::Canceled,
        State::Canceling,
    ];

    /// Checks whether the state is among the set of finished states.
    ///
    /// Once a run reaches a finished state, no further state transitions are
    /// accepted for it.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            State::Complete | State::ExecutorError | State::SystemError | State::Canceled
        )
    }

    /// Checks whether the state is among the set of cancelable states.
    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            State::Queued | State::Initializing | State::Running | State::Paused
        )
    }

    /// Checks whether the state is among the set of unfinished states.
    ///
    /// The unfinished set is the cancelable set plus [`State::Canceling`].
    pub fn is_unfinished(&self) -> bool {
        self.is_cancelable() || matches!(self, State::Canceling)
    }
}

impl Default for State {
    fn default() -> Self {
        State::Unknown
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unknown => "UNKNOWN",
            State::Queued => "QUEUED",
            State::Initializing => "INITIALIZING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Complete => "COMPLETE",
            State::ExecutorError => "EXECUTOR_ERROR",
            State::SystemError => "SYSTEM_ERROR",
            State::Canceled => "CANCELED",
            State::Canceling => "CANCELING",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(State::Unknown),
            "QUEUED" => Ok(State::Queued),
            "INITIALIZING" => Ok(State::Initializing),
            "RUNNING" => Ok(State::Running),
            "PAUSED" => Ok(State::Paused),
            "COMPLETE" => Ok(State::Complete),
            "EXECUTOR_ERROR" => Ok(State::ExecutorError),
            "SYSTEM_ERROR" => Ok(State::SystemError),
            "CANCELED" => Ok(State::Canceled),
            "CANCELING" => Ok(State::Canceling),
            _ => Err(format!("invalid run state: `{}`", s)),
        }
    }
}

/// An error produced while validating a run request form.
#[derive(Debug, thiserror::Error)]
pub enum RunRequestError {
    /// A required form field is missing or empty.
    #[error("form field `{0}` is required")]
    MissingField(&'static str),
    /// A form field could not be JSON deserialized.
    #[error("form field `{0}` could not be JSON deserialized")]
    NotJson(&'static str),
    /// A form field deserialized to something other than a JSON object.
    #[error("form field `{0}` could not be interpreted as an object")]
    NotAnObject(&'static str),
}

/// Form field names that must deserialize to JSON objects.
const OBJECT_FIELDS: [&str; 3] = ["workflow_params", "tags", "workflow_engine_parameters"];

/// The form data passed with an incoming workflow run request.
///
/// The WES API specification defines the object-typed fields as atomic
/// strings carrying JSON-serialized objects; they are kept as strings here and
/// validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunRequest {
    /// Workflow parameters, as a JSON-serialized object.
    pub workflow_params: String,
    /// Workflow type, e.g. `CWL`.
    pub workflow_type: String,
    /// Workflow type version, e.g. `v1.0`.
    pub workflow_type_version: String,
    /// Tags, as a JSON-serialized object.
    #[serde(default = "empty_object")]
    pub tags: String,
    /// Workflow engine parameters, as a JSON-serialized object.
    #[serde(default = "empty_object")]
    pub workflow_engine_parameters: String,
    /// URL of the workflow document.
    pub workflow_url: String,
}

/// The default value for optional JSON-object form fields.
fn empty_object() -> String {
    String::from("{}")
}

impl RunRequest {
    /// Builds a validated request from raw form fields.
    ///
    /// Required string fields must be present and non-empty. Object-typed
    /// fields must deserialize to JSON objects; for the optional ones, empty
    /// strings, the literal `null`, and missing values are normalized to
    /// `"{}"`, while a missing or empty `workflow_params` is an error.
    pub fn from_form(mut form: BTreeMap<String, String>) -> Result<Self, RunRequestError> {
        let mut take = |name: &'static str| -> Result<String, RunRequestError> {
            match form.remove(name) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(RunRequestError::MissingField(name)),
            }
        };

        let workflow_type = take("workflow_type")?;
        let workflow_type_version = take("workflow_type_version")?;
        let workflow_url = take("workflow_url")?;

        let mut object_values = BTreeMap::new();
        for name in OBJECT_FIELDS {
            let raw = form.remove(name);
            let normalized = match raw.as_deref() {
                None | Some("") | Some("null") => {
                    if name == "workflow_params" {
                        return Err(RunRequestError::MissingField(name));
                    }
                    empty_object()
                }
                Some(value) => {
                    let decoded: Value = serde_json::from_str(value)
                        .map_err(|_| RunRequestError::NotJson(name))?;
                    if !decoded.is_object() {
                        return Err(RunRequestError::NotAnObject(name));
                    }
                    value.to_string()
                }
            };
            object_values.insert(name, normalized);
        }

        // SAFETY: the loop above inserts all three `OBJECT_FIELDS` keys.
        Ok(Self {
            workflow_params: object_values.remove("workflow_params").unwrap(),
            workflow_type,
            workflow_type_version,
            tags: object_values.remove("tags").unwrap(),
            workflow_engine_parameters: object_values
                .remove("workflow_engine_parameters")
                .unwrap(),
            workflow_url,
        })
    }
}

/// A task log, including the log of the workflow engine itself.
///
/// All fields are optional; upstream engines diverge in what they report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Log {
    /// Executed commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Time when the task stopped executing (ISO 8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Exit code of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// The name of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Time when the task started executing (ISO 8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// A URL to retrieve standard error logs of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// A URL to retrieve standard output logs of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
}

/// The complete log of a workflow run, as persisted and as returned by
/// `GET /runs/{run_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunLog {
    /// The run identifier minted by this gateway.
    pub run_id: String,
    /// The original run request.
    pub request: RunRequest,
    /// The current state of the run.
    #[serde(default)]
    pub state: State,
    /// The log of the workflow engine itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_log: Option<Log>,
    /// Logs of individual workflow tasks.
    #[serde(default)]
    pub task_logs: Vec<Log>,
    /// Names and destinations of workflow outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub outputs: Option<Value>,
}

/// A run log as reported by an upstream engine.
///
/// Upstream implementations are known to diverge from the WES schema, so
/// every field is optional and unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteRunLog {
    /// The run identifier on the upstream engine.
    #[serde(default)]
    pub run_id: Option<String>,
    /// The request as echoed by the upstream engine; never mirrored locally.
    #[serde(default)]
    pub request: Option<Value>,
    /// The state reported by the upstream engine.
    #[serde(default)]
    pub state: Option<State>,
    /// The engine log.
    #[serde(default)]
    pub run_log: Option<Log>,
    /// The task logs.
    #[serde(default)]
    pub task_logs: Option<Vec<Log>>,
    /// The workflow outputs.
    #[serde(default)]
    pub outputs: Option<Value>,
}

/// A partial update to the persisted run log.
///
/// Only fields that are present are written; the `request` and local
/// `run_id` fields are never part of a patch.
#[derive(Debug, Clone, Default)]
pub struct RunLogPatch {
    /// The new state, if any.
    pub state: Option<State>,
    /// The new engine log, if any.
    pub run_log: Option<Log>,
    /// The new task logs, if any.
    pub task_logs: Option<Vec<Log>>,
    /// The new outputs, if any.
    pub outputs: Option<Value>,
}

impl From<RemoteRunLog> for RunLogPatch {
    fn from(remote: RemoteRunLog) -> Self {
        // `run_id` and `request` are intentionally dropped: the local run id
        // must never be overwritten by the remote one, and the request is
        // already persisted from admission.
        Self {
            state: remote.state,
            run_log: remote.run_log,
            task_logs: remote.task_logs,
            outputs: remote.outputs,
        }
    }
}

/// Coordinates of the upstream WES endpoint a run was forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WesEndpoint {
    /// Host at which the upstream WES API is served, without the base path.
    pub host: String,
    /// Base path of the upstream WES API.
    #[serde(default = "WesEndpoint::default_base_path")]
    pub base_path: String,
    /// The run identifier on the upstream engine; filled in after a
    /// successful forward.
    #[serde(default)]
    pub run_id: Option<String>,
}

impl WesEndpoint {
    /// The default path suffix defined by the WES API specification.
    pub fn default_base_path() -> String {
        String::from("/ga4gh/wes/v1")
    }
}

/// A file attached to a workflow run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Name of the file as indicated in the run request.
    pub filename: String,
    /// Path of the file within the run's workspace.
    pub path: PathBuf,
}

/// The canonical persistent record for a single workflow run.
#[derive(Debug, Clone)]
pub struct RunDocument {
    /// Unique worker-task identifier coupling this document to its tracker.
    pub task_id: String,
    /// Identifier of the resource owner, if known.
    pub user_id: Option<String>,
    /// Absolute path of the per-run workspace directory.
    pub work_dir: PathBuf,
    /// Files attached to the run request.
    pub attachments: Vec<Attachment>,
    /// The upstream endpoint the run was forwarded to.
    pub wes_endpoint: WesEndpoint,
    /// The run log mirrored from the upstream engine.
    pub run_log: RunLog,
    /// Timestamp when the document was inserted.
    pub created_at: DateTime<Utc>,
}

/// Response model for `POST /runs` and `POST /runs/{run_id}/cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunId {
    /// The workflow run identifier.
    pub run_id: String,
}

/// Response model for `GET /runs/{run_id}/status` and the per-run entries of
/// `GET /runs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunStatus {
    /// The workflow run identifier.
    pub run_id: String,
    /// The state of the run.
    pub state: State,
}

/// Response model for `GET /runs`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunListResponse {
    /// Token to request the next page of results; empty when this is the
    /// last page.
    pub next_page_token: String,
    /// The runs on this page, newest first.
    pub runs: Vec<RunStatus>,
}

/// The error shape returned by upstream WES implementations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// A detailed error message.
    #[serde(default)]
    pub msg: Option<String>,
    /// The HTTP status code.
    pub status_code: u16,
}

/// Acceptable versions for a workflow type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WorkflowTypeVersion {
    /// One or more acceptable versions for the workflow type.
    #[serde(default)]
    pub workflow_type_version: Vec<String>,
}

/// The service descriptor held in the service-info singleton.
///
/// Only `workflow_type_versions` is interpreted by the gateway (for the
/// admission compatibility check); everything else is carried through
/// verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfoDocument {
    /// Workflow types and versions supported by this service.
    pub workflow_type_versions: BTreeMap<String, WorkflowTypeVersion>,
    /// All remaining descriptor fields, passed through unmodified.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub rest: serde_json::Map<String, Value>,
}

impl ServiceInfoDocument {
    /// Checks whether a workflow type and version pair is supported.
    pub fn supports(&self, workflow_type: &str, version: &str) -> bool {
        self.workflow_type_versions
            .get(workflow_type)
            .map(|v| v.workflow_type_version.iter().any(|w| w == version))
            .unwrap_or(false)
    }
}

/// Response model for `GET /service-info`: the stored descriptor augmented
/// with live per-state run counts.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The stored service descriptor.
    #[serde(flatten)]
    pub document: ServiceInfoDocument,
    /// The number of runs currently in each state.
    pub system_state_counts: BTreeMap<String, i64>,
}
