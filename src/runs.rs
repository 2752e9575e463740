//! Controllers for the `/runs` routes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tracing::error;
use tracing::info;
use uuid::Uuid;

use crate::config::ListRunsConfig;
use crate::config::PostRunsConfig;
use crate::db::ConnectorError;
use crate::db::Database;
use crate::db::DatabaseError;
use crate::db::RunConnector;
use crate::model::Attachment;
use crate::model::RunDocument;
use crate::model::RunId;
use crate::model::RunListResponse;
use crate::model::RunLog;
use crate::model::RunRequest;
use crate::model::RunRequestError;
use crate::model::RunStatus;
use crate::model::State;
use crate::model::WesEndpoint;
use crate::tracker::TrackerHandle;
use crate::wes::EndpointSelector;
use crate::wes::WesClient;
use crate::wes::WesClientError;

/// A file uploaded with a run request, held in memory until the run's
/// workspace exists.
#[derive(Debug, Clone)]
pub struct UploadedAttachment {
    /// Name of the file as indicated in the request.
    pub filename: String,
    /// The file contents.
    pub bytes: Vec<u8>,
}

/// Error type for submitting a run.
#[derive(Debug, thiserror::Error)]
pub enum SubmitRunError {
    /// The request form failed validation.
    #[error(transparent)]
    Request(#[from] RunRequestError),

    /// The requested workflow type and version are not supported.
    #[error(
        "no suitable workflow engine known for workflow type `{workflow_type}` and version \
         `{version}`"
    )]
    NoSuitableEngine {
        /// The requested workflow type.
        workflow_type: String,
        /// The requested workflow type version.
        version: String,
    },

    /// The workspace root is missing or unwritable.
    #[error("storage unavailable at `{path}`")]
    StorageUnavailable {
        /// The path that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No unique run identifier could be found.
    #[error("no unique run identifier could be found after {0} attempts")]
    IdsUnavailable(u32),

    /// A store error.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// A connector error.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// An upstream engine error.
    #[error(transparent)]
    Engine(#[from] WesClientError),

    /// The tracker service is not accepting work.
    #[error("tracker service unavailable")]
    TrackerUnavailable,
}

/// Starts a workflow run.
///
/// Validates the form, checks the requested workflow type against the live
/// service info, creates the run environment (unique identifiers, workspace
/// directory, durable document), persists the attachments, forwards the
/// request to the selected upstream endpoint, and hands the run off to the
/// background tracker. The returned identifier is the gateway-minted one.
#[allow(clippy::too_many_arguments)]
pub async fn submit_run(
    db: Arc<dyn Database>,
    selector: &dyn EndpointSelector,
    config: &PostRunsConfig,
    tracker: &TrackerHandle,
    form: BTreeMap<String, String>,
    uploads: Vec<UploadedAttachment>,
    user_id: Option<String>,
    token: Option<String>,
) -> Result<RunId, SubmitRunError> {
    let request = RunRequest::from_form(form)?;

    // The workflow type must be supported per the live service info.
    let supported = db
        .get_service_info()
        .await?
        .map(|info| info.supports(&request.workflow_type, &request.workflow_type_version))
        .unwrap_or(false);
    if !supported {
        return Err(SubmitRunError::NoSuitableEngine {
            workflow_type: request.workflow_type,
            version: request.workflow_type_version,
        });
    }

    let endpoint = selector.select(&request);

    let document =
        create_run_environment(db.as_ref(), config, &request, &endpoint, user_id, &uploads)
            .await?;

    save_attachments(&document.attachments, &uploads).await?;

    let client = WesClient::for_endpoint(&endpoint, token.clone());
    let connector = RunConnector::new(db.clone(), document.task_id.clone());

    info!(
        "forwarding run `{}` (task `{}`) to `{}`",
        document.run_log.run_id,
        document.task_id,
        client.url()
    );

    let reply = match client
        .forward_run(&request, &document.attachments, config.timeout_post())
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            // The forward failed; record the terminal state before
            // surfacing the error to the client.
            if let Err(db_err) = connector.update_run_state(State::SystemError).await {
                error!("failed to record SYSTEM_ERROR for failed forward: {db_err}");
            }
            return Err(e.into());
        }
    };

    let document = connector.set_remote_run_id(&reply.run_id).await?;

    tracker
        .track(
            document.task_id.clone(),
            document.wes_endpoint.clone(),
            token,
        )
        .await
        .map_err(|_| SubmitRunError::TrackerUnavailable)?;

    Ok(RunId {
        run_id: document.run_log.run_id,
    })
}

/// Creates the run environment: unique identifiers, workspace directory, and
/// the durable run document.
///
/// Retries with freshly minted identifiers until the directory creation and
/// document insert both succeed, up to the configured number of attempts.
async fn create_run_environment(
    db: &dyn Database,
    config: &PostRunsConfig,
    request: &RunRequest,
    endpoint: &WesEndpoint,
    user_id: Option<String>,
    uploads: &[UploadedAttachment],
) -> Result<RunDocument, SubmitRunError> {
    for _ in 0..config.db_insert_attempts {
        let run_id = generate_run_id(&config.id_charset, config.id_length);
        let task_id = Uuid::new_v4().to_string();
        let work_dir = config.storage_path.join(&run_id);

        match tokio::fs::create_dir(&work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(SubmitRunError::StorageUnavailable {
                    path: work_dir,
                    source: e,
                });
            }
        }

        let attachments = uploads
            .iter()
            .map(|upload| Attachment {
                filename: upload.filename.clone(),
                path: work_dir.join(sanitize_filename(&upload.filename, &task_id)),
            })
            .collect();

        let document = RunDocument {
            task_id,
            user_id: user_id.clone(),
            work_dir: work_dir.clone(),
            attachments,
            wes_endpoint: endpoint.clone(),
            run_log: RunLog {
                run_id,
                request: request.clone(),
                state: State::default(),
                run_log: None,
                task_logs: Vec::new(),
                outputs: None,
            },
            created_at: Utc::now(),
        };

        match db.insert_run(&document).await {
            Ok(()) => return Ok(document),
            Err(DatabaseError::Duplicate) => {
                // Another writer claimed the identifier between the directory
                // creation and the insert; clean up and mint a new one.
                let _ = tokio::fs::remove_dir(&work_dir).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(SubmitRunError::IdsUnavailable(config.db_insert_attempts))
}

/// Writes the uploaded attachment contents to their workspace paths.
async fn save_attachments(
    attachments: &[Attachment],
    uploads: &[UploadedAttachment],
) -> Result<(), SubmitRunError> {
    for (attachment, upload) in attachments.iter().zip(uploads) {
        tokio::fs::write(&attachment.path, &upload.bytes)
            .await
            .map_err(|e| SubmitRunError::StorageUnavailable {
                path: attachment.path.clone(),
                source: e,
            })?;
    }
    Ok(())
}

/// Mints a run identifier by drawing uniformly from the configured alphabet.
fn generate_run_id(charset: &str, length: usize) -> String {
    let chars: Vec<char> = charset.chars().collect();
    let mut rng = rand::rng();
    (0..length)
        .map(|_| chars[rng.random_range(0..chars.len())])
        .collect()
}

/// Returns a filesystem-safe version of an attachment filename.
///
/// Path components are discarded and disallowed characters replaced; if
/// nothing safe remains, the task identifier is used instead.
fn sanitize_filename(filename: &str, fallback: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let safe: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe.trim_matches(['.', '_']).is_empty() {
        fallback.to_string()
    } else {
        safe
    }
}

/// Checks whether a requester may access a resource.
///
/// Access is denied only when both an owner and a requester are known and
/// they differ.
fn check_access(owner: Option<&str>, requester: Option<&str>) -> bool {
    match (owner, requester) {
        (Some(owner), Some(requester)) => owner == requester,
        _ => true,
    }
}

/// Error type for resolving a single run.
#[derive(Debug, thiserror::Error)]
pub enum GetRunError {
    /// A store error.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The run was not found.
    #[error("run `{0}` not found")]
    NotFound(String),

    /// The requester is not the owner of the run.
    #[error("access to run `{0}` denied")]
    Forbidden(String),
}

/// Resolves a run by its gateway-minted identifier and checks that the
/// requester may access it.
async fn find_authorized(
    db: &dyn Database,
    run_id: &str,
    user_id: Option<&str>,
) -> Result<RunDocument, GetRunError> {
    let document = db
        .get_run_by_run_id(run_id)
        .await?
        .ok_or_else(|| GetRunError::NotFound(run_id.to_string()))?;

    if !check_access(document.user_id.as_deref(), user_id) {
        error!(
            "user `{}` is not allowed to access run `{}`",
            user_id.unwrap_or_default(),
            run_id
        );
        return Err(GetRunError::Forbidden(run_id.to_string()));
    }

    Ok(document)
}

/// Returns detailed information about a workflow run.
pub async fn get_run_log(
    db: &dyn Database,
    run_id: &str,
    user_id: Option<&str>,
) -> Result<RunLog, GetRunError> {
    let document = find_authorized(db, run_id, user_id).await?;
    Ok(document.run_log)
}

/// Returns status information about a workflow run.
pub async fn get_run_status(
    db: &dyn Database,
    run_id: &str,
    user_id: Option<&str>,
) -> Result<RunStatus, GetRunError> {
    let document = find_authorized(db, run_id, user_id).await?;
    Ok(RunStatus {
        run_id: document.run_log.run_id,
        state: document.run_log.state,
    })
}

/// Error type for listing runs.
#[derive(Debug, thiserror::Error)]
pub enum ListRunsError {
    /// A store error.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The page token is not one this service handed out.
    #[error("invalid `page_token`: `{0}`")]
    InvalidPageToken(String),

    /// The page size is out of range.
    #[error("`page_size` must be greater than zero")]
    InvalidPageSize,
}

/// Returns a page of workflow runs, newest first.
///
/// `page_token` is the token returned with the previous page; the page size
/// falls back to the configured default. When a `user_id` is given, only
/// runs owned by that user are listed.
pub async fn list_runs(
    db: &dyn Database,
    config: &ListRunsConfig,
    page_size: Option<i64>,
    page_token: Option<String>,
    user_id: Option<&str>,
) -> Result<RunListResponse, ListRunsError> {
    let page_size = page_size.unwrap_or(config.default_page_size);
    if page_size <= 0 {
        return Err(ListRunsError::InvalidPageSize);
    }

    let before = page_token
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<i64>()
                .map_err(|_| ListRunsError::InvalidPageToken(token))
        })
        .transpose()?;

    let entries = db.list_runs(user_id, before, page_size).await?;

    // An unfilled page means there is nothing beyond it.
    let next_page_token = if (entries.len() as i64) < page_size {
        String::new()
    } else {
        entries
            .last()
            .map(|entry| entry.cursor.to_string())
            .unwrap_or_default()
    };

    Ok(RunListResponse {
        next_page_token,
        runs: entries
            .into_iter()
            .map(|entry| RunStatus {
                run_id: entry.run_id,
                state: entry.state,
            })
            .collect(),
    })
}

/// Error type for canceling a run.
#[derive(Debug, thiserror::Error)]
pub enum CancelRunError {
    /// A store error.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The run was not found.
    #[error("run `{0}` not found")]
    NotFound(String),

    /// The requester is not the owner of the run.
    #[error("access to run `{0}` denied")]
    Forbidden(String),

    /// The run has no remote identifier to cancel.
    #[error("run `{0}` has no run identifier on the upstream engine")]
    MissingRemoteRunId(String),

    /// An upstream engine error.
    #[error(transparent)]
    Engine(#[from] WesClientError),
}

impl From<GetRunError> for CancelRunError {
    fn from(err: GetRunError) -> Self {
        match err {
            GetRunError::Database(e) => Self::Database(e),
            GetRunError::NotFound(id) => Self::NotFound(id),
            GetRunError::Forbidden(id) => Self::Forbidden(id),
        }
    }
}

/// Cancels a workflow run.
///
/// The cancellation is proxied to the upstream engine synchronously; the
/// local document is not written here. The background tracker observes the
/// resulting `CANCELING`/`CANCELED` state on its next poll and mirrors it.
pub async fn cancel_run(
    db: &dyn Database,
    run_id: &str,
    user_id: Option<&str>,
    token: Option<String>,
) -> Result<RunId, CancelRunError> {
    let document = find_authorized(db, run_id, user_id).await?;

    let remote_run_id = document
        .wes_endpoint
        .run_id
        .as_deref()
        .ok_or_else(|| CancelRunError::MissingRemoteRunId(run_id.to_string()))?;

    let client = WesClient::for_endpoint(&document.wes_endpoint, token);
    client.cancel_run(remote_run_id).await?;

    Ok(RunId {
        run_id: run_id.to_string(),
    })
}
