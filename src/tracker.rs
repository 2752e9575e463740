//! The background run tracking service.
//!
//! One tracker execution per admitted run: it mirrors the upstream run log
//! into the local document, polls the upstream engine for state changes until
//! the run finishes, and mirrors the final log. Trackers are idempotent at
//! the document level, so re-enqueueing one after a restart is safe.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::config::DefaultsConfig;
use crate::config::PostRunsConfig;
use crate::db::ConnectorError;
use crate::db::Database;
use crate::db::DatabaseError;
use crate::db::RunConnector;
use crate::model::RunLogPatch;
use crate::model::State;
use crate::model::WesEndpoint;
use crate::wes::WesClient;
use crate::wes::WesClientError;

/// Channel capacity for tracker commands.
///
/// This number represents a reasonable, arbitrary buffer size to handle burst
/// admission.
const COMMANDS_CHANNEL_CAPACITY: usize = 1024;

/// A receiver for commands issued to the tracker service.
type Rx = mpsc::Receiver<TrackerCmd>;

/// Commands sent to the tracker service.
#[derive(Debug)]
pub enum TrackerCmd {
    /// Track the progress of a forwarded run.
    Track {
        /// The task identifier keying the run document.
        task_id: String,
        /// The upstream endpoint, including the remote run identifier.
        endpoint: WesEndpoint,
        /// Bearer token to pass along with upstream requests.
        token: Option<String>,
    },
}

/// The tracker service is not running.
#[derive(Debug, thiserror::Error)]
#[error("tracker service is not running")]
pub struct TrackerClosed;

/// A handle for enqueueing work onto the tracker service.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    /// The command transmitter.
    tx: mpsc::Sender<TrackerCmd>,
}

impl TrackerHandle {
    /// Enqueues progress tracking for a forwarded run.
    pub async fn track(
        &self,
        task_id: String,
        endpoint: WesEndpoint,
        token: Option<String>,
    ) -> Result<(), TrackerClosed> {
        self.tx
            .send(TrackerCmd::Track {
                task_id,
                endpoint,
                token,
            })
            .await
            .map_err(|_| TrackerClosed)
    }
}

/// The run tracking service.
///
/// An actor that picks up `Track` commands and spawns one worker per run.
/// The service ends its execution when every handle has been dropped.
#[allow(missing_debug_implementations)]
pub struct TrackerSvc {
    /// Settings for polling and time limits.
    post_runs: PostRunsConfig,
    /// Global defaults for outgoing requests.
    defaults: DefaultsConfig,
    /// A handle to the run store.
    db: Arc<dyn Database>,
    /// The receiver for commands.
    rx: Rx,
}

impl TrackerSvc {
    /// Creates a new tracker service.
    pub fn new(
        post_runs: PostRunsConfig,
        defaults: DefaultsConfig,
        db: Arc<dyn Database>,
        rx: Rx,
    ) -> Self {
        Self {
            post_runs,
            defaults,
            db,
            rx,
        }
    }

    /// Runs the command loop.
    pub async fn run(mut self) {
        info!("run tracker service started");

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                TrackerCmd::Track {
                    task_id,
                    endpoint,
                    token,
                } => {
                    trace!(?task_id, "received `Track` command");

                    let db = self.db.clone();
                    let post_runs = self.post_runs.clone();
                    let defaults = self.defaults.clone();
                    tokio::spawn(async move {
                        run_tracker(db, post_runs, defaults, task_id, endpoint, token).await;
                    });
                }
            }
        }

        info!("run tracker service stopped");
    }

    /// Spawns a new tracker service and returns the join handle of the
    /// command loop and a handle for enqueueing work.
    pub fn spawn(
        post_runs: PostRunsConfig,
        defaults: DefaultsConfig,
        db: Arc<dyn Database>,
    ) -> (JoinHandle<()>, TrackerHandle) {
        let (tx, rx) = mpsc::channel(COMMANDS_CHANNEL_CAPACITY);
        let svc = Self::new(post_runs, defaults, db, rx);
        let handle = tokio::spawn(svc.run());
        (handle, TrackerHandle { tx })
    }
}

/// Re-enqueues trackers for runs that were in flight when the process last
/// stopped.
///
/// Runs without a remote run identifier were stranded before their forward
/// completed and cannot be resumed; they are moved to `SYSTEM_ERROR`.
/// Returns the number of re-enqueued trackers.
pub async fn recover(
    db: &Arc<dyn Database>,
    handle: &TrackerHandle,
) -> Result<usize, DatabaseError> {
    let mut resumed = 0;

    for document in db.list_unfinished_runs().await? {
        if document.wes_endpoint.run_id.is_some() {
            info!(
                "resuming tracker for run `{}` (task `{}`)",
                document.run_log.run_id, document.task_id
            );
            if handle
                .track(document.task_id, document.wes_endpoint, None)
                .await
                .is_ok()
            {
                resumed += 1;
            }
        } else {
            warn!(
                "run `{}` (task `{}`) was stranded before its forward completed",
                document.run_log.run_id, document.task_id
            );
            db.update_run_state(&document.task_id, State::SystemError)
                .await?;
        }
    }

    Ok(resumed)
}

/// Runs one tracker under the configured soft time limit.
async fn run_tracker(
    db: Arc<dyn Database>,
    post_runs: PostRunsConfig,
    defaults: DefaultsConfig,
    task_id: String,
    endpoint: WesEndpoint,
    token: Option<String>,
) {
    let id = task_id.clone();
    let fut = track_run_progress(db, &post_runs, &defaults, task_id, endpoint, token);

    let result = match post_runs.timeout_job() {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                // The soft time limit fired; the document keeps its last
                // observed state.
                warn!("[{id}] tracker soft time limit expired");
                return;
            }
        },
        None => fut.await,
    };

    if let Err(e) = result {
        error!("[{id}] tracker failed: {e}");
    }
}

/// Error type for a tracker execution.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// A connector error.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// An upstream engine error.
    #[error(transparent)]
    Engine(#[from] WesClientError),

    /// The upstream engine kept answering with invalid responses.
    #[error("received too many error responses from the upstream engine")]
    EngineProblem,

    /// The run has no identifier on the upstream engine.
    #[error("no run identifier on the upstream engine for task `{0}`")]
    MissingRemoteRunId(String),
}

/// Tracks one run to completion, mirroring upstream state and logs into the
/// run document.
///
/// Returns the task identifier on success.
pub async fn track_run_progress(
    db: Arc<dyn Database>,
    post_runs: &PostRunsConfig,
    defaults: &DefaultsConfig,
    task_id: String,
    endpoint: WesEndpoint,
    token: Option<String>,
) -> Result<String, TrackerError> {
    info!("[{task_id}] start processing");

    let remote_run_id = endpoint
        .run_id
        .clone()
        .ok_or_else(|| TrackerError::MissingRemoteRunId(task_id.clone()))?;
    let client = WesClient::for_endpoint(&endpoint, token);
    let connector = RunConnector::new(db, task_id.clone());

    connector.update_run_state(State::Initializing).await?;

    // Mirror the initial run log.
    let remote_log = match client.get_run(&remote_run_id).await {
        Ok(log) => log,
        Err(e) => {
            connector.update_run_state(State::SystemError).await?;
            return Err(e.into());
        }
    };
    let document = connector
        .merge_run_log(&RunLogPatch::from(remote_log))
        .await?;

    // Track run progress until the run finishes.
    let mut run_state = document.run_log.state;
    let mut attempt: u32 = 1;
    while !run_state.is_finished() {
        tokio::time::sleep(post_runs.polling_wait()).await;

        let status = match client
            .get_run_status(&remote_run_id, Some(defaults.timeout()))
            .await
        {
            Ok(status) => status,
            Err(e @ WesClientError::EngineUnavailable(_)) => {
                attempt += 1;
                if attempt <= post_runs.polling_attempts {
                    warn!("[{task_id}] status poll failed: {e}");
                    continue;
                }
                connector.update_run_state(State::SystemError).await?;
                return Err(e.into());
            }
            Err(e) => {
                attempt += 1;
                if attempt <= post_runs.polling_attempts {
                    warn!("[{task_id}] received error response: {e}");
                    continue;
                }
                connector.update_run_state(State::SystemError).await?;
                return Err(TrackerError::EngineProblem);
            }
        };

        attempt = 1;
        if status.state != run_state {
            run_state = status.state;
            connector.update_run_state(run_state).await?;
        }
    }

    // Mirror the final run log.
    let remote_log = match client.get_run(&remote_run_id).await {
        Ok(log) => log,
        Err(e) => {
            connector.update_run_state(State::SystemError).await?;
            return Err(e.into());
        }
    };
    connector
        .merge_run_log(&RunLogPatch::from(remote_log))
        .await?;

    info!("[{task_id}] processing completed");
    Ok(task_id)
}
