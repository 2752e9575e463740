//! Shared helpers for API tests: a scriptable upstream engine stub, server
//! construction, and request utilities.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::Multipart;
use axum::extract::Path as UrlPath;
use axum::extract::State;
use axum::http::Request;
use axum::http::StatusCode;
use axum::routing::get;
use axum::routing::post;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::ServiceExt;
use wes_gateway::Config;
use wes_gateway::db::Database;
use wes_gateway::db::SqliteDatabase;
use wes_gateway::model::RunDocument;
use wes_gateway::model::RunLog;
use wes_gateway::model::RunRequest;
use wes_gateway::model::ServiceInfoDocument;
use wes_gateway::model::State as RunState;
use wes_gateway::model::WesEndpoint;
use wes_gateway::server::AppState;
use wes_gateway::server::create_router;
use wes_gateway::tracker::TrackerSvc;
use wes_gateway::wes::ConfiguredEndpoint;
use wes_gateway::wes::EndpointSelector;

/// The multipart boundary used by test requests.
pub const BOUNDARY: &str = "gateway-test-boundary";

/// A run request as observed by the stub engine.
#[derive(Debug, Clone)]
pub struct ForwardedRun {
    /// The form fields of the forwarded request.
    pub fields: BTreeMap<String, String>,
    /// The filenames of the forwarded attachments.
    pub attachments: Vec<String>,
}

/// Scriptable state of the stub engine.
#[derive(Debug)]
pub struct StubState {
    /// The reply to `POST /runs`.
    forward_reply: Mutex<Value>,
    /// Replies to `GET /runs/{id}`; the last entry repeats.
    run_logs: Mutex<VecDeque<Value>>,
    /// Replies to `GET /runs/{id}/status`; the last entry repeats.
    statuses: Mutex<VecDeque<Value>>,
    /// Run identifiers received on `POST /runs/{id}/cancel`.
    cancels: Mutex<Vec<String>>,
    /// Requests received on `POST /runs`.
    forwards: Mutex<Vec<ForwardedRun>>,
    /// Number of status polls received.
    status_calls: AtomicUsize,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            forward_reply: Mutex::new(json!({"run_id": "REMOTE1"})),
            run_logs: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            cancels: Mutex::new(Vec::new()),
            forwards: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
        }
    }
}

/// Pops the front of a scripted reply queue, keeping the last entry so that
/// it repeats on subsequent calls.
fn pop_scripted(queue: &Mutex<VecDeque<Value>>) -> Value {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue
            .front()
            .cloned()
            .unwrap_or_else(|| json!({"msg": "nothing scripted", "status_code": 500}))
    }
}

/// A stub upstream engine served on an ephemeral local listener.
pub struct StubWes {
    /// Base URL of the stub (host only; the WES base path is appended by the
    /// client under test).
    url: String,
    /// The scriptable state.
    state: Arc<StubState>,
}

impl StubWes {
    /// Spawns a stub engine.
    pub async fn spawn() -> Self {
        let state = Arc::new(StubState::default());

        let router = Router::new()
            .route("/ga4gh/wes/v1/service-info", get(stub_service_info))
            .route("/ga4gh/wes/v1/runs", post(stub_submit))
            .route("/ga4gh/wes/v1/runs/{run_id}", get(stub_run_log))
            .route("/ga4gh/wes/v1/runs/{run_id}/status", get(stub_status))
            .route("/ga4gh/wes/v1/runs/{run_id}/cancel", post(stub_cancel))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { url, state }
    }

    /// The base URL of the stub.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Scripts the reply to `POST /runs`.
    pub fn set_forward_reply(&self, reply: Value) {
        *self.state.forward_reply.lock().unwrap() = reply;
    }

    /// Appends a reply for `GET /runs/{id}`.
    pub fn push_run_log(&self, log: Value) {
        self.state.run_logs.lock().unwrap().push_back(log);
    }

    /// Appends a reply for `GET /runs/{id}/status`.
    pub fn push_status(&self, status: Value) {
        self.state.statuses.lock().unwrap().push_back(status);
    }

    /// Replaces all scripted status replies.
    pub fn set_status(&self, status: Value) {
        let mut statuses = self.state.statuses.lock().unwrap();
        statuses.clear();
        statuses.push_back(status);
    }

    /// The run identifiers canceled so far.
    pub fn cancels(&self) -> Vec<String> {
        self.state.cancels.lock().unwrap().clone()
    }

    /// The run requests forwarded so far.
    pub fn forwards(&self) -> Vec<ForwardedRun> {
        self.state.forwards.lock().unwrap().clone()
    }

    /// The number of status polls received so far.
    pub fn status_calls(&self) -> usize {
        self.state.status_calls.load(Ordering::SeqCst)
    }
}

/// Stub handler for `GET /service-info`.
async fn stub_service_info() -> Json<Value> {
    Json(serde_json::to_value(cwl_service_info()).unwrap())
}

/// Stub handler for `POST /runs`.
async fn stub_submit(
    State(state): State<Arc<StubState>>,
    mut multipart: Multipart,
) -> Json<Value> {
    let mut fields = BTreeMap::new();
    let mut attachments = Vec::new();

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if name == "workflow_attachment" {
            attachments.push(field.file_name().unwrap_or_default().to_string());
            let _ = field.bytes().await.unwrap();
        } else {
            fields.insert(name, field.text().await.unwrap());
        }
    }

    state.forwards.lock().unwrap().push(ForwardedRun {
        fields,
        attachments,
    });
    Json(state.forward_reply.lock().unwrap().clone())
}

/// Stub handler for `GET /runs/{id}`.
async fn stub_run_log(
    State(state): State<Arc<StubState>>,
    UrlPath(_run_id): UrlPath<String>,
) -> Json<Value> {
    Json(pop_scripted(&state.run_logs))
}

/// Stub handler for `GET /runs/{id}/status`.
async fn stub_status(
    State(state): State<Arc<StubState>>,
    UrlPath(_run_id): UrlPath<String>,
) -> Json<Value> {
    state.status_calls.fetch_add(1, Ordering::SeqCst);
    Json(pop_scripted(&state.statuses))
}

/// Stub handler for `POST /runs/{id}/cancel`.
async fn stub_cancel(
    State(state): State<Arc<StubState>>,
    UrlPath(run_id): UrlPath<String>,
) -> Json<Value> {
    state.cancels.lock().unwrap().push(run_id.clone());
    Json(json!({"run_id": run_id}))
}

/// A service descriptor supporting `CWL v1.0`.
pub fn cwl_service_info() -> ServiceInfoDocument {
    serde_json::from_value(json!({
        "workflow_type_versions": {
            "CWL": {"workflow_type_version": ["v1.0"]},
        },
    }))
    .unwrap()
}

/// Builds a test configuration pointed at the given upstream.
pub fn test_config(upstream_url: &str, storage_path: &Path) -> Config {
    let mut config = Config::default();
    config.wes.host = upstream_url.to_string();
    config.post_runs.storage_path = storage_path.to_path_buf();
    config.post_runs.polling_wait = 0.02;
    config.post_runs.polling_attempts = 3;
    config
}

/// Creates a test server from an explicit configuration.
pub async fn create_test_server_with_config(
    pool: SqlitePool,
    config: Config,
) -> (Router, Arc<dyn Database>) {
    let db: Arc<dyn Database> = Arc::new(SqliteDatabase::from_pool(pool).await.unwrap());

    let (_, tracker) =
        TrackerSvc::spawn(config.post_runs.clone(), config.defaults.clone(), db.clone());
    let selector: Arc<dyn EndpointSelector> = Arc::new(ConfiguredEndpoint {
        host: config.wes.host.clone(),
        base_path: config.wes.base_path.clone(),
    });

    let state = AppState {
        config: Arc::new(config),
        db: db.clone(),
        selector,
        tracker,
    };

    (create_router(state), db)
}

/// Creates a test server with a fresh workspace and a registered service
/// descriptor supporting `CWL v1.0`.
pub async fn create_test_server(
    pool: SqlitePool,
    upstream_url: &str,
) -> (Router, Arc<dyn Database>, TempDir) {
    let temp = TempDir::new().unwrap();
    let storage = temp.path().join("runs");
    std::fs::create_dir(&storage).unwrap();

    let config = test_config(upstream_url, &storage);
    let (app, db) = create_test_server_with_config(pool, config).await;
    db.set_service_info(&cwl_service_info()).await.unwrap();

    (app, db, temp)
}

/// The form fields of a valid run request.
pub fn valid_run_fields() -> Vec<(&'static str, &'static str)> {
    vec![
        ("workflow_params", r#"{"a":1}"#),
        ("workflow_type", "CWL"),
        ("workflow_type_version", "v1.0"),
        ("workflow_url", "file:///x.cwl"),
    ]
}

/// Encodes a multipart run request body.
pub fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();

    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                 name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }

    for (filename, contents) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                 name=\"workflow_attachment\"; filename=\"{filename}\"\r\nContent-Type: \
                 application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Sends a request through the router and collects the response body.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

/// Sends a run submission.
pub async fn post_run(
    app: &Router,
    fields: &[(&str, &str)],
    files: &[(&str, &[u8])],
    user: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/runs")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(user) = user {
        builder = builder.header("x-forwarded-user", user);
    }
    let request = builder
        .body(Body::from(multipart_body(fields, files)))
        .unwrap();

    send(app, request).await
}

/// Sends a GET request, optionally as a given user.
pub async fn get_as(app: &Router, uri: &str, user: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-forwarded-user", user);
    }
    send(app, builder.body(Body::empty()).unwrap()).await
}

/// Polls the store until a run matches a predicate or the timeout expires.
pub async fn poll_for_document<F>(
    db: &Arc<dyn Database>,
    run_id: &str,
    predicate: F,
    timeout_secs: u64,
    error_msg: &str,
) -> Result<(), String>
where
    F: Fn(&RunDocument) -> bool,
{
    let poll_interval = Duration::from_millis(20);
    let max_polls = timeout_secs * 1000 / 20;

    for _ in 0..max_polls {
        tokio::time::sleep(poll_interval).await;

        let document = db
            .get_run_by_run_id(run_id)
            .await
            .map_err(|e| format!("store error: {}", e))?
            .ok_or_else(|| String::from("run not found"))?;

        if predicate(&document) {
            return Ok(());
        }
    }

    Err(format!("{} (timeout: {} seconds)", error_msg, timeout_secs))
}

/// Polls the store until a run reaches the expected state.
pub async fn poll_for_state(
    db: &Arc<dyn Database>,
    run_id: &str,
    expected: RunState,
    timeout_secs: u64,
) -> Result<(), String> {
    poll_for_document(
        db,
        run_id,
        |document| document.run_log.state == expected,
        timeout_secs,
        &format!("run did not reach state {:?}", expected),
    )
    .await
}

/// Builds a run document for direct insertion into the store.
pub fn make_document(run_id: &str, task_id: &str, user_id: Option<&str>) -> RunDocument {
    let request = RunRequest::from_form(
        valid_run_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
    .unwrap();

    RunDocument {
        task_id: task_id.to_string(),
        user_id: user_id.map(str::to_string),
        work_dir: std::env::temp_dir().join(run_id),
        attachments: Vec::new(),
        wes_endpoint: WesEndpoint {
            host: String::from("http://upstream.invalid"),
            base_path: WesEndpoint::default_base_path(),
            run_id: Some(format!("remote-{run_id}")),
        },
        run_log: RunLog {
            run_id: run_id.to_string(),
            request,
            state: RunState::default(),
            run_log: None,
            task_logs: Vec::new(),
            outputs: None,
        },
        created_at: Utc::now(),
    }
}
