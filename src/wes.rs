//! Client for upstream GA4GH WES engines and upstream endpoint selection.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::io::ReaderStream;

use crate::model::Attachment;
use crate::model::ErrorResponse;
use crate::model::RemoteRunLog;
use crate::model::RunId;
use crate::model::RunRequest;
use crate::model::RunStatus;
use crate::model::ServiceInfoDocument;
use crate::model::WesEndpoint;

/// Errors produced when talking to an upstream engine.
#[derive(Debug, thiserror::Error)]
pub enum WesClientError {
    /// The upstream engine could not be reached, or its response could not be
    /// decoded as JSON.
    #[error("external workflow engine unavailable")]
    EngineUnavailable(#[source] reqwest::Error),

    /// The upstream engine answered with its error shape.
    #[error("upstream engine returned status {}: {}", .0.status_code, .0.msg.as_deref().unwrap_or("(no message)"))]
    Upstream(ErrorResponse),

    /// The upstream engine answered with JSON matching neither the expected
    /// shape nor the error shape.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(Value),

    /// An attachment could not be read for forwarding.
    #[error("failed to read attachment `{path}`")]
    Attachment {
        /// Path of the attachment.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Classifies a decoded upstream response body.
///
/// The body is first validated against the expected success shape `T`; if
/// that fails, against the WES error shape; if neither matches, the raw body
/// is surfaced as [`WesClientError::InvalidResponse`].
fn classify<T: DeserializeOwned>(body: Value) -> Result<T, WesClientError> {
    if let Ok(reply) = serde_json::from_value::<T>(body.clone()) {
        return Ok(reply);
    }
    match serde_json::from_value::<ErrorResponse>(body.clone()) {
        Ok(error) => Err(WesClientError::Upstream(error)),
        Err(_) => Err(WesClientError::InvalidResponse(body)),
    }
}

/// A client for one upstream WES endpoint.
///
/// The client holds a persistent HTTP connection pool, the bearer token of
/// the originating request (if any), and the endpoint's base URL.
#[derive(Debug, Clone)]
pub struct WesClient {
    /// The joined base URL of the upstream WES API.
    url: String,
    /// Bearer token forwarded with every request, if set.
    token: Option<String>,
    /// The underlying HTTP client.
    client: reqwest::Client,
}

impl WesClient {
    /// Creates a client for the given endpoint coordinates.
    ///
    /// The base URL is formed by joining the host (stripped of trailing
    /// slashes) and the base path (stripped of surrounding slashes).
    pub fn new(host: &str, base_path: &str, token: Option<String>) -> Self {
        Self {
            url: format!(
                "{}/{}",
                host.trim_end_matches('/'),
                base_path.trim_matches('/')
            ),
            token,
            client: reqwest::Client::new(),
        }
    }

    /// Creates a client for the endpoint recorded in a [`WesEndpoint`].
    pub fn for_endpoint(endpoint: &WesEndpoint, token: Option<String>) -> Self {
        Self::new(&endpoint.host, &endpoint.base_path, token)
    }

    /// The joined base URL of the upstream WES API.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Builds a request with the standard headers applied.
    fn request(&self, method: Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Sends a request and decodes the response body as JSON.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        timeout: Option<Duration>,
    ) -> Result<Value, WesClientError> {
        let builder = match timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        };
        let response = builder
            .send()
            .await
            .map_err(WesClientError::EngineUnavailable)?;
        response
            .json()
            .await
            .map_err(WesClientError::EngineUnavailable)
    }

    /// Forwards a workflow run request, attaching the given files as
    /// `workflow_attachment` parts streamed from the workspace.
    pub async fn forward_run(
        &self,
        request: &RunRequest,
        attachments: &[Attachment],
        timeout: Option<Duration>,
    ) -> Result<RunId, WesClientError> {
        let mut form = reqwest::multipart::Form::new()
            .text("workflow_params", request.workflow_params.clone())
            .text("workflow_type", request.workflow_type.clone())
            .text(
                "workflow_type_version",
                request.workflow_type_version.clone(),
            )
            .text("tags", request.tags.clone())
            .text(
                "workflow_engine_parameters",
                request.workflow_engine_parameters.clone(),
            )
            .text("workflow_url", request.workflow_url.clone());

        for attachment in attachments {
            let file = tokio::fs::File::open(&attachment.path).await.map_err(|e| {
                WesClientError::Attachment {
                    path: attachment.path.clone(),
                    source: e,
                }
            })?;
            let part =
                reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(
                    file,
                )))
                .file_name(attachment.filename.clone());
            form = form.part("workflow_attachment", part);
        }

        let builder = self
            .request(Method::POST, format!("{}/runs", self.url))
            .multipart(form);
        classify(self.send(builder, timeout).await?)
    }

    /// Retrieves the full run log for a run on the upstream engine.
    ///
    /// Upstream implementations diverge from the WES schema here, so the
    /// response is decoded into a record with every field optional rather
    /// than strictly validated.
    pub async fn get_run(&self, run_id: &str) -> Result<RemoteRunLog, WesClientError> {
        let builder = self.request(Method::GET, format!("{}/runs/{}", self.url, run_id));
        let body = self.send(builder, None).await?;
        serde_json::from_value(body.clone())
            .map_err(|_| WesClientError::InvalidResponse(body))
    }

    /// Retrieves status information for a run on the upstream engine.
    pub async fn get_run_status(
        &self,
        run_id: &str,
        timeout: Option<Duration>,
    ) -> Result<RunStatus, WesClientError> {
        let builder = self.request(
            Method::GET,
            format!("{}/runs/{}/status", self.url, run_id),
        );
        classify(self.send(builder, timeout).await?)
    }

    /// Cancels a run on the upstream engine.
    pub async fn cancel_run(&self, run_id: &str) -> Result<RunId, WesClientError> {
        let builder = self.request(
            Method::POST,
            format!("{}/runs/{}/cancel", self.url, run_id),
        );
        classify(self.send(builder, None).await?)
    }

    /// Retrieves the service descriptor of the upstream engine.
    pub async fn get_service_info(&self) -> Result<ServiceInfoDocument, WesClientError> {
        let builder = self.request(Method::GET, format!("{}/service-info", self.url));
        classify(self.send(builder, None).await?)
    }
}

/// Selects the upstream endpoint a run request is forwarded to.
pub trait EndpointSelector: Send + Sync {
    /// Picks an endpoint for the given request.
    fn select(&self, request: &RunRequest) -> WesEndpoint;
}

/// An endpoint selector that always returns the configured endpoint.
#[derive(Debug, Clone)]
pub struct ConfiguredEndpoint {
    /// The configured upstream host.
    pub host: String,
    /// The configured upstream base path.
    pub base_path: String,
}

impl EndpointSelector for ConfiguredEndpoint {
    fn select(&self, _request: &RunRequest) -> WesEndpoint {
        WesEndpoint {
            host: self.host.clone(),
            base_path: self.base_path.clone(),
            run_id: None,
        }
    }
}
