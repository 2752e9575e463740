//! Run API handlers.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::Multipart;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::rejection::QueryRejection;
use serde::Deserialize;
use serde::Serialize;
use utoipa::IntoParams;
use utoipa::ToSchema;

use super::AppState;
use super::context::RequestContext;
use super::error::Error;
use crate::model::RunId;
use crate::model::RunListResponse;
use crate::model::RunLog;
use crate::model::RunStatus;
use crate::runs;
use crate::runs::UploadedAttachment;

/// The multipart field name carrying workflow attachments.
const ATTACHMENT_FIELD: &str = "workflow_attachment";

/// Query parameters for listing runs.
#[derive(Debug, Clone, Serialize, Deserialize, IntoParams, ToSchema)]
pub struct ListRunsQueryParams {
    /// Number of results per page.
    #[serde(default)]
    pub page_size: Option<i64>,
    /// Token returned with the previous page.
    #[serde(default)]
    pub page_token: Option<String>,
}

/// Start a new workflow run.
#[utoipa::path(
    post,
    path = "/runs",
    request_body(
        content = inline(crate::model::RunRequest),
        content_type = "multipart/form-data",
        description = "WES `RunRequest` form fields plus `workflow_attachment` file parts"
    ),
    responses(
        (status = 200, description = "Run accepted", body = RunId),
        (status = 400, description = "Invalid request or unsupported workflow type"),
        (status = 401, description = "Rejected by the upstream engine"),
        (status = 403, description = "Rejected by the upstream engine"),
        (status = 500, description = "Storage, identifier, or upstream failure"),
    ),
    tag = "runs"
)]
pub async fn submit_run(
    State(state): State<AppState>,
    ctx: RequestContext,
    multipart: Multipart,
) -> Result<Json<RunId>, Error> {
    let (form, uploads) = read_run_form(multipart).await?;

    let response = runs::submit_run(
        state.db.clone(),
        state.selector.as_ref(),
        &state.config.post_runs,
        &state.tracker,
        form,
        uploads,
        ctx.user_id,
        ctx.token,
    )
    .await?;

    Ok(Json(response))
}

/// Splits a run request body into its form fields and attachments.
async fn read_run_form(
    mut multipart: Multipart,
) -> Result<(BTreeMap<String, String>, Vec<UploadedAttachment>), Error> {
    let mut form = BTreeMap::new();
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == ATTACHMENT_FIELD {
            let filename = field.file_name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::BadRequest(format!("malformed attachment part: {e}")))?;
            uploads.push(UploadedAttachment {
                filename,
                bytes: bytes.to_vec(),
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| Error::BadRequest(format!("malformed form field `{name}`: {e}")))?;
            form.insert(name, value);
        }
    }

    Ok((form, uploads))
}

/// List workflow runs.
#[utoipa::path(
    get,
    path = "/runs",
    params(ListRunsQueryParams),
    responses(
        (status = 200, description = "Runs retrieved", body = RunListResponse),
        (status = 400, description = "Invalid query parameters"),
    ),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    ctx: RequestContext,
    query: Result<Query<ListRunsQueryParams>, QueryRejection>,
) -> Result<Json<RunListResponse>, Error> {
    let Query(query) = query.map_err(|rejection| match rejection {
        QueryRejection::FailedToDeserializeQueryString(err) => {
            Error::BadRequest(format!("invalid query parameters: {}", err))
        }
        _ => Error::BadRequest(String::from("invalid query parameters")),
    })?;

    let response = runs::list_runs(
        state.db.as_ref(),
        &state.config.list_runs,
        query.page_size,
        query.page_token,
        ctx.user_id.as_deref(),
    )
    .await?;

    Ok(Json(response))
}

/// Get detailed information about a workflow run.
#[utoipa::path(
    get,
    path = "/runs/{run_id}",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run found", body = RunLog),
        (status = 403, description = "Requester is not the run owner"),
        (status = 404, description = "Run not found"),
    ),
    tag = "runs"
)]
pub async fn get_run_log(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> Result<Json<RunLog>, Error> {
    let response =
        runs::get_run_log(state.db.as_ref(), &run_id, ctx.user_id.as_deref()).await?;
    Ok(Json(response))
}

/// Get status information about a workflow run.
#[utoipa::path(
    get,
    path = "/runs/{run_id}/status",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run found", body = RunStatus),
        (status = 403, description = "Requester is not the run owner"),
        (status = 404, description = "Run not found"),
    ),
    tag = "runs"
)]
pub async fn get_run_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatus>, Error> {
    let response =
        runs::get_run_status(state.db.as_ref(), &run_id, ctx.user_id.as_deref()).await?;
    Ok(Json(response))
}

/// Cancel a workflow run.
#[utoipa::path(
    post,
    path = "/runs/{run_id}/cancel",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Cancellation forwarded", body = RunId),
        (status = 403, description = "Requester is not the run owner"),
        (status = 404, description = "Run not found"),
        (status = 500, description = "Upstream failure"),
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> Result<Json<RunId>, Error> {
    let response = runs::cancel_run(
        state.db.as_ref(),
        &run_id,
        ctx.user_id.as_deref(),
        ctx.token,
    )
    .await?;
    Ok(Json(response))
}
