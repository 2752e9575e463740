//! Service-info API handlers.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;

use super::AppState;
use super::error::Error;
use crate::model::ServiceInfo;
use crate::model::ServiceInfoDocument;
use crate::service_info;

/// Get the service descriptor with live run-state counts.
#[utoipa::path(
    get,
    path = "/service-info",
    responses(
        (status = 200, description = "Service info retrieved", body = ServiceInfo),
        (status = 404, description = "Service info has never been set"),
    ),
    tag = "service-info"
)]
pub async fn get_service_info(
    State(state): State<AppState>,
) -> Result<Json<ServiceInfo>, Error> {
    let response = service_info::get_service_info(state.db.as_ref()).await?;
    Ok(Json(response))
}

/// Replace the service descriptor.
#[utoipa::path(
    post,
    path = "/service-info",
    request_body = ServiceInfoDocument,
    responses(
        (status = 201, description = "Service info replaced"),
        (status = 400, description = "Malformed descriptor"),
    ),
    tag = "service-info"
)]
pub async fn post_service_info(
    State(state): State<AppState>,
    document: Result<Json<ServiceInfoDocument>, JsonRejection>,
) -> Result<StatusCode, Error> {
    let Json(document) = document
        .map_err(|rejection| Error::BadRequest(format!("malformed descriptor: {rejection}")))?;

    service_info::set_service_info(state.db.as_ref(), &document).await?;
    Ok(StatusCode::CREATED)
}
