//! Shared request plumbing: caller context, option parsing, tracking and
//! the FDSN error page.

use std::sync::Arc;

use axum::{
    extract::Query,
    http::{header, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use seisws_access::Identity;
use seisws_track::{RequestInfo, RequestLogTracker, TrackerList};
use seisws_types::{NoDataStatus, RequestOptions, Service, ServiceError};
use thiserror::Error;

use crate::AppState;

pub const AVAILABILITY_VERSION: &str = "1.0.1";
pub const DATASELECT_VERSION: &str = "1.1.3";

/// Who is calling, attached to every service request by the middleware.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// Set only when HTTP Basic credentials were verified.
    pub identity: Option<Identity>,
    pub user_name: Option<String>,
    pub client_ip: String,
    pub user_agent: String,
}

/// What the error page needs to know about the request it answers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub uri: String,
    pub version: &'static str,
    pub no_data: NoDataStatus,
}

impl RequestContext {
    pub fn new(uri: &Uri, version: &'static str) -> Self {
        Self {
            uri: uri.to_string(),
            version,
            no_data: NoDataStatus::NoContent,
        }
    }

    pub fn fail(&self, error: ServiceError) -> ApiError {
        ApiError::Service {
            error,
            context: self.clone(),
        }
    }
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{error}")]
    Service {
        error: ServiceError,
        context: RequestContext,
    },
    #[error("authentication required")]
    Unauthorized,
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

fn status_for(error: &ServiceError, no_data: NoDataStatus) -> StatusCode {
    match error {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::AuthorizationDenied => StatusCode::FORBIDDEN,
        ServiceError::EmptyResult(_) => {
            StatusCode::from_u16(no_data.code()).unwrap_or(StatusCode::NO_CONTENT)
        }
        ServiceError::SourceFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::OversizeRequest(_) => StatusCode::PAYLOAD_TOO_LARGE,
    }
}

/// Plain-text FDSN error body.
pub fn error_page(status: StatusCode, message: &str, uri: &str, version: &str) -> String {
    let path = uri.split('?').next().unwrap_or(uri);
    let reference = match path.rfind('/') {
        Some(i) => &path[..=i],
        None => "/",
    };
    format!(
        "Error {}: {}\n\n{}\n\nUsage details are available from {}\n\nRequest:\n{}\n\n\
         Request Submitted:\n{}\n\nService Version:\n{}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        message,
        reference,
        uri,
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
        version
    )
}

fn text_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Service { error, context } => {
                let status = status_for(&error, context.no_data);
                match &error {
                    ServiceError::EmptyResult(msg) => {
                        tracing::debug!(uri = %context.uri, reason = %msg, "no data")
                    }
                    ServiceError::AuthorizationDenied => {
                        tracing::info!(uri = %context.uri, "access denied")
                    }
                    _ => tracing::warn!(
                        uri = %context.uri,
                        status = status.as_u16(),
                        error = %error,
                        "responding with error"
                    ),
                }
                if status == StatusCode::NO_CONTENT {
                    return status.into_response();
                }
                text_response(
                    status,
                    error_page(status, &error.to_string(), &context.uri, context.version),
                )
            }
            ApiError::Unauthorized => {
                let mut response = text_response(
                    StatusCode::UNAUTHORIZED,
                    "Error 401: Unauthorized\n\nvalid credentials required\n".to_string(),
                );
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"FDSNWS\""),
                );
                response
            }
            ApiError::InternalServerError(msg) => {
                tracing::error!(error = %msg, "internal server error");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error 500: Internal Server Error\n\n{msg}\n"),
                )
            }
        }
    }
}

/// Parses GET query parameters or a POST body into request options.
pub fn parse_options(
    service: Service,
    method: &Method,
    uri: &Uri,
    body: &str,
) -> Result<RequestOptions, ServiceError> {
    if method == Method::POST {
        return RequestOptions::from_post(service, body);
    }
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map_err(|e| ServiceError::invalid(e.body_text()))?;
    RequestOptions::from_query(service, &pairs)
}

/// Runs blocking archive work off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::SourceFailure(format!("task join error: {e}")))?
}

/// Builds the tracker fan-out for one request.
pub fn tracker_for(state: &AppState, caller: &Caller, service: Service) -> Arc<TrackerList> {
    let info = RequestInfo {
        request_id: uuid::Uuid::new_v4().to_string(),
        service: service.as_str().to_string(),
        user_name: caller
            .user_name
            .clone()
            .or_else(|| state.tracking.default_user.clone()),
        client_ip: caller.client_ip.clone(),
        user_agent: caller.user_agent.clone(),
    };

    let mut trackers = TrackerList::new();
    if state.tracking.request_log {
        trackers.push(Arc::new(RequestLogTracker::new(
            &info,
            &state.tracking.user_salt,
        )));
    }
    if let Some(writer) = &state.tracking.db_writer {
        trackers.push(Arc::new(writer.tracker(info)));
    }
    Arc::new(trackers)
}
