use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::error;

use crate::db::MessageQuery;
use crate::error::{ChatApiErrorKind, Error};
use crate::models::{Message, Status};
use crate::service::QueryService;

pub fn router(service: QueryService) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/messages", get(get_messages))
        .route("/messages/unread", get(get_unread))
        .route("/messages/mark-read", post(mark_read))
        .route("/messages/send", post(send_message))
        .route("/polling/boost", post(boost))
        .route("/status", get(status))
        .with_state(service)
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Error::validation(rejection.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ChatApi(e) => match e.kind {
                ChatApiErrorKind::AuthExpired => StatusCode::UNAUTHORIZED,
                ChatApiErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ChatApiErrorKind::Network | ChatApiErrorKind::Unknown => StatusCode::BAD_GATEWAY,
            },
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn get_messages(
    State(service): State<QueryService>,
    query: Result<Query<MessageQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Message>>> {
    let Query(query) = query.inspect_err(|_| service.record_activity())?;
    Ok(Json(service.get_messages(&query).await?))
}

/// `count` is the full unread total even when `messages` is capped.
async fn get_unread(State(service): State<QueryService>) -> ApiResult<Json<Value>> {
    let messages = service.get_unread().await?;
    let count = service.unread_count().await?;
    Ok(Json(json!({ "count": count, "messages": messages })))
}

#[derive(Debug, Default, Deserialize)]
struct MarkReadBody {
    timestamp: Option<DateTime<Utc>>,
}

async fn mark_read(State(service): State<QueryService>, body: Bytes) -> ApiResult<Json<Value>> {
    // The body is optional; an empty one means "now".
    let body: MarkReadBody = if body.iter().all(u8::is_ascii_whitespace) {
        MarkReadBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            service.record_activity();
            Error::validation(format!("invalid mark-read body: {}", e))
        })?
    };
    let marker = service.mark_read(body.timestamp).await?;
    Ok(Json(json!({ "read_marker": marker })))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    text: String,
}

async fn send_message(
    State(service): State<QueryService>,
    body: Result<Json<SendBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body.inspect_err(|_| service.record_activity())?;
    let message = service.send(&body.text).await?;
    Ok(Json(json!({ "status": "sent", "message": message })))
}

async fn boost(State(service): State<QueryService>) -> Json<Value> {
    Json(json!({ "poll_mode": service.boost() }))
}

async fn status(State(service): State<QueryService>) -> ApiResult<Json<Status>> {
    Ok(Json(service.status().await?))
}
