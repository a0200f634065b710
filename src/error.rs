//! # Error Handling
//!
//! Unified HTTP error envelope for the service: problem+json bodies carrying a
//! machine-readable `code`, a human-readable `error` message and the request
//! trace id.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    #[serde(rename = "error")]
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                // Outside a request scope: short correlation id for log matching
                let correlation = uuid::Uuid::new_v4().simple().to_string();
                Some(format!("corr-{}", &correlation[..8]).into_boxed_str())
            })
    }
}

/// Returns true when the database rejected a write because of a unique index.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::{RuntimeErr, SqlErr};

    if matches!(error.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );
        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        internal_error(None)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error (400), optionally with field details
pub fn validation_error(message: &str, field_errors: Option<serde_json::Value>) -> ApiError {
    let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message);
    match field_errors {
        Some(details) => error.with_details(details),
        None => error,
    }
}

/// Create an internal error (500) with a generic or supplied message
pub fn internal_error(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("An internal error occurred");
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_SERVER_ERROR",
        msg,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::{Value, json};

    #[test]
    fn validation_error_carries_field_details() {
        let error = validation_error("Invalid query", Some(json!({"org_id": "required"})));

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code.as_ref(), "VALIDATION_FAILED");
        assert_eq!(error.details, Some(Box::new(json!({"org_id": "required"}))));
    }

    #[tokio::test]
    async fn response_body_uses_error_field_and_problem_json() {
        let response =
            ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "connection not found").into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "connection not found");
        assert_eq!(json["code"], "NOT_FOUND");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn anyhow_errors_hide_their_message() {
        let api_error: ApiError = anyhow::anyhow!("secret internals").into();

        assert_eq!(api_error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api_error.message.as_ref(), "An internal error occurred");
    }

    #[test]
    fn record_not_found_maps_to_404() {
        let api_error: ApiError = sea_orm::DbErr::RecordNotFound("connection".to_string()).into();

        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert!(api_error.message.contains("connection"));
    }

    #[test]
    fn trace_id_falls_back_to_correlation_id() {
        let error = internal_error(None);
        let trace_id = error.trace_id.unwrap();

        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[tokio::test]
    async fn trace_id_comes_from_active_context() {
        let error = telemetry::with_trace_context(
            telemetry::TraceContext {
                trace_id: "req-42".to_string(),
            },
            async { unauthorized(None) },
        )
        .await;

        assert_eq!(error.trace_id.as_deref(), Some("req-42"));
        assert_eq!(error.message.as_ref(), "Authentication required");
    }
}
