use std::fmt;

use anyhow::Error as AnyError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use corelay_core::store::StoreError;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::error;

#[derive(Debug, Clone, Copy)]
struct ErrorDescriptor {
    status: StatusCode,
    name: &'static str,
    error_type: &'static str,
    default_message: &'static str,
}

const AUTH_REJECTED_DESCRIPTOR: ErrorDescriptor = ErrorDescriptor {
    status: StatusCode::UNAUTHORIZED,
    name: "AUTH_REJECTED",
    error_type: "AUTH_REJECTED",
    default_message: "Authentication rejected.",
};

const RATE_LIMITED_DESCRIPTOR: ErrorDescriptor = ErrorDescriptor {
    status: StatusCode::TOO_MANY_REQUESTS,
    name: "RATE_LIMITED",
    error_type: "RATE_LIMITED",
    default_message: "Too many connections.",
};

const VALIDATION_DESCRIPTOR: ErrorDescriptor = ErrorDescriptor {
    status: StatusCode::BAD_REQUEST,
    name: "VALIDATION",
    error_type: "VALIDATION",
    default_message: "Invalid payload.",
};

const SCOPE_NOT_FOUND_DESCRIPTOR: ErrorDescriptor = ErrorDescriptor {
    status: StatusCode::NOT_FOUND,
    name: "SCOPE_NOT_FOUND",
    error_type: "SCOPE_NOT_FOUND",
    default_message: "Scope not found.",
};

const STORE_UNAVAILABLE_DESCRIPTOR: ErrorDescriptor = ErrorDescriptor {
    status: StatusCode::SERVICE_UNAVAILABLE,
    name: "STORE_UNAVAILABLE",
    error_type: "STORE_UNAVAILABLE",
    default_message: "Shared store unavailable.",
};

const STORE_OPERATION_FAILED_DESCRIPTOR: ErrorDescriptor = ErrorDescriptor {
    status: StatusCode::BAD_GATEWAY,
    name: "STORE_OPERATION_FAILED",
    error_type: "STORE_OPERATION_FAILED",
    default_message: "Shared store operation failed.",
};

const INTERNAL_DESCRIPTOR: ErrorDescriptor = ErrorDescriptor {
    status: StatusCode::INTERNAL_SERVER_ERROR,
    name: "INTERNAL",
    error_type: "INTERNAL",
    default_message: "An internal error occurred.",
};

#[derive(Debug)]
pub struct AppError {
    descriptor: &'static ErrorDescriptor,
    name: String,
    message: String,
    data: Option<JsonValue>,
    source: Option<AnyError>,
}

impl AppError {
    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::from_descriptor(&AUTH_REJECTED_DESCRIPTOR, Some(message.into()))
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::from_descriptor(&RATE_LIMITED_DESCRIPTOR, Some(message.into()))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::from_descriptor(&VALIDATION_DESCRIPTOR, Some(message.into()))
    }

    pub fn scope_not_found(scope: &str) -> Self {
        let scope = scope.to_owned();
        let message = format!("Scope {scope} not found.");

        Self::from_descriptor(&SCOPE_NOT_FOUND_DESCRIPTOR, Some(message))
            .with_data(json!({ "scope": scope }))
    }

    pub fn store_unavailable() -> Self {
        Self::from_descriptor(&STORE_UNAVAILABLE_DESCRIPTOR, None)
    }

    pub fn internal(error: AnyError) -> Self {
        error!(?error, "internal gateway error");
        Self::from_descriptor(&INTERNAL_DESCRIPTOR, None).with_source(error)
    }

    pub fn from_store(error: StoreError) -> Self {
        if error.is_unavailable() {
            Self::store_unavailable()
        } else {
            Self::from_descriptor(
                &STORE_OPERATION_FAILED_DESCRIPTOR,
                Some(error.to_string()),
            )
        }
    }

    /// Stable key used for `errors_by_type` metrics.
    pub fn kind(&self) -> &str {
        self.descriptor.error_type
    }

    pub fn into_payload(self) -> (StatusCode, ErrorPayload) {
        let AppError {
            descriptor,
            name,
            message,
            data,
            source: _,
        } = self;

        let payload = ErrorPayload {
            status: descriptor.status.as_u16(),
            error_type: descriptor.error_type.to_owned(),
            name,
            message,
            data,
        };

        (descriptor.status, payload)
    }

    /// Body of the `error` event unicast to the offending session.
    pub fn socket_payload(&self) -> JsonValue {
        let mut payload = json!({ "message": self.message });
        if let Some(data) = &self.data {
            payload["details"] = data.clone();
        }
        payload
    }

    fn from_descriptor(descriptor: &'static ErrorDescriptor, message: Option<String>) -> Self {
        Self {
            descriptor,
            name: descriptor.name.to_owned(),
            message: message.unwrap_or_else(|| descriptor.default_message.to_owned()),
            data: None,
            source: None,
        }
    }

    fn with_source(mut self, error: AnyError) -> Self {
        self.source = Some(error);
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        Self::from_store(error)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = self.into_payload();
        (status, Json(payload)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: String,
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn validation_error_maps_to_bad_request() {
        let response = AppError::validation("workspaceId is required").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: JsonValue = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["status"], 400);
        assert_eq!(body["type"], "VALIDATION");
        assert_eq!(body["message"], "workspaceId is required");
    }

    #[tokio::test]
    async fn scope_not_found_carries_scope_data() {
        let response = AppError::scope_not_found("note:ws1:n1").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: JsonValue = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["name"], "SCOPE_NOT_FOUND");
        assert_eq!(body["data"]["scope"], "note:ws1:n1");
    }

    #[test]
    fn store_errors_split_unavailable_from_operational() {
        let unavailable = AppError::from_store(StoreError::CircuitOpen);
        assert_eq!(unavailable.kind(), "STORE_UNAVAILABLE");

        let operational = AppError::from_store(StoreError::Serialize(
            serde_json::from_str::<JsonValue>("{").unwrap_err(),
        ));
        assert_eq!(operational.kind(), "STORE_OPERATION_FAILED");
    }

    #[test]
    fn socket_payload_includes_details_only_when_present() {
        let plain = AppError::rate_limited("too many connections");
        assert_eq!(plain.socket_payload(), json!({"message": "too many connections"}));

        let with_data = AppError::scope_not_found("ws9");
        let payload = with_data.socket_payload();
        assert_eq!(payload["details"]["scope"], "ws9");
    }
}
