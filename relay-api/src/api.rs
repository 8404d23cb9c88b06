use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("request holds no event")]
    EmptyBatch,

    #[error("transient error, please retry")]
    RetryableSinkError,
    #[error("maximum event size exceeded")]
    EventTooBig,
    #[error("invalid event could not be produced")]
    NonRetryableSinkError,

    #[error("response store is unavailable")]
    StoreUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RequestParsingError(_)
            | ApiError::EmptyBatch
            | ApiError::EventTooBig
            | ApiError::NonRetryableSinkError => (StatusCode::BAD_REQUEST, self.to_string()),

            ApiError::RetryableSinkError | ApiError::StoreUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        }
        .into_response()
    }
}

/// Body of a successful `POST /events`: one id per accepted event, in
/// submission order. Callers poll `GET /responses/{id}` with these.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EventsResponse {
    pub request_ids: Vec<String>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupStatus {
    Processing,
    Completed,
}

/// Body of `GET /responses/{id}`. An unknown id reports `processing`, the
/// caller cannot tell "in flight" apart from "never submitted".
#[derive(Debug, Deserialize, Serialize)]
pub struct LookupResponse {
    pub status: LookupStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::ApiError;

    #[test]
    fn parse_errors_are_client_errors() {
        let response = ApiError::EmptyBatch.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let parse_error = serde_json::from_slice::<serde_json::Value>(b"not json").unwrap_err();
        let response = ApiError::RequestParsingError(parse_error).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn transient_errors_ask_for_a_retry() {
        let response = ApiError::RetryableSinkError.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = ApiError::StoreUnavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
