//! HTTP response building helpers
//!
//! Every handler answers with JSON. Errors share one body shape:
//! `{"error": message, "code": code, ...details}`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use crate::error::ProgressError;

pub type HttpResponse = Response<Full<Bytes>>;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn ok<T: Serialize>(body: &T) -> HttpResponse {
    json_response(StatusCode::OK, body)
}

pub fn created<T: Serialize>(body: &T) -> HttpResponse {
    json_response(StatusCode::CREATED, body)
}

pub fn not_found(message: &str) -> HttpResponse {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({ "error": message, "code": "not_found" }),
    )
}

pub fn method_not_allowed() -> HttpResponse {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &json!({ "error": "Method not allowed", "code": "method_not_allowed" }),
    )
}

/// HTTP status for each error kind
pub fn status_for(error: &ProgressError) -> StatusCode {
    match error {
        ProgressError::Validation(_) | ProgressError::OutOfRange { .. } => StatusCode::BAD_REQUEST,
        ProgressError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ProgressError::Forbidden(_) => StatusCode::FORBIDDEN,
        ProgressError::NotFound(_) => StatusCode::NOT_FOUND,
        ProgressError::AlreadyCompleted { .. } => StatusCode::CONFLICT,
        ProgressError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ProgressError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        ProgressError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a ProgressError to an HTTP response
pub fn error_response(error: ProgressError) -> HttpResponse {
    let status = status_for(&error);
    let mut body = json!({
        "error": error.to_string(),
        "code": error.code(),
    });

    match &error {
        ProgressError::OutOfRange {
            checkpoint_id,
            required_radius_m,
            distance_m,
            ..
        } => {
            body["checkpointId"] = json!(checkpoint_id);
            body["requiredRadius"] = json!(required_radius_m);
            body["distance"] = json!(distance_m.round());
        }
        ProgressError::AlreadyCompleted { checkpoint_id } => {
            body["checkpointId"] = json!(checkpoint_id);
        }
        ProgressError::RateLimited { retry_after_secs } => {
            body["retryAfter"] = json!(retry_after_secs);
        }
        _ => {}
    }

    let mut response = json_response(status, &body);
    if let ProgressError::RateLimited { retry_after_secs } = error {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: HttpResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_ok_response() {
        let resp = ok(&json!({"test": true}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ProgressError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ProgressError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (ProgressError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ProgressError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ProgressError::AlreadyCompleted { checkpoint_id: "a".into() },
                StatusCode::CONFLICT,
            ),
            (ProgressError::Storage("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (ProgressError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error_response(error).status(), status);
        }
    }

    #[tokio::test]
    async fn test_out_of_range_body_has_details() {
        let resp = error_response(ProgressError::OutOfRange {
            checkpoint_id: "zytglogge".into(),
            checkpoint_name: "Zytglogge".into(),
            required_radius_m: 30.0,
            distance_m: 45.4,
        });
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body = body_json(resp).await;
        assert_eq!(body["code"], "out_of_range");
        assert_eq!(body["requiredRadius"], 30.0);
        assert_eq!(body["distance"], 45.0);
        assert!(body["error"].as_str().unwrap().contains("within 30m of Zytglogge"));
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let resp = error_response(ProgressError::RateLimited { retry_after_secs: 120 });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "120");
        assert_eq!(body_json(resp).await["retryAfter"], 120);
    }
}
