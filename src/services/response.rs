//! HTTP response building helpers
//!
//! Provides a consistent API for building HTTP responses across all handlers.
//! Bodies are boxed so buffered JSON and streamed payloads share one type.

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{header, Response, StatusCode};
use serde::Serialize;

use crate::error::{StorageError, ValidationError};
use crate::services::OpenedBlob;

/// Response body used by every handler
pub type ResponseBody = UnsyncBoxBody<Bytes, StorageError>;

/// Message for anything that is not (or no longer) readable. Expired and
/// missing uploads must look the same from outside.
pub const NOT_FOUND_MESSAGE: &str = "File not found or has expired";

/// Wrap buffered bytes as a [`ResponseBody`]
pub fn full(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ResponseBody {
    full(Bytes::new())
}

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<ResponseBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(full(json));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Build a JSON response with 200 OK status
pub fn ok<T: Serialize>(body: &T) -> Response<ResponseBody> {
    json_response(StatusCode::OK, body)
}

/// Build a JSON response with 201 Created status
pub fn created<T: Serialize>(body: &T) -> Response<ResponseBody> {
    json_response(StatusCode::CREATED, body)
}

/// Build an empty response with 204 No Content status
pub fn no_content() -> Response<ResponseBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

/// Build an error response with a JSON `{"error": message}` body
pub fn error_message(status: StatusCode, message: &str) -> Response<ResponseBody> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// Build a 405 Method Not Allowed response
pub fn method_not_allowed() -> Response<ResponseBody> {
    error_message(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

/// Status code for an error
pub fn status_for(error: &StorageError) -> StatusCode {
    match error {
        StorageError::Validation(ValidationError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
        StorageError::Validation(ValidationError::UnsupportedType(_)) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        StorageError::Validation(_) => StatusCode::BAD_REQUEST,
        StorageError::NotFound(_) | StorageError::Expired(_) => StatusCode::NOT_FOUND,
        StorageError::StorageUnavailable(_) | StorageError::Database(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a StorageError to an appropriate HTTP response
pub fn error_response(error: StorageError) -> Response<ResponseBody> {
    let status = status_for(&error);
    let message = match &error {
        StorageError::Validation(e) => e.to_string(),
        StorageError::NotFound(_) | StorageError::Expired(_) => NOT_FOUND_MESSAGE.to_string(),
        StorageError::StorageUnavailable(_) | StorageError::Database(_) => {
            "Storage temporarily unavailable".to_string()
        }
        _ => "Internal error".to_string(),
    };

    error_message(status, &message)
}

/// Stream an opened blob back to the client
pub fn blob_response(blob: OpenedBlob) -> Response<ResponseBody> {
    let body = StreamBody::new(blob.stream.map_ok(Frame::data)).boxed_unsync();

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(value) = header::HeaderValue::from_str(&blob.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(blob.size_bytes));
    headers.insert(
        header::CONTENT_DISPOSITION,
        header::HeaderValue::from_static("inline"),
    );
    // Content disappears at expiry; caches must not outlive it
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

/// Wrap a service result into an HTTP response with 201 Created
pub fn from_create_result<T: Serialize>(result: Result<T, StorageError>) -> Response<ResponseBody> {
    match result {
        Ok(value) => created(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap a delete result into an HTTP response with 204 No Content
pub fn from_delete_result(result: Result<(), StorageError>) -> Response<ResponseBody> {
    match result {
        Ok(()) => no_content(),
        Err(e) => error_response(e),
    }
}
