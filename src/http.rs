//! HTTP API for expiring uploads
//!
//! - `GET /health` - Health check
//! - `POST /images?minutes=N&filename=NAME` - Upload the raw request body
//! - `GET /images/{id}` - Stream an upload back
//! - `DELETE /images/{id}` - Remove an upload
//!
//! ## Example Usage
//!
//! ```bash
//! # Upload an image that lives for 5 minutes
//! curl -X POST -H "Content-Type: image/png" \
//!      --data-binary @cat.png \
//!      "http://localhost:8090/images?minutes=5&filename=cat.png"
//!
//! # Fetch it
//! curl http://localhost:8090/images/2b0c6f5e-... > cat.png
//! ```

use crate::error::{StorageError, ValidationError};
use crate::services::response::{self, ResponseBody};
use crate::services::upload::LOCATOR_PATH;
use crate::services::{ExpiringStore, UploadRequest};
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Query string accepted by `POST /images`
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    /// TTL in minutes
    pub minutes: Option<i64>,
    pub filename: Option<String>,
}

impl UploadQuery {
    pub fn parse(query: Option<&str>) -> Result<Self, StorageError> {
        match query {
            Some(q) if !q.is_empty() => serde_urlencoded::from_str(q)
                .map_err(|e| ValidationError::InvalidQuery(e.to_string()).into()),
            _ => Ok(Self::default()),
        }
    }
}

/// HTTP server state
pub struct HttpServer {
    store: Arc<ExpiringStore>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(store: Arc<ExpiringStore>, bind_addr: SocketAddr) -> Self {
        Self { store, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), StorageError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), StorageError> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let collection = format!("/{}", LOCATOR_PATH);
        let item_id = path
            .strip_prefix(&collection)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .map(str::to_string);

        let response = match (&method, path.as_str(), item_id) {
            (&Method::GET, "/health", _) => self.handle_health(),

            (&Method::POST, p, _) if p == collection || p == format!("{}/", collection) => {
                self.handle_upload(req).await
            }
            (&Method::GET, _, Some(id)) => self.handle_get(&id).await,
            (&Method::DELETE, _, Some(id)) => {
                response::from_delete_result(self.store.delete(&id).await)
            }
            (_, _, Some(_)) => response::method_not_allowed(),

            _ => response::error_message(StatusCode::NOT_FOUND, "Not Found"),
        };

        Ok(response)
    }

    /// Health check endpoint
    fn handle_health(&self) -> Response<ResponseBody> {
        match self.store.record_count() {
            Ok(records) => response::ok(&serde_json::json!({
                "status": "ok",
                "records": records,
            })),
            Err(e) => response::error_response(e),
        }
    }

    /// POST /images - Upload the request body
    async fn handle_upload(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        let query = match UploadQuery::parse(req.uri().query()) {
            Ok(query) => query,
            Err(e) => return response::error_response(e),
        };

        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let size = match req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(size) => size,
            None => {
                return response::error_message(
                    StatusCode::LENGTH_REQUIRED,
                    "Content-Length header required",
                )
            }
        };

        let data = req
            .into_body()
            .into_data_stream()
            .map_err(|e| StorageError::Internal(format!("Failed to read body: {}", e)))
            .boxed();

        let result = self
            .store
            .upload(UploadRequest {
                data,
                size,
                content_type,
                ttl_minutes: query.minutes,
                filename: query.filename,
            })
            .await;

        if let Err(ref e) = result {
            debug!(error = %e, "Upload rejected");
        }

        response::from_create_result(result)
    }

    /// GET /images/{id} - Stream the upload back
    async fn handle_get(&self, id: &str) -> Response<ResponseBody> {
        match self.store.open(id).await {
            Ok(blob) => {
                debug!(id = %id, size = blob.size_bytes, "Serving upload");
                response::blob_response(blob)
            }
            Err(e) => response::error_response(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_query_parsing() {
        let query = UploadQuery::parse(Some("minutes=5&filename=cat%20photo.png")).unwrap();
        assert_eq!(query.minutes, Some(5));
        assert_eq!(query.filename.as_deref(), Some("cat photo.png"));

        let query = UploadQuery::parse(None).unwrap();
        assert_eq!(query.minutes, None);

        let err = UploadQuery::parse(Some("minutes=soon")).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Validation(ValidationError::InvalidQuery(_))
        ));
        assert!(err.to_string().contains("Invalid query"));
    }
}
