// src/transport.rs

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, ETAG, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },
    #[error("server responded with HTTP {0}")]
    Status(u16),
    #[error("stream error: {0}")]
    Stream(String),
    /// The requested offset lies at or past the end of the resource.
    #[error("range not satisfiable (resource length {total:?})")]
    RangeNotSatisfiable { total: Option<u64> },
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_connect() || err.is_builder() || err.is_redirect() {
            Self::Connect(err.to_string())
        } else {
            Self::Stream(err.to_string())
        }
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// What the engine asks of a transport for one run of a download.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    /// First byte wanted. Zero asks for the whole resource.
    pub offset: u64,
    pub connect_timeout: Duration,
}

pub struct TransportResponse {
    /// Size of the whole resource, not of the remaining range.
    pub total_bytes: Option<u64>,
    /// True when the body starts at the requested non-zero offset.
    /// False means the body starts at byte 0.
    pub resumed: bool,
    pub etag: Option<String>,
    pub stream: ByteStream,
}

/// A byte source that can start a resource at an arbitrary offset.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// HTTP transport using `Range` requests.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let client = Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }

}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url);
        if request.offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.offset));
        }

        let response = tokio::time::timeout(request.connect_timeout, builder.send())
            .await
            .map_err(|_| TransportError::Timeout {
                phase: "connect",
                after: request.connect_timeout,
            })??;
        if request.offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            // Answered as `bytes */<length>` when the server knows the length.
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(content_range_total);
            return Err(TransportError::RangeNotSatisfiable { total });
        }
        let response = response.error_for_status()?;

        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let headers = response.headers();
        let etag = headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let total_bytes = if partial {
            headers
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(content_range_total)
                .or_else(|| response.content_length().map(|len| len + request.offset))
        } else {
            response.content_length()
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();

        Ok(TransportResponse {
            total_bytes,
            resumed: request.offset > 0 && partial,
            etag,
            stream,
        })
    }
}

/// Extracts the complete length from `bytes <start>-<end>/<total>`.
/// An unknown length (`*`) yields `None`.
fn content_range_total(value: &str) -> Option<u64> {
    value
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 400-999/1000"), Some(1000));
        assert_eq!(content_range_total("bytes 0-0/ 7"), Some(7));
        assert_eq!(content_range_total("bytes 400-999/*"), None);
        assert_eq!(content_range_total("bytes */1000"), Some(1000));
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new("odm-test").is_ok());
    }
}
