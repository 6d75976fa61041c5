//! Network loaders for playlists, segments and scrub indexes

use crate::error::FetchError;
use crate::manifest::{ByteRange, SegmentInfo};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// A whole-object or byte-range segment request
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

impl From<&SegmentInfo> for SegmentRequest {
    fn from(segment: &SegmentInfo) -> Self {
        Self {
            url: segment.uri.clone(),
            byte_range: segment.byte_range,
        }
    }
}

/// Transport used by the session for every network read
#[async_trait]
pub trait Loader: Send + Sync {
    /// Fetch a text document (playlist or scrub index)
    async fn fetch_text(&self, url: &Url) -> Result<String, FetchError>;

    /// Fetch segment bytes
    async fn fetch_segment(&self, request: &SegmentRequest) -> Result<Bytes, FetchError>;
}

/// reqwest-backed loader
#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: Client,
}

impl HttpLoader {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::network("client", e))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn map_error(url: &Url, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else if let Some(status) = err.status() {
            FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }
        } else {
            FetchError::network(url.as_str(), err)
        }
    }

    fn check_status(url: &Url, status: StatusCode) -> Result<(), FetchError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl Loader for HttpLoader {
    #[instrument(skip(self))]
    async fn fetch_text(&self, url: &Url) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Self::map_error(url, e))?;
        Self::check_status(url, response.status())?;

        response.text().await.map_err(|e| Self::map_error(url, e))
    }

    #[instrument(skip(self), fields(url = %request.url))]
    async fn fetch_segment(&self, request: &SegmentRequest) -> Result<Bytes, FetchError> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(range) = request.byte_range {
            builder = builder.header(header::RANGE, range.header_value());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(&request.url, e))?;
        Self::check_status(&request.url, response.status())?;

        let data = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(&request.url, e))?;

        debug!(bytes = data.len(), "Segment fetched");
        Ok(data)
    }
}
