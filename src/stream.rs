//! Stream handle and operations.

use std::time::Duration;

use bytes::Bytes;

use crate::client::Client;
use crate::error::StreamError;
use crate::headers::*;
use crate::iterator::ReadBuilder;
use crate::producer::ProducerBuilder;
use crate::types::Offset;

/// A handle to a durable stream.
///
/// This is a lightweight, cloneable object - not a persistent connection.
/// Operations make HTTP requests on demand.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    pub(crate) url: String,
    pub(crate) client: Client,
    pub(crate) content_type: Option<String>,
}

impl StreamHandle {
    /// Get the stream URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the content type set on this stream handle.
    ///
    /// This is used as the default Content-Type for append operations and
    /// by the producer for JSON mode detection. It is not automatically
    /// populated from the server; use [`set_content_type`](Self::set_content_type).
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Set the content type for this stream handle.
    pub fn set_content_type(&mut self, ct: impl Into<String>) {
        self.content_type = Some(ct.into());
    }

    /// Create the stream.
    ///
    /// Idempotent - succeeds if stream already exists with matching config.
    /// Returns `StreamError::Conflict` only if config differs.
    pub async fn create(&self) -> Result<(), StreamError> {
        self.create_with(CreateOptions::default()).await
    }

    /// Create the stream with options.
    pub async fn create_with(&self, options: CreateOptions) -> Result<(), StreamError> {
        let content_type = options
            .content_type
            .as_deref()
            .or(self.content_type.as_deref())
            .unwrap_or("application/octet-stream");

        let mut req = self
            .client
            .inner
            .put(&self.url)
            .header("content-type", content_type);

        if let Some(ttl) = options.ttl {
            req = req.header(STREAM_TTL, ttl.as_secs().to_string());
        }
        if let Some(expires) = &options.expires_at {
            req = req.header(STREAM_EXPIRES_AT, expires);
        }
        if options.closed {
            req = req.header(STREAM_CLOSED, "true");
        }

        for (key, value) in self.client.get_headers().iter() {
            req = req.header(key.clone(), value.clone());
        }
        for (key, value) in &options.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        if let Some(data) = options.initial_data {
            req = req.body(data);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        match status {
            200 | 201 | 204 => Ok(()),
            409 => Err(StreamError::Conflict),
            _ => Err(StreamError::from_status(status, &self.url)),
        }
    }

    /// Append data to the stream.
    pub async fn append(&self, data: impl Into<Bytes>) -> Result<AppendResponse, StreamError> {
        self.append_with(data, AppendOptions::default()).await
    }

    /// Append data with options, retrying transient failures with the
    /// client's backoff policy.
    pub async fn append_with(
        &self,
        data: impl Into<Bytes>,
        options: AppendOptions,
    ) -> Result<AppendResponse, StreamError> {
        let data = data.into();
        if data.is_empty() {
            return Err(StreamError::EmptyAppend);
        }

        let content_type = self
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let retry = &self.client.retry;
        let mut last_error = None;

        for attempt in 0..=retry.max_retries.min(3) {
            if attempt > 0 {
                tokio::time::sleep(retry.backoff(attempt - 1)).await;
            }

            let mut req = self
                .client
                .inner
                .post(&self.url)
                .header("content-type", content_type)
                .body(data.clone());

            for (key, value) in self.client.get_headers().iter() {
                req = req.header(key.clone(), value.clone());
            }
            for (key, value) in &options.headers {
                req = req.header(key.as_str(), value.as_str());
            }

            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(StreamError::from(e));
                    continue; // Retry on network error
                }
            };

            let status = resp.status().as_u16();

            match status {
                200 | 204 => {
                    let offset = header_offset(&resp).unwrap_or(Offset::Beginning);
                    let received_seq = header_u64(&resp, PRODUCER_RECEIVED_SEQ);
                    return Ok(AppendResponse {
                        offset,
                        received_seq,
                    });
                }
                404 => {
                    return Err(StreamError::NotFound {
                        url: self.url.clone(),
                    })
                }
                409 => {
                    // A sequence diagnostic distinguishes a producer
                    // conflict from a closed stream.
                    if resp.headers().contains_key(PRODUCER_EXPECTED_SEQ) {
                        return Err(StreamError::SeqConflict);
                    }
                    return Err(StreamError::StreamClosed);
                }
                500 | 502 | 503 | 504 | 429 => {
                    last_error = Some(StreamError::from_status(status, &self.url));
                    continue;
                }
                _ => return Err(StreamError::from_status(status, &self.url)),
            }
        }

        Err(last_error.unwrap_or_else(|| StreamError::ServerError {
            status: 500,
            message: "All retries failed".to_string(),
        }))
    }

    /// Close the stream, optionally appending a trailing body first.
    ///
    /// Returns the final offset. Closing an already-closed stream without a
    /// body succeeds.
    pub async fn close(&self, body: Option<Bytes>) -> Result<CloseResponse, StreamError> {
        let content_type = self
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let mut req = self
            .client
            .inner
            .post(&self.url)
            .header("content-type", content_type)
            .header(STREAM_CLOSED, "true");

        for (key, value) in self.client.get_headers().iter() {
            req = req.header(key.clone(), value.clone());
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        match status {
            200 | 204 => Ok(CloseResponse {
                final_offset: header_offset(&resp).unwrap_or(Offset::Beginning),
            }),
            404 => Err(StreamError::NotFound {
                url: self.url.clone(),
            }),
            409 => Err(StreamError::StreamClosed),
            _ => Err(StreamError::from_status(status, &self.url)),
        }
    }

    /// Get stream metadata via HEAD request.
    pub async fn head(&self) -> Result<HeadResponse, StreamError> {
        let mut req = self.client.inner.head(&self.url);
        for (key, value) in self.client.get_headers().iter() {
            req = req.header(key.clone(), value.clone());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        match status {
            200 => Ok(HeadResponse {
                offset: header_offset(&resp).unwrap_or(Offset::Beginning),
                content_type: header_string(&resp, "content-type"),
                closed: header_string(&resp, STREAM_CLOSED).as_deref() == Some("true"),
                etag: header_string(&resp, "etag"),
            }),
            404 => Err(StreamError::NotFound {
                url: self.url.clone(),
            }),
            _ => Err(StreamError::from_status(status, &self.url)),
        }
    }

    /// Delete the stream.
    pub async fn delete(&self) -> Result<(), StreamError> {
        let mut req = self.client.inner.delete(&self.url);
        for (key, value) in self.client.get_headers().iter() {
            req = req.header(key.clone(), value.clone());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        match status {
            200 | 204 => Ok(()),
            404 => Err(StreamError::NotFound {
                url: self.url.clone(),
            }),
            _ => Err(StreamError::from_status(status, &self.url)),
        }
    }

    /// Create a reader builder for consuming the stream.
    pub fn read(&self) -> ReadBuilder {
        ReadBuilder::new(self.clone())
    }

    /// Create an idempotent producer builder.
    pub fn producer(&self, producer_id: impl Into<String>) -> ProducerBuilder {
        ProducerBuilder::new(self.clone(), producer_id.into())
    }

    /// Build a read URL with query parameters.
    pub(crate) fn build_read_url(
        &self,
        offset: &Offset,
        live: Option<&str>,
        cursor: Option<&str>,
        extra_params: &[(String, String)],
    ) -> String {
        let mut url = self.url.clone();
        let mut params = Vec::new();

        params.push(format!("offset={}", offset.to_query_value()));
        if let Some(live) = live {
            params.push(format!("live={}", live));
        }
        if let Some(cursor) = cursor {
            params.push(format!("cursor={}", cursor));
        }
        for (key, value) in extra_params {
            params.push(format!("{}={}", key, value));
        }

        if url.contains('?') {
            url.push('&');
        } else {
            url.push('?');
        }
        url.push_str(&params.join("&"));
        url
    }
}

fn header_string(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn header_offset(resp: &reqwest::Response) -> Option<Offset> {
    resp.headers()
        .get(STREAM_OFFSET)
        .and_then(|v| v.to_str().ok())
        .map(Offset::parse)
}

fn header_u64(resp: &reqwest::Response, name: &str) -> Option<u64> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

/// Options for creating a stream.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct CreateOptions {
    pub content_type: Option<String>,
    pub ttl: Option<Duration>,
    pub expires_at: Option<String>,
    pub closed: bool,
    pub headers: Vec<(String, String)>,
    pub initial_data: Option<Bytes>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(mut self, ct: impl Into<String>) -> Self {
        self.content_type = Some(ct.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn expires_at(mut self, expires: impl Into<String>) -> Self {
        self.expires_at = Some(expires.into());
        self
    }

    /// Create the stream already closed.
    pub fn closed(mut self, closed: bool) -> Self {
        self.closed = closed;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn initial_data(mut self, data: impl Into<Bytes>) -> Self {
        self.initial_data = Some(data.into());
        self
    }
}

/// Options for appending to a stream.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct AppendOptions {
    pub headers: Vec<(String, String)>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Response from an append operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct AppendResponse {
    /// Offset of the last appended record.
    pub offset: Offset,
    /// Set when the server answered an idempotent replay.
    pub received_seq: Option<u64>,
}

/// Response from closing a stream.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CloseResponse {
    pub final_offset: Offset,
}

/// Response from a HEAD operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HeadResponse {
    pub offset: Offset,
    pub content_type: Option<String>,
    pub closed: bool,
    pub etag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_read_url() {
        let client = Client::new();
        let stream = client.stream("http://localhost/s/a");

        assert_eq!(
            stream.build_read_url(&Offset::Beginning, None, None, &[]),
            "http://localhost/s/a?offset=-1"
        );
        assert_eq!(
            stream.build_read_url(
                &Offset::at("0000000000000000_0000000000000003"),
                Some("long-poll"),
                Some("42"),
                &[("trace".to_string(), "1".to_string())],
            ),
            "http://localhost/s/a?offset=0000000000000000_0000000000000003&live=long-poll&cursor=42&trace=1"
        );
    }
}
