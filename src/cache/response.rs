//! Response abstraction exchanged with the host framework
//!
//! A [`CacheResponse`] is a status, a header map and a [`Body`] that is either
//! absent, fully buffered, or a stream of chunks (file-backed reads).

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode};
use tokio_util::io::ReaderStream;

use super::compression::GZIP;
use crate::error::{Error, Result};

/// Chunked body stream
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Response body
#[derive(Default)]
pub enum Body {
    /// No payload
    #[default]
    Empty,
    /// Fully buffered payload
    Full(Bytes),
    /// Streamed payload, consumed at most once
    Stream(BodyStream),
}

impl Body {
    /// Stream the contents of an open file
    pub fn from_file(file: tokio::fs::File) -> Self {
        Body::Stream(ReaderStream::new(file).boxed())
    }

    /// Whether the body is known to carry no bytes
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(bytes) => bytes.is_empty(),
            Body::Stream(_) => false,
        }
    }

    /// Materialize the whole body
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(stream) => {
                let buf = stream
                    .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                        acc.extend_from_slice(&chunk);
                        Ok(acc)
                    })
                    .await
                    .map_err(|e| Error::Body(e.to_string()))?;
                Ok(buf.freeze())
            }
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::Full(Bytes::from_static(text.as_bytes()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::Full(Bytes::from(data))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

/// An HTTP-style response as seen by the cache
#[derive(Debug)]
pub struct CacheResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl CacheResponse {
    /// Create an empty response with the given status
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    /// Create a 200 response with a buffered body
    pub fn ok(body: impl Into<Body>) -> Self {
        Self::new(StatusCode::OK).with_body(body)
    }

    /// Assemble from parts
    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Replace the body; buffered bodies also set `content-length`
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        match &self.body {
            Body::Full(bytes) => {
                self.headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));
            }
            _ => {
                self.headers.remove(CONTENT_LENGTH);
            }
        }
        self
    }

    /// Attach a payload, marking `content-encoding: gzip` when `is_gzipped`
    /// and clearing it otherwise
    pub fn with_encoded_body(mut self, body: impl Into<Body>, is_gzipped: bool) -> Self {
        if is_gzipped {
            self.headers
                .insert(CONTENT_ENCODING, HeaderValue::from_static(GZIP));
        } else {
            self.headers.remove(CONTENT_ENCODING);
        }
        self.with_body(body)
    }

    /// Add or replace a header. Invalid values are ignored.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Response status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Response body
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Split into status, headers and body
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Body) {
        (self.status, self.headers, self.body)
    }

    /// Whether the payload is gzip-encoded
    pub fn is_gzipped(&self) -> bool {
        is_gzip_encoded(&self.headers)
    }

    /// Declared `content-length`, if present and well-formed
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Consume the response and materialize its body
    pub async fn bytes(self) -> Result<Bytes> {
        self.body.into_bytes().await
    }
}

/// Whether `content-encoding` names gzip
pub fn is_gzip_encoded(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case(GZIP))
}
