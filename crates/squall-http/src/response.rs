//! Outgoing responses and their body variants.
//!
//! A [`Response`] body is one of: in-memory bytes, a boxed chunk stream, a
//! file path, or an async reader. All four drain through the same
//! [`ResponseBody::next_chunk`] protocol (open lazily, yield chunks, end),
//! and [`Response::into_sequence`] materializes any variant into the
//! memory-backed form — after which range or length work acts on the
//! materialized bytes.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::HttpError;
use crate::header::HeaderMap;

/// Chunk size for draining file- and reader-backed bodies (64 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A type-erased, fallible async stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>>;

/// A type-erased async reader usable as a response body.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Per-response override of the adapter's send timeout.
///
/// `Unset` defers to the configured default; `None` disables the timeout
/// entirely; `Some` replaces it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum TimeoutOverride {
    #[default]
    Unset,
    None,
    Some(Duration),
}

/// The body payload of a [`Response`].
pub enum ResponseBody {
    /// Fully buffered in memory.
    Data(Bytes),
    /// Produced incrementally by a stream.
    Stream(ByteStream),
    /// Read from a file on first access.
    File {
        path: PathBuf,
        file: Option<tokio::fs::File>,
        done: bool,
    },
    /// Read from an arbitrary async reader.
    Reader { reader: BodyReader, done: bool },
}

impl ResponseBody {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        ResponseBody::File {
            path: path.into(),
            file: None,
            done: false,
        }
    }

    pub fn from_reader(reader: BodyReader) -> Self {
        ResponseBody::Reader {
            reader,
            done: false,
        }
    }

    /// Yield the next chunk, or `None` at the end of the body.
    ///
    /// The memory-backed variant yields its bytes once and then ends.
    /// File-backed bodies open the file on the first call.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        match self {
            ResponseBody::Data(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
            ResponseBody::Stream(stream) => {
                std::future::poll_fn(|cx| stream.as_mut().poll_next(cx))
                    .await
                    .transpose()
            }
            ResponseBody::File { path, file, done } => {
                if *done {
                    return Ok(None);
                }
                if file.is_none() {
                    *file = Some(tokio::fs::File::open(path.as_path()).await.map_err(|err| {
                        tracing::error!(path = %path.display(), error = %err, "response file open failed");
                        HttpError::InternalServerError
                    })?);
                }
                let handle = file.as_mut().expect("file opened above");
                let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
                let n = handle
                    .read(&mut buf)
                    .await
                    .map_err(|_| HttpError::InternalServerError)?;
                if n == 0 {
                    *done = true;
                    *file = None;
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            ResponseBody::Reader { reader, done } => {
                if *done {
                    return Ok(None);
                }
                let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
                let n = reader
                    .read(&mut buf)
                    .await
                    .map_err(|_| HttpError::InternalServerError)?;
                if n == 0 {
                    *done = true;
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Data(bytes) => f.debug_tuple("Data").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
            ResponseBody::File { path, .. } => f.debug_tuple("File").field(path).finish(),
            ResponseBody::Reader { .. } => f.write_str("Reader(..)"),
        }
    }
}

/// An outgoing HTTP response.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: ResponseBody,
    timeout: TimeoutOverride,
}

impl Response {
    /// A 200 response with the default text mimetype.
    pub fn new(body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "text/html; charset=utf-8");
        Self {
            status: 200,
            headers,
            body: ResponseBody::Data(body.into()),
            timeout: TimeoutOverride::Unset,
        }
    }

    pub fn with_status(body: impl Into<Bytes>, status: u16) -> Self {
        let mut response = Self::new(body);
        response.status = status;
        response
    }

    /// A JSON response serialized from `value`.
    pub fn json(value: &serde_json::Value) -> Self {
        let mut response = Self::new(value.to_string());
        response.headers.set("Content-Type", "application/json");
        response
    }

    /// A response with a streaming body.
    pub fn streaming(stream: impl Stream<Item = Result<Bytes, HttpError>> + Send + 'static) -> Self {
        let mut response = Self::new("");
        response.body = ResponseBody::Stream(Box::pin(stream));
        response
    }

    /// A response whose body is read from a file when streamed.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let mut response = Self::new("");
        response.body = ResponseBody::from_file(path);
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Replace the body with in-memory bytes.
    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.body = ResponseBody::Data(data.into());
    }

    /// The adapter send-timeout override for this response.
    pub fn timeout(&self) -> TimeoutOverride {
        self.timeout
    }

    /// Override the adapter send timeout (`None` disables it).
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = match timeout {
            Some(duration) => TimeoutOverride::Some(duration),
            None => TimeoutOverride::None,
        };
    }

    /// Materialize the body into memory, replacing whatever variant was
    /// there with the memory-backed form, and return the bytes.
    ///
    /// Needed before content-length computation or range slicing; later
    /// calls are cheap since the body is already a sequence.
    pub async fn into_sequence(&mut self) -> Result<Bytes, HttpError> {
        if let ResponseBody::Data(bytes) = &self.body {
            return Ok(bytes.clone());
        }
        let mut collected = Vec::new();
        while let Some(chunk) = self.body.next_chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        let bytes = Bytes::from(collected);
        self.body = ResponseBody::Data(bytes.clone());
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_body_yields_once() {
        let mut response = Response::new("hello");
        assert_eq!(response.status(), 200);
        let chunk = response.body_mut().next_chunk().await.unwrap();
        assert_eq!(chunk.unwrap().as_ref(), b"hello");
        assert!(response.body_mut().next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_response_sets_content_type() {
        let response = Response::json(&serde_json::json!({"a": 1}));
        assert_eq!(response.headers().get("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn streaming_body_materializes_to_sequence() {
        let stream = futures_util::stream::iter(vec![
            Ok(Bytes::from("hello ")),
            Ok(Bytes::from("world")),
        ]);
        let mut response = Response::streaming(stream);
        let bytes = response.into_sequence().await.unwrap();
        assert_eq!(bytes.as_ref(), b"hello world");

        // The body is now memory-backed; a second pass sees the same data.
        assert!(matches!(response.body(), ResponseBody::Data(_)));
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn stream_error_propagates() {
        let stream = futures_util::stream::iter(vec![
            Ok(Bytes::from("x")),
            Err(HttpError::InternalServerError),
        ]);
        let mut response = Response::streaming(stream);
        assert_eq!(
            response.into_sequence().await,
            Err(HttpError::InternalServerError)
        );
    }

    #[tokio::test]
    async fn file_body_streams_contents() {
        let dir = std::env::temp_dir().join("squall-http-file-body-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.txt");
        std::fs::write(&path, b"file contents here").unwrap();

        let mut response = Response::from_file(&path);
        let bytes = response.into_sequence().await.unwrap();
        assert_eq!(bytes.as_ref(), b"file contents here");
    }

    #[tokio::test]
    async fn missing_file_is_internal_error() {
        let mut response = Response::from_file("/nonexistent/squall/path");
        assert_eq!(
            response.into_sequence().await,
            Err(HttpError::InternalServerError)
        );
    }

    #[tokio::test]
    async fn reader_body_streams_contents() {
        let reader: BodyReader = Box::new(std::io::Cursor::new(b"reader bytes".to_vec()));
        let mut response = Response::new("");
        *response.body_mut() = ResponseBody::from_reader(reader);
        assert_eq!(response.into_sequence().await.unwrap().as_ref(), b"reader bytes");
    }

    #[test]
    fn timeout_override_distinguishes_unset_from_disabled() {
        let mut response = Response::new("");
        assert_eq!(response.timeout(), TimeoutOverride::Unset);
        response.set_timeout(None);
        assert_eq!(response.timeout(), TimeoutOverride::None);
        response.set_timeout(Some(Duration::from_secs(5)));
        assert_eq!(response.timeout(), TimeoutOverride::Some(Duration::from_secs(5)));
    }

    #[test]
    fn set_data_replaces_body() {
        let mut response = Response::new("old");
        response.set_data("new");
        match response.body() {
            ResponseBody::Data(bytes) => assert_eq!(bytes.as_ref(), b"new"),
            other => panic!("expected Data, got {other:?}"),
        }
    }
}
