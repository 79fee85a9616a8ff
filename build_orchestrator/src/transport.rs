use std::{fmt, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream::BoxStream, Stream, StreamExt, TryStreamExt};
use stacked_errors::{Result, StackableErr};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{
    config::ClientConfig,
    error::BuildError,
    options::BuildParams,
};

/// The content type of every build request body
pub const TAR_CONTENT_TYPE: &str = "application/x-tar";

/// The response body as a lazily read sequence of non-empty lines
pub type LineStream = BoxStream<'static, Result<String>>;

/// A request body. Archives built in memory are sent as they are, caller
/// provided archives and compressed archives are read as they are sent.
pub enum ArchiveBody {
    Bytes(Vec<u8>),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl ArchiveBody {
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            ArchiveBody::Bytes(bytes) => {
                futures::stream::once(future::ready(Ok(Bytes::from(bytes)))).boxed()
            }
            ArchiveBody::Reader(reader) => ReaderStream::new(reader).boxed(),
        }
    }

    /// Reads the whole body into memory
    pub async fn read_all(self) -> Result<Vec<u8>> {
        match self {
            ArchiveBody::Bytes(bytes) => Ok(bytes),
            ArchiveBody::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await.stack()?;
                Ok(buf)
            }
        }
    }
}

// avoid printing whole archives
impl fmt::Debug for ArchiveBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveBody::Bytes(bytes) => write!(f, "ArchiveBody::Bytes({} bytes)", bytes.len()),
            ArchiveBody::Reader(_) => write!(f, "ArchiveBody::Reader"),
        }
    }
}

#[derive(Debug)]
pub struct TransportRequest {
    /// Path relative to the API base, e.x. `/build`
    pub path: String,
    pub query: BuildParams,
    pub body: Option<ArchiveBody>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub lines: LineStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Passes through successful responses. Otherwise the body is read and
    /// turned into [BuildError::NotFound] for a 404 or [BuildError::Daemon]
    /// for anything else.
    pub async fn error_for_status(self) -> std::result::Result<Self, BuildError> {
        if self.is_success() {
            return Ok(self)
        }
        let status = self.status;
        let body = self
            .lines
            .try_collect::<Vec<_>>()
            .await
            .stack_err_with(|| format!("reading body of a response with status {status}"))?
            .join("\n");
        if status == 404 {
            Err(BuildError::NotFound {
                message: daemon_message(&body),
            })
        } else {
            Err(BuildError::Daemon { status, body })
        }
    }

    /// Drains the body into one string
    pub async fn text(self) -> Result<String> {
        Ok(self.lines.try_collect::<Vec<_>>().await.stack()?.join("\n"))
    }
}

/// The daemon's JSON error bodies carry a `message`, fall back to the raw body
fn daemon_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| body.to_owned())
}

/// Splits a byte stream into lines as they arrive, dropping blank lines
pub fn split_lines<S>(bytes: S) -> LineStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    LinesStream::new(StreamReader::new(bytes).lines())
        .try_filter(|line| future::ready(!line.trim().is_empty()))
        .map(|line| line.stack_err("reading response body"))
        .boxed()
}

/// The HTTP capability the build submission needs.
///
/// Responses must not be buffered, `lines` is read while the daemon is still
/// producing it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse>;

    async fn get(&self, path: &str, query: &BuildParams) -> Result<TransportResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse> {
        (**self).post(request).await
    }

    async fn get(&self, path: &str, query: &BuildParams) -> Result<TransportResponse> {
        (**self).get(path, query).await
    }
}

/// [Transport] for a daemon listening on TCP, for instance `podman system
/// service tcp:localhost:8888`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: ClientConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .stack_err("HttpTransport::new")?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> Result<url::Url> {
        let base = self.config.base_url().stack()?;
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url::Url::parse(&joined).stack_err_with(|| format!("invalid request url {joined}"))
    }

    fn into_response(resp: reqwest::Response) -> TransportResponse {
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_owned(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let bytes = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e));
        TransportResponse {
            status,
            headers,
            lines: split_lines(bytes),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(skip_all, fields(request.path = %request.path))]
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse> {
        let url = self.url(&request.path).stack()?;
        let mut builder = self.client.post(url).query(request.query.as_pairs());
        for (key, val) in &request.headers {
            builder = builder.header(key.as_str(), val.as_str());
        }
        if let Some(timeout) = request.timeout.or(self.config.timeout) {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_stream()));
        }

        let resp = builder
            .send()
            .await
            .stack_err_with(|| format!("POST {} failed", request.path))?;
        tracing::debug!("POST {} -> {}", request.path, resp.status());
        Ok(Self::into_response(resp))
    }

    #[tracing::instrument(skip_all, fields(request.path = %path))]
    async fn get(&self, path: &str, query: &BuildParams) -> Result<TransportResponse> {
        let url = self.url(path).stack()?;
        let mut builder = self.client.get(url).query(query.as_pairs());
        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }
        let resp = builder
            .send()
            .await
            .stack_err_with(|| format!("GET {path} failed"))?;
        Ok(Self::into_response(resp))
    }
}

pub mod default_transport {
    use std::sync::{LazyLock, OnceLock};

    use stacked_errors::{Result, StackableErr};

    use super::HttpTransport;
    use crate::config::ClientConfig;

    /// This acquires a process-wide [HttpTransport] configured from the
    /// environment, see [ClientConfig::from_env]
    pub async fn get_or_init_default_transport() -> Result<HttpTransport> {
        static TRANSPORT: OnceLock<HttpTransport> = OnceLock::new();
        static INIT_LOCK: LazyLock<tokio::sync::Mutex<()>> = LazyLock::new(Default::default);

        // fast path, with a slow path that keeps client construction off the
        // async workers
        if let Some(transport) = TRANSPORT.get() {
            return Ok(transport.clone())
        }
        let _init_lock = INIT_LOCK.lock().await;
        if let Some(transport) = TRANSPORT.get() {
            return Ok(transport.clone())
        }
        let transport = tokio::task::spawn_blocking(|| {
            ClientConfig::from_env().and_then(HttpTransport::new)
        })
        .await
        .stack()??;
        Ok(TRANSPORT.get_or_init(|| transport).clone())
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn chunks(chunks: &[&'static str]) -> LineStream {
        split_lines(stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        ))
    }

    #[tokio::test]
    async fn lines_across_chunks() {
        let lines: Vec<String> = chunks(&["{\"stream\":", "\"a\\n\"}\n\n{\"str", "eam\":\"b\"}"])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(lines, [r#"{"stream":"a\n"}"#, r#"{"stream":"b"}"#]);
    }

    #[tokio::test]
    async fn status_mapping() {
        let ok = TransportResponse {
            status: 200,
            headers: vec![],
            lines: chunks(&["x\n"]),
        };
        assert!(ok.error_for_status().await.is_ok());

        let not_found = TransportResponse {
            status: 404,
            headers: vec![],
            lines: chunks(&[
                r#"{"cause":"no such image","message":"missing thing","response":404}"#,
            ]),
        };
        match not_found.error_for_status().await.unwrap_err() {
            BuildError::NotFound { message } => assert_eq!(message, "missing thing"),
            e => panic!("{e:?}"),
        }

        let daemon = TransportResponse {
            status: 500,
            headers: vec![],
            lines: chunks(&["internal\n", "error\n"]),
        };
        match daemon.error_for_status().await.unwrap_err() {
            BuildError::Daemon { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "internal\nerror");
            }
            e => panic!("{e:?}"),
        }
    }

    #[tokio::test]
    async fn reader_body_round_trips() {
        let body = ArchiveBody::Reader(Box::new(std::io::Cursor::new(b"abc".to_vec())));
        assert_eq!(body.read_all().await.unwrap(), b"abc");
    }
}
