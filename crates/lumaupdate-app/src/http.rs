//! HTTP collaborator
//!
//! Release manifests and archives are fetched through the [`HttpClient`]
//! trait so the update flow can run against an in-memory server in tests.
//! [`ReqwestClient`] is the real implementation on top of blocking reqwest.

use std::io::Read;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::NetworkConfig;

/// Size of one read from the response body
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Errors that can occur while fetching a URL
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Non-200 status code: {0}")]
    Status(u16),

    #[error("I/O error while receiving body: {0}")]
    Io(#[from] std::io::Error),
}

/// A completed response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// Response body
    pub body: Vec<u8>,
    /// `ETag` header, verbatim
    pub etag: Option<String>,
}

/// Progress of an in-flight download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStatus {
    /// No more data will arrive
    pub finished: bool,
    /// Bytes received so far
    pub current: u64,
    /// Total size announced by the server, if any
    pub total: Option<u64>,
}

/// Minimal GET-only HTTP client
pub trait HttpClient {
    /// Fetch `url` and return the whole body
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError>;

    /// Fetch `url`, reporting `(received, total)` while the body arrives
    fn get_with_progress(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<HttpResponse, HttpError> {
        let response = self.get(url)?;
        let len = response.body.len() as u64;
        on_progress(len, Some(len));
        Ok(response)
    }
}

impl<T: HttpClient + ?Sized> HttpClient for &T {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        (**self).get(url)
    }

    fn get_with_progress(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<HttpResponse, HttpError> {
        (**self).get_with_progress(url, on_progress)
    }
}

/// How response bodies are received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// Read the body in one blocking call
    Blocking,
    /// Read the body in polls bounded by `tick`
    Incremental { tick: Duration },
}

/// An in-progress GET request.
///
/// Owns the partially received body; drive it with [`DownloadRequest::poll`]
/// or finish it with [`DownloadRequest::read_all`].
pub struct DownloadRequest<R = reqwest::blocking::Response> {
    response: R,
    body: Vec<u8>,
    total: Option<u64>,
    etag: Option<String>,
    finished: bool,
}

impl DownloadRequest {
    /// Send the request and wait for the response headers
    pub fn start(client: &reqwest::blocking::Client, url: &str) -> Result<Self, HttpError> {
        let response = client.get(url).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status(status.as_u16()));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let total = response.content_length();

        Ok(Self::from_reader(response, total, etag))
    }
}

impl<R: Read> DownloadRequest<R> {
    /// Wrap a body stream whose headers were already received
    pub fn from_reader(response: R, total: Option<u64>, etag: Option<String>) -> Self {
        Self {
            response,
            body: Vec::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize),
            total,
            etag,
            finished: false,
        }
    }

    /// Current progress
    pub fn status(&self) -> DownloadStatus {
        DownloadStatus {
            finished: self.finished,
            current: self.body.len() as u64,
            total: self.total,
        }
    }

    /// Receive data until `budget` has elapsed or the body ends.
    ///
    /// The budget is only checked between reads. A read that blocks is
    /// bounded by the client's request timeout, not by `budget`.
    pub fn poll(&mut self, budget: Duration) -> Result<DownloadStatus, HttpError> {
        let started = Instant::now();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        while !self.finished {
            let n = self.response.read(&mut chunk)?;
            if n == 0 {
                self.finished = true;
                break;
            }
            self.body.extend_from_slice(&chunk[..n]);
            if started.elapsed() >= budget {
                break;
            }
        }

        Ok(self.status())
    }

    /// Receive the rest of the body in one call
    pub fn read_all(&mut self) -> Result<DownloadStatus, HttpError> {
        if !self.finished {
            self.response.read_to_end(&mut self.body)?;
            self.finished = true;
        }
        Ok(self.status())
    }

    /// Hand over the received body and headers
    pub fn into_response(self) -> HttpResponse {
        HttpResponse {
            body: self.body,
            etag: self.etag,
        }
    }
}

/// [`HttpClient`] backed by blocking reqwest
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
    mode: DownloadMode,
}

impl ReqwestClient {
    /// Create a client from the network configuration
    pub fn new(config: &NetworkConfig) -> Result<Self, HttpError> {
        let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .build()?;

        let mode = if config.incremental_download {
            DownloadMode::Incremental {
                tick: Duration::from_millis(config.download_tick_ms.max(1)),
            }
        } else {
            DownloadMode::Blocking
        };

        Ok(Self { client, mode })
    }

    /// Start a request without receiving its body
    pub fn start(&self, url: &str) -> Result<DownloadRequest, HttpError> {
        DownloadRequest::start(&self.client, url)
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.get_with_progress(url, &mut |_, _| {})
    }

    fn get_with_progress(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<HttpResponse, HttpError> {
        log::debug!("GET {}", url);
        let mut request = self.start(url)?;

        match self.mode {
            DownloadMode::Blocking => {
                let status = request.read_all()?;
                on_progress(status.current, status.total);
            }
            DownloadMode::Incremental { tick } => loop {
                let status = request.poll(tick)?;
                on_progress(status.current, status.total);
                if status.finished {
                    break;
                }
            },
        }

        let response = request.into_response();
        log::debug!("Downloaded {} bytes from {}", response.body.len(), url);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticClient(Vec<u8>);

    impl HttpClient for StaticClient {
        fn get(&self, _url: &str) -> Result<HttpResponse, HttpError> {
            Ok(HttpResponse {
                body: self.0.clone(),
                etag: None,
            })
        }
    }

    #[test]
    fn test_default_progress_reports_completion() {
        let client = StaticClient(vec![1, 2, 3]);
        let mut seen = Vec::new();
        let response = client
            .get_with_progress("http://example.invalid", &mut |current, total| {
                seen.push((current, total))
            })
            .unwrap();
        assert_eq!(response.body, vec![1, 2, 3]);
        assert_eq!(seen, vec![(3, Some(3))]);
    }

    #[test]
    fn test_client_reference_forwards() {
        let client = StaticClient(b"abc".to_vec());
        let by_ref: &dyn HttpClient = &client;
        assert_eq!((&by_ref).get("x").unwrap().body, b"abc");
    }

    /// Body stream that stalls before every chunk
    struct SlowBody {
        chunks: Vec<Vec<u8>>,
        delay: Duration,
    }

    impl Read for SlowBody {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            std::thread::sleep(self.delay);
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_poll_stops_after_budget() {
        let body = SlowBody {
            chunks: vec![vec![1; 4], vec![2; 4], vec![3; 4]],
            delay: Duration::from_millis(20),
        };
        let mut request = DownloadRequest::from_reader(body, Some(12), Some("\"tag\"".into()));

        // Every read outlasts the budget, so each poll takes exactly one chunk
        let status = request.poll(Duration::from_millis(1)).unwrap();
        assert_eq!(
            status,
            DownloadStatus {
                finished: false,
                current: 4,
                total: Some(12)
            }
        );
        assert_eq!(request.poll(Duration::from_millis(1)).unwrap().current, 8);

        let status = request.read_all().unwrap();
        assert!(status.finished);
        assert_eq!(status.current, 12);

        let response = request.into_response();
        assert_eq!(response.body.len(), 12);
        assert_eq!(response.etag.as_deref(), Some("\"tag\""));
    }

    #[test]
    fn test_poll_reaches_end_of_body() {
        let body = SlowBody {
            chunks: vec![b"abc".to_vec()],
            delay: Duration::ZERO,
        };
        let mut request = DownloadRequest::from_reader(body, None, None);

        let status = request.poll(Duration::from_secs(5)).unwrap();
        assert!(status.finished);
        assert_eq!(status.current, 3);
        assert_eq!(status.total, None);
        assert_eq!(request.into_response().body, b"abc");
    }

    #[test]
    fn test_reqwest_client_modes() {
        let blocking = NetworkConfig {
            incremental_download: false,
            ..Default::default()
        };
        assert_eq!(ReqwestClient::new(&blocking).unwrap().mode, DownloadMode::Blocking);

        let incremental = NetworkConfig {
            download_tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            ReqwestClient::new(&incremental).unwrap().mode,
            DownloadMode::Incremental {
                tick: Duration::from_millis(1)
            }
        );
    }
}
