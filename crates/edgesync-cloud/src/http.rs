use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use edgesync_commons::models::device_info_model::DeviceInfo;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{
    debug,
    warn,
};
use serde::de::DeserializeOwned;

use crate::error::SyncError;

/// Payloads at or above this size are gzip-compressed when the request
/// opts into compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub compress: bool,
}

impl RequestOptions {
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }
}

/// Response with case-insensitive header access and a lazy body decoder.
#[derive(Clone, Debug, Default)]
pub struct HttpResponse {
    pub status: u16,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        serde_json::from_slice(&self.body).map_err(|e| SyncError::Decode(e.to_string()))
    }

    /// `Retry-After` in seconds, when the server sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Thin HTTP seam. Exists so the sync engine is testable without a
/// network; the reqwest implementation below is the production one.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, opts: RequestOptions) -> Result<HttpResponse, SyncError>;

    async fn post(
        &self, url: &str, body: Vec<u8>, opts: RequestOptions,
    ) -> Result<HttpResponse, SyncError>;

    async fn patch(
        &self, url: &str, body: Vec<u8>, opts: RequestOptions,
    ) -> Result<HttpResponse, SyncError>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl ReqwestClient {
    /// Build a client for the given endpoint with the TLS policy applied
    /// at construction: loopback HTTPS skips verification (development),
    /// a provisioned CA cert becomes the sole trust root, anything else
    /// uses system trust.
    pub fn from_device_info(
        endpoint: &str, info: &DeviceInfo, default_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let mut builder = reqwest::Client::builder().timeout(default_timeout);

        if is_loopback_https(endpoint) {
            warn!("Loopback HTTPS endpoint; certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(tls) = &info.api_tls_config {
            let cert = reqwest::Certificate::from_pem(tls.ca_cert.as_bytes())
                .map_err(|e| SyncError::NotConfigured(format!("invalid CA certificate: {e}")))?;
            builder = builder
                .add_root_certificate(cert)
                .tls_built_in_root_certs(false);
            if !tls.verify_certificate {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let client = builder
            .build()
            .map_err(|e| SyncError::NotConfigured(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            default_timeout,
        })
    }

    async fn execute(
        &self, method: reqwest::Method, url: &str, body: Option<Vec<u8>>, opts: RequestOptions,
    ) -> Result<HttpResponse, SyncError> {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let mut request = self.client.request(method, url).timeout(timeout);

        for (name, value) in &opts.headers {
            request = request.header(name, value);
        }

        if let Some(body) = body {
            if opts.compress && body.len() >= COMPRESSION_THRESHOLD {
                let compressed = gzip(&body)?;
                debug!(
                    "Compressed request body {} -> {} bytes",
                    body.len(),
                    compressed.len()
                );
                request = request.header("Content-Encoding", "gzip").body(compressed);
            } else {
                request = request.body(body);
            }
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse::new(status, headers, body))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, opts: RequestOptions) -> Result<HttpResponse, SyncError> {
        self.execute(reqwest::Method::GET, url, None, opts).await
    }

    async fn post(
        &self, url: &str, body: Vec<u8>, opts: RequestOptions,
    ) -> Result<HttpResponse, SyncError> {
        self.execute(reqwest::Method::POST, url, Some(body), opts)
            .await
    }

    async fn patch(
        &self, url: &str, body: Vec<u8>, opts: RequestOptions,
    ) -> Result<HttpResponse, SyncError> {
        self.execute(reqwest::Method::PATCH, url, Some(body), opts)
            .await
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| SyncError::Network(format!("gzip failed: {e}")))
}

fn is_loopback_https(endpoint: &str) -> bool {
    match reqwest::Url::parse(endpoint) {
        Ok(url) => {
            url.scheme() == "https"
                && matches!(url.host_str(), Some("localhost") | Some("127.0.0.1"))
        }
        Err(_) => false,
    }
}
