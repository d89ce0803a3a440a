use anyhow::anyhow;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, trace};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, Response, Url};
use tokio::runtime::{Builder, Runtime};

use super::protocol::{FetchRange, ProtocolBackend};
use crate::config::RemoteConfig;
use crate::error::{IoError, Result};

/// HTTP(S) transport for remote sources
///
/// Reads go through `HEAD` and ranged `GET` requests. Partial writes are
/// POSTed as a form to a server-side script (the configured write
/// endpoint), which is expected to splice the bytes into the resource.
pub struct HttpBackend {
    url: String,
    config: RemoteConfig,
    runtime: Runtime,
    client: Option<Client>,
    transferred_bytes: u64,
}

impl HttpBackend {
    /// Create a backend for `url`. No request is sent and the configuration
    /// is not validated until the first call.
    pub fn new(url: impl Into<String>, config: RemoteConfig) -> Result<Self> {
        let url = url.into();
        Url::parse(&url).map_err(|e| anyhow!("Invalid URL {url}: {e}"))?;
        let runtime = Builder::new_current_thread().enable_all().build()?;

        Ok(Self {
            url,
            config,
            runtime,
            client: None,
            transferred_bytes: 0,
        })
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    fn client(&mut self) -> Result<Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let timeout = self.config.connect_timeout()?;
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| self.request_failed(None, e.to_string()))?;
        self.client = Some(client.clone());
        Ok(client)
    }

    fn request_failed(&self, status: Option<u16>, detail: String) -> IoError {
        IoError::RemoteRequestFailed {
            url: self.url.clone(),
            status,
            detail,
        }
    }

    fn check_status(&self, resp: &Response, verb: &str) -> Result<()> {
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(self.request_failed(Some(status.as_u16()), verb.to_string()));
        }
        Ok(())
    }

    /// Resolve the write endpoint. Endpoints without a scheme are taken as
    /// paths on the resource's own host.
    fn write_endpoint_url(&self) -> Result<Url> {
        let endpoint = self.config.write_endpoint()?;
        let invalid = |e: &dyn std::fmt::Display| {
            IoError::Config(format!("Invalid write endpoint {endpoint}: {e}"))
        };

        if endpoint.contains("://") {
            return Url::parse(endpoint).map_err(|e| invalid(&e));
        }
        let base = Url::parse(&self.url).map_err(|e| anyhow!("Invalid URL {}: {e}", self.url))?;
        let path = if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{endpoint}")
        };
        base.join(&path).map_err(|e| invalid(&e))
    }
}

impl ProtocolBackend for HttpBackend {
    fn length(&mut self) -> Result<Option<u64>> {
        let client = self.client()?;
        let resp = self
            .runtime
            .block_on(client.head(&self.url).send())
            .map_err(|e| self.request_failed(e.status().map(|s| s.as_u16()), e.to_string()))?;
        self.check_status(&resp, "HEAD")?;

        // Get file size from Content-Length
        let length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        debug!("{}: content length {length:?}", self.url);
        Ok(length)
    }

    fn fetch_range(&mut self, range: FetchRange, block_size: usize) -> Result<Vec<u8>> {
        let client = self.client()?;
        let mut request = client.get(&self.url);
        if let FetchRange::Blocks { low, high } = range {
            let range = format!("bytes={}-{}", low * block_size, (high + 1) * block_size - 1);
            trace!("{}: GET {range}", self.url);
            request = request.header(RANGE, range);
        }

        let bytes = self
            .runtime
            .block_on(async {
                let resp = request.send().await?;
                let status = resp.status();
                let bytes = resp.bytes().await?;
                Ok::<_, reqwest::Error>((status, bytes))
            })
            .map_err(|e| self.request_failed(e.status().map(|s| s.as_u16()), e.to_string()))?;
        let (status, bytes) = bytes;
        if status.is_client_error() || status.is_server_error() {
            return Err(self.request_failed(Some(status.as_u16()), "GET".to_string()));
        }

        self.transferred_bytes += bytes.len() as u64;
        Ok(bytes.to_vec())
    }

    fn push_range(&mut self, data: &[u8], from: u64, to: u64) -> Result<()> {
        let endpoint = self.write_endpoint_url()?;
        let client = self.client()?;
        let target = Url::parse(&self.url)
            .map(|url| url.path().to_string())
            .map_err(|e| anyhow!("Invalid URL {}: {e}", self.url))?;

        let form = [
            ("path", target),
            ("from", from.to_string()),
            ("to", to.to_string()),
            ("data", BASE64.encode(data)),
        ];
        debug!("{}: POST {} bytes to {endpoint}", self.url, data.len());
        let resp = self
            .runtime
            .block_on(client.post(endpoint).form(&form).send())
            .map_err(|e| self.request_failed(e.status().map(|s| s.as_u16()), e.to_string()))?;
        self.check_status(&resp, "POST")
    }
}
