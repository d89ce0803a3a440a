//! Explicit configuration for remote sources.
//!
//! Remote backends never read process environment. Everything they need is
//! carried by a [`RemoteConfig`] handed to their constructor, and missing or
//! invalid values are reported the first time they are actually needed.

use std::time::Duration;

use crate::error::{IoError, Result};
use crate::io::Protocol;

/// Block size used for HTTP(S) sources when none is configured.
pub const DEFAULT_HTTP_BLOCK_SIZE: usize = 1024;

/// FTP range requests open a new connection each time, so larger blocks
/// amortise the connection overhead.
pub const DEFAULT_FTP_BLOCK_SIZE: usize = 102_400;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteConfig {
    block_size: Option<usize>,
    write_endpoint: Option<String>,
    connect_timeout_secs: Option<u64>,
}

impl RemoteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Path (or absolute URL) of the server-side script that accepts
    /// POST-based partial writes.
    pub fn with_write_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.write_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    /// Block size for `protocol`, falling back to the protocol default when
    /// unset or zero.
    pub fn block_size_for(&self, protocol: Protocol) -> usize {
        match self.block_size {
            Some(size) if size > 0 => size,
            _ => match protocol {
                Protocol::Ftp | Protocol::Sftp => DEFAULT_FTP_BLOCK_SIZE,
                _ => DEFAULT_HTTP_BLOCK_SIZE,
            },
        }
    }

    pub fn write_endpoint(&self) -> Result<&str> {
        match self.write_endpoint.as_deref() {
            Some(endpoint) if !endpoint.trim().is_empty() => Ok(endpoint),
            _ => Err(IoError::Config(
                "no write endpoint configured for remote writes".to_string(),
            )),
        }
    }

    pub fn connect_timeout(&self) -> Result<Duration> {
        match self.connect_timeout_secs {
            Some(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            Some(_) => Err(IoError::Config(
                "connect timeout must be a positive number of seconds".to_string(),
            )),
            None => Err(IoError::Config("no connect timeout configured".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_defaults_per_protocol() {
        let config = RemoteConfig::new();
        assert_eq!(config.block_size_for(Protocol::Http), DEFAULT_HTTP_BLOCK_SIZE);
        assert_eq!(config.block_size_for(Protocol::Https), DEFAULT_HTTP_BLOCK_SIZE);
        assert_eq!(config.block_size_for(Protocol::Ftp), DEFAULT_FTP_BLOCK_SIZE);

        let config = RemoteConfig::new().with_block_size(4096);
        assert_eq!(config.block_size_for(Protocol::Ftp), 4096);

        let config = RemoteConfig::new().with_block_size(0);
        assert_eq!(config.block_size_for(Protocol::Http), DEFAULT_HTTP_BLOCK_SIZE);
    }

    #[test]
    fn missing_values_fail_on_use() {
        let config = RemoteConfig::new();
        assert!(matches!(config.write_endpoint(), Err(IoError::Config(_))));
        assert!(matches!(config.connect_timeout(), Err(IoError::Config(_))));

        let config = RemoteConfig::new()
            .with_write_endpoint("   ")
            .with_connect_timeout_secs(0);
        assert!(matches!(config.write_endpoint(), Err(IoError::Config(_))));
        assert!(matches!(config.connect_timeout(), Err(IoError::Config(_))));
    }

    #[test]
    fn configured_values() {
        let config = RemoteConfig::new()
            .with_write_endpoint("/upload.php")
            .with_connect_timeout_secs(7);
        assert_eq!(config.write_endpoint().unwrap(), "/upload.php");
        assert_eq!(config.connect_timeout().unwrap(), Duration::from_secs(7));
    }
}
