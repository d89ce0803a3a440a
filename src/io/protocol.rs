use crate::error::Result;

/// Where a path points to, judged from its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    File,
    Http,
    Https,
    Ftp,
    Sftp,
    /// `data:` URI carrying a base64 payload
    DataUri,
    /// `-`, standard input
    Stdin,
}

impl Protocol {
    pub fn detect(path: &str) -> Protocol {
        const PREFIXES: [(&str, Protocol); 5] = [
            ("http://", Protocol::Http),
            ("https://", Protocol::Https),
            ("ftp://", Protocol::Ftp),
            ("sftp://", Protocol::Sftp),
            ("data:", Protocol::DataUri),
        ];

        if path == "-" {
            return Protocol::Stdin;
        }
        let lower = path.get(..8).unwrap_or(path).to_ascii_lowercase();
        PREFIXES
            .iter()
            .find(|(prefix, _)| lower.starts_with(prefix))
            .map(|(_, protocol)| *protocol)
            .unwrap_or(Protocol::File)
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Protocol::Http | Protocol::Https | Protocol::Ftp | Protocol::Sftp
        )
    }
}

/// Block span requested from a [`ProtocolBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRange {
    /// Blocks `low..=high`. The backend may return fewer bytes when the
    /// span runs past the end of the resource.
    Blocks { low: usize, high: usize },
    /// The whole resource, used when its length is unknown.
    Whole,
}

/// Transport used by [`RemoteSource`](super::RemoteSource).
///
/// A backend is owned by exactly one remote source. All calls block until
/// the request completes; timeouts are the backend's business.
pub trait ProtocolBackend {
    /// Length of the resource in bytes, `None` when the server does not say.
    fn length(&mut self) -> Result<Option<u64>>;

    /// Fetch a block span with block size `block_size`.
    fn fetch_range(&mut self, range: FetchRange, block_size: usize) -> Result<Vec<u8>>;

    /// Replace bytes `from..to` of the remote resource with `data`.
    fn push_range(&mut self, data: &[u8], from: u64, to: u64) -> Result<()>;
}
