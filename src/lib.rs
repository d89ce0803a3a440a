//! # sourceio
//!
//! Uniform byte-addressable I/O over local files, growable memory buffers
//! and files served over HTTP Range requests.
//!
//! Every backend implements [`IoSource`]: a cursor-based read/write/seek
//! interface with whole-content mapping and a `transfer` operation that
//! replaces a source's content with another's. Remote resources are read
//! lazily in fixed-size blocks, and writing back only pushes the byte range
//! that actually changed.
//!
//! ## Features
//!
//! - Local files with on-demand reopening for writes and native mmap
//! - In-memory sources with amortized growth
//! - Remote HTTP(S) sources with block caching and diff-based writes
//! - Standard input and `data:` URIs staged through a temporary file
//!
//! ## Example
//!
//! ```no_run
//! use sourceio::{IoSource, MemorySource, RemoteConfig, SeekOrigin, create_source};
//!
//! fn main() -> sourceio::Result<()> {
//!     let config = RemoteConfig::new().with_connect_timeout_secs(10);
//!     let mut remote = create_source("https://example.com/photo.jpg", &config)?;
//!     remote.open()?;
//!
//!     // Only the blocks covering these bytes are fetched
//!     remote.seek(2, SeekOrigin::Begin)?;
//!     let marker = remote.read_vec(2)?;
//!     println!("{marker:02x?}");
//!
//!     // Copy everything into memory
//!     let mut copy = MemorySource::new();
//!     copy.write_from(remote.as_mut())?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;

pub use config::RemoteConfig;
pub use error::{IoError, Result};
pub use io::{
    ByteBuffer, FileSource, HttpBackend, IoSource, MemorySource, OpenMode, Protocol,
    ProtocolBackend, RemoteSource, SeekOrigin, StagingSource, create_source,
};
