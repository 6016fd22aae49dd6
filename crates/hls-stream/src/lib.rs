//! # HLS Stream
//!
//! A client engine for HTTP Live Streaming. Given the URL of a master or
//! media playlist it produces a stream of parsed playlists and fully loaded
//! segments, following live playlists until they end.
//!
//! ## Features
//!
//! - Variant and rendition selection through a callback port
//! - Deduplicated, concurrency-bounded loading with a bounded FIFO cache
//! - Segment keys, init sections and byte ranges resolved before delivery
//! - Live playlist polling with back-off on unchanged revisions
//!
//! ```no_run
//! use futures::StreamExt;
//! use hls_stream::{HlsStreamConfig, SelectAll, StreamEvent};
//!
//! # async fn run() -> hls_stream::HlsResult<()> {
//! let config = HlsStreamConfig::builder().with_concurrency(4).build();
//! let mut stream = hls_stream::open("https://example.com/master.m3u8", config, SelectAll)?;
//! while let Some(event) = stream.next().await {
//!     match event? {
//!         StreamEvent::Segment(segment) => println!("{}", segment.uri),
//!         StreamEvent::End => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod playlist;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use builder::HlsStreamConfigBuilder;
pub use cache::{MemoryCache, Payload, Resource};
pub use config::{HlsStreamConfig, HttpConfig, LoaderConfig};
pub use error::{HlsError, HlsResult, TransportError};
pub use loader::{LoadOptions, Loader};
pub use playlist::{
    ByteRange, EncryptionKey, InitSegment, KeyMethod, M3u8Parser, MasterPlaylist, MediaPlaylist,
    Playlist, PlaylistParser, PlaylistType, Rendition, RenditionType, Segment, SessionData,
    Variant,
};
pub use session::{HlsReadStream, SelectAll, SelectionPort, Selector, SessionState, StreamEvent};
pub use transport::{HttpTransport, Transport};

/// Opens a read session over HTTP.
///
/// Nothing is requested until the returned stream is first polled.
pub fn open(
    url: &str,
    config: HlsStreamConfig,
    selection: impl SelectionPort + 'static,
) -> HlsResult<HlsReadStream> {
    Ok(HlsReadStream::new(url, config)?.with_selection(selection))
}
