//! # Playlists
//!
//! The engine's own playlist model. Every URI in it is absolute, resolved
//! against the URL the manifest was loaded from. Segments, keys, init maps and
//! session data carry `data` slots that the session fills as their bodies
//! arrive.

mod parser;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::Payload;

pub use parser::{M3u8Parser, PlaylistParser, resolve_uri};

/// A parsed manifest
#[derive(Debug, Clone)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

impl Playlist {
    pub fn uri(&self) -> &str {
        match self {
            Playlist::Master(master) => &master.uri,
            Playlist::Media(media) => &media.uri,
        }
    }

    pub fn as_master(&self) -> Option<&MasterPlaylist> {
        match self {
            Playlist::Master(master) => Some(master),
            Playlist::Media(_) => None,
        }
    }

    pub fn as_media(&self) -> Option<&MediaPlaylist> {
        match self {
            Playlist::Media(media) => Some(media),
            Playlist::Master(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterPlaylist {
    pub uri: String,
    /// Manifest text as received
    pub source: Arc<str>,
    pub variants: Vec<Variant>,
    pub session_data: Vec<SessionData>,
    pub session_keys: Vec<EncryptionKey>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaylistType {
    #[default]
    Unspecified,
    Event,
    Vod,
}

#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub uri: String,
    /// Manifest text as received
    pub source: Arc<str>,
    /// MD5 hex digest of `source`, set by the session
    pub hash: String,
    pub segments: Vec<Segment>,
    /// Seconds
    pub target_duration: f64,
    pub media_sequence: u64,
    pub playlist_type: PlaylistType,
    pub end_list: bool,
    pub i_frames_only: bool,
}

impl MediaPlaylist {
    pub fn is_vod(&self) -> bool {
        self.playlist_type == PlaylistType::Vod
    }

    /// No further revisions will be published.
    pub fn is_finished(&self) -> bool {
        self.is_vod() || self.end_list
    }
}

/// A `#EXT-X-STREAM-INF` entry with the renditions of the groups it references
#[derive(Debug, Clone, Default)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: u64,
    pub average_bandwidth: Option<u64>,
    pub codecs: Option<String>,
    /// Width and height
    pub resolution: Option<(u64, u64)>,
    pub is_i_frame: bool,
    pub audio: Vec<Rendition>,
    pub video: Vec<Rendition>,
    pub subtitles: Vec<Rendition>,
    pub closed_captions: Vec<Rendition>,
}

impl Variant {
    pub fn renditions(&self, kind: RenditionType) -> &[Rendition] {
        match kind {
            RenditionType::Audio => &self.audio,
            RenditionType::Video => &self.video,
            RenditionType::Subtitles => &self.subtitles,
            RenditionType::ClosedCaptions => &self.closed_captions,
        }
    }

    pub(crate) fn renditions_mut(&mut self, kind: RenditionType) -> &mut Vec<Rendition> {
        match kind {
            RenditionType::Audio => &mut self.audio,
            RenditionType::Video => &mut self.video,
            RenditionType::Subtitles => &mut self.subtitles,
            RenditionType::ClosedCaptions => &mut self.closed_captions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenditionType {
    Audio,
    Video,
    Subtitles,
    ClosedCaptions,
}

impl RenditionType {
    /// Order in which rendition groups are offered for selection
    pub const ALL: [RenditionType; 4] = [
        RenditionType::Audio,
        RenditionType::Video,
        RenditionType::Subtitles,
        RenditionType::ClosedCaptions,
    ];
}

impl fmt::Display for RenditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenditionType::Audio => "audio",
            RenditionType::Video => "video",
            RenditionType::Subtitles => "subtitles",
            RenditionType::ClosedCaptions => "closedCaptions",
        };
        f.write_str(name)
    }
}

/// A `#EXT-X-MEDIA` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    pub kind: RenditionType,
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    pub is_default: bool,
    pub autoselect: bool,
    /// Absent when the rendition is carried in the variant stream itself
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub length: u64,
    pub offset: Option<u64>,
}

impl ByteRange {
    /// The part of `data` this range covers, clamped to its bounds.
    ///
    /// The offset defaults to 0.
    pub fn slice(&self, data: &Bytes) -> Bytes {
        let len = data.len() as u64;
        let start = self.offset.unwrap_or(0).min(len);
        let end = start.saturating_add(self.length).min(len);
        data.slice(start as usize..end as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMethod {
    None,
    Aes128,
    SampleAes,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct EncryptionKey {
    pub method: KeyMethod,
    pub uri: Option<String>,
    pub iv: Option<String>,
    pub key_format: Option<String>,
    /// Key bytes once loaded
    pub data: Option<Bytes>,
}

impl EncryptionKey {
    /// Whether key material still has to be fetched.
    pub fn needs_fetch(&self) -> bool {
        self.method != KeyMethod::None && self.uri.is_some() && self.data.is_none()
    }
}

/// Media initialization section (`#EXT-X-MAP`)
#[derive(Debug, Clone)]
pub struct InitSegment {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub data: Option<Payload>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub uri: String,
    pub media_sequence: u64,
    /// Seconds
    pub duration: f64,
    pub title: Option<String>,
    pub discontinuity: bool,
    pub byte_range: Option<ByteRange>,
    pub key: Option<EncryptionKey>,
    pub map: Option<InitSegment>,
    pub data: Option<Payload>,
    pub mime_type: Option<String>,
}

impl Segment {
    /// Body, key material and init section are all present.
    pub fn is_complete(&self) -> bool {
        self.data.is_some()
            && self.key.as_ref().is_none_or(|key| !key.needs_fetch())
            && self.map.as_ref().is_none_or(|map| map.data.is_some())
    }
}

/// A `#EXT-X-SESSION-DATA` entry
#[derive(Debug, Clone)]
pub struct SessionData {
    pub data_id: String,
    pub language: Option<String>,
    pub value: Option<String>,
    pub uri: Option<String>,
    /// Parsed JSON loaded from `uri`
    pub data: Option<serde_json::Value>,
}

impl SessionData {
    pub fn needs_fetch(&self) -> bool {
        self.uri.is_some() && self.data.is_none()
    }
}
