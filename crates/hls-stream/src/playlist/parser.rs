use std::sync::Arc;

use m3u8_rs::{
    AlternativeMedia, AlternativeMediaType, ClosedCaptionGroupId, ExtTag, Key, MediaPlaylistType,
    SessionDataField, parse_playlist_res,
};
use tracing::trace;
use url::Url;

use super::{
    ByteRange, EncryptionKey, InitSegment, KeyMethod, MasterPlaylist, MediaPlaylist, Playlist,
    PlaylistType, Rendition, RenditionType, Segment, SessionData, Variant,
};
use crate::error::{HlsError, HlsResult};

/// Turns manifest text into a [`Playlist`].
///
/// Implementations classify master and media manifests and resolve every URI
/// against `base_url`.
pub trait PlaylistParser: Send + Sync {
    fn parse(&self, text: &str, base_url: &str) -> HlsResult<Playlist>;
}

/// Resolves `uri` against `base`.
///
/// An absolute `uri` is returned normalized, a relative one is joined onto
/// `base`, and anything that cannot be resolved is returned unchanged.
pub fn resolve_uri(uri: &str, base: &str) -> String {
    if let Ok(absolute) = Url::parse(uri) {
        return absolute.into();
    }
    Url::parse(base)
        .and_then(|base| base.join(uri))
        .map(String::from)
        .unwrap_or_else(|_| uri.to_owned())
}

/// [`PlaylistParser`] backed by `m3u8-rs`
#[derive(Debug, Clone, Copy, Default)]
pub struct M3u8Parser;

impl PlaylistParser for M3u8Parser {
    fn parse(&self, text: &str, base_url: &str) -> HlsResult<Playlist> {
        let malformed = |reason: &str| HlsError::MalformedManifest {
            url: base_url.to_owned(),
            reason: reason.to_owned(),
        };

        if !text.trim_start().starts_with("#EXTM3U") {
            return Err(malformed("missing #EXTM3U header"));
        }

        let parsed = parse_playlist_res(text.as_bytes())
            .map_err(|_| malformed("not a valid M3U8 playlist"))?;
        let source: Arc<str> = Arc::from(text);

        Ok(match parsed {
            m3u8_rs::Playlist::MasterPlaylist(master) => {
                trace!(url = %base_url, variants = master.variants.len(), "Parsed master playlist");
                Playlist::Master(convert_master(master, source, base_url))
            }
            m3u8_rs::Playlist::MediaPlaylist(media) => {
                trace!(url = %base_url, segments = media.segments.len(), "Parsed media playlist");
                Playlist::Media(convert_media(media, source, base_url))
            }
        })
    }
}

fn convert_master(master: m3u8_rs::MasterPlaylist, source: Arc<str>, base: &str) -> MasterPlaylist {
    let variants = master
        .variants
        .iter()
        .map(|stream| {
            let mut variant = Variant {
                uri: resolve_uri(&stream.uri, base),
                bandwidth: stream.bandwidth,
                average_bandwidth: stream.average_bandwidth,
                codecs: stream.codecs.clone(),
                resolution: stream.resolution.as_ref().map(|r| (r.width, r.height)),
                is_i_frame: stream.is_i_frame,
                ..Variant::default()
            };

            let closed_captions = match &stream.closed_captions {
                Some(ClosedCaptionGroupId::GroupId(id)) => Some(id.as_str()),
                _ => None,
            };
            let groups = [
                (RenditionType::Audio, stream.audio.as_deref()),
                (RenditionType::Video, stream.video.as_deref()),
                (RenditionType::Subtitles, stream.subtitles.as_deref()),
                (RenditionType::ClosedCaptions, closed_captions),
            ];
            for (kind, group_id) in groups {
                if let Some(group_id) = group_id {
                    *variant.renditions_mut(kind) = master
                        .alternatives
                        .iter()
                        .filter(|alt| rendition_type(&alt.media_type) == Some(kind))
                        .filter(|alt| alt.group_id == group_id)
                        .map(|alt| convert_rendition(alt, kind, base))
                        .collect();
                }
            }
            variant
        })
        .collect();

    let session_data = master
        .session_data
        .into_iter()
        .map(|data| {
            let (value, uri) = match data.field {
                SessionDataField::Value(value) => (Some(value), None),
                SessionDataField::Uri(uri) => (None, Some(resolve_uri(&uri, base))),
            };
            SessionData {
                data_id: data.data_id,
                language: data.language,
                value,
                uri,
                data: None,
            }
        })
        .collect();

    let session_keys = master
        .session_key
        .iter()
        .map(|session_key| convert_key(&session_key.0, base))
        .collect();

    MasterPlaylist {
        uri: base.to_owned(),
        source,
        variants,
        session_data,
        session_keys,
    }
}

fn rendition_type(media_type: &AlternativeMediaType) -> Option<RenditionType> {
    match media_type {
        AlternativeMediaType::Audio => Some(RenditionType::Audio),
        AlternativeMediaType::Video => Some(RenditionType::Video),
        AlternativeMediaType::Subtitles => Some(RenditionType::Subtitles),
        AlternativeMediaType::ClosedCaptions => Some(RenditionType::ClosedCaptions),
        _ => None,
    }
}

fn convert_rendition(alt: &AlternativeMedia, kind: RenditionType, base: &str) -> Rendition {
    Rendition {
        kind,
        group_id: alt.group_id.clone(),
        name: alt.name.clone(),
        language: alt.language.clone(),
        is_default: alt.default,
        autoselect: alt.autoselect,
        uri: alt.uri.as_deref().map(|uri| resolve_uri(uri, base)),
    }
}

fn convert_key(key: &Key, base: &str) -> EncryptionKey {
    let method = match &key.method {
        m3u8_rs::KeyMethod::None => KeyMethod::None,
        m3u8_rs::KeyMethod::AES128 => KeyMethod::Aes128,
        m3u8_rs::KeyMethod::SampleAES => KeyMethod::SampleAes,
        m3u8_rs::KeyMethod::Other(other) => KeyMethod::Other(other.clone()),
    };
    EncryptionKey {
        method,
        uri: key.uri.as_deref().map(|uri| resolve_uri(uri, base)),
        iv: key.iv.clone(),
        key_format: key.keyformat.clone(),
        data: None,
    }
}

fn is_clear_key(tag: &ExtTag) -> bool {
    tag.tag == "X-KEY"
        && tag.rest.as_deref().is_some_and(|rest| {
            rest.split(',')
                .any(|attr| attr.trim().eq_ignore_ascii_case("METHOD=NONE"))
        })
}

fn convert_media(media: m3u8_rs::MediaPlaylist, source: Arc<str>, base: &str) -> MediaPlaylist {
    // Keys and init sections apply to every following segment until replaced
    let mut key: Option<EncryptionKey> = None;
    let mut map: Option<InitSegment> = None;
    // A byte range without offset continues where the previous range of the same resource ended
    let mut previous_range: Option<(String, u64)> = None;

    let mut segments = Vec::with_capacity(media.segments.len());
    for (index, segment) in media.segments.iter().enumerate() {
        // m3u8-rs rejects METHOD=NONE without an IV and keeps it as an unknown tag
        if segment.unknown_tags.iter().any(is_clear_key) {
            key = None;
        }
        if let Some(tag) = &segment.key {
            key = Some(convert_key(tag, base)).filter(|k| k.method != KeyMethod::None);
        }
        if let Some(tag) = &segment.map {
            map = Some(InitSegment {
                uri: resolve_uri(&tag.uri, base),
                byte_range: tag.byte_range.as_ref().map(|r| ByteRange {
                    length: r.length,
                    offset: r.offset.or(Some(0)),
                }),
                data: None,
                mime_type: None,
            });
        }

        let uri = resolve_uri(&segment.uri, base);
        let byte_range = segment.byte_range.as_ref().map(|range| {
            let offset = range.offset.or_else(|| match &previous_range {
                Some((previous_uri, end)) if *previous_uri == uri => Some(*end),
                _ => None,
            });
            ByteRange {
                length: range.length,
                offset,
            }
        });
        previous_range = byte_range.map(|r| (uri.clone(), r.offset.unwrap_or(0) + r.length));

        segments.push(Segment {
            uri,
            media_sequence: media.media_sequence + index as u64,
            duration: f64::from(segment.duration),
            title: segment.title.clone().filter(|title| !title.is_empty()),
            discontinuity: segment.discontinuity,
            byte_range,
            key: key.clone(),
            map: map.clone(),
            data: None,
            mime_type: None,
        });
    }

    let playlist_type = match media.playlist_type {
        Some(MediaPlaylistType::Vod) => PlaylistType::Vod,
        Some(MediaPlaylistType::Event) => PlaylistType::Event,
        _ => PlaylistType::Unspecified,
    };

    MediaPlaylist {
        uri: base.to_owned(),
        source,
        hash: String::new(),
        segments,
        target_duration: media.target_duration as f64,
        media_sequence: media.media_sequence,
        playlist_type,
        end_list: media.end_list,
        i_frames_only: media.i_frames_only,
    }
}
