//! # Read Session
//!
//! [`HlsReadStream`] walks an HLS presentation from its root manifest: it
//! resolves a master playlist into the selected media playlists, loads every
//! new segment with its key and init section, re-polls live playlists and
//! finishes once no further revision is expected and nothing is in flight.
//!
//! The session is a [`Stream`] and does nothing until first polled. All
//! loading happens through one [`Loader`]; completions are handled one at a
//! time inside `poll_next`, so the state below needs no locking.

mod events;
mod selection;
mod state;

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, Stream, StreamExt};
use md5::{Digest, Md5};
use tokio_util::time::DelayQueue;
use tracing::{debug, info, trace, warn};

use crate::cache::{Payload, Resource};
use crate::config::HlsStreamConfig;
use crate::error::{HlsError, HlsResult};
use crate::loader::{LoadOptions, Loader};
use crate::playlist::{
    ByteRange, M3u8Parser, MasterPlaylist, MediaPlaylist, Playlist, PlaylistParser, RenditionType,
    Segment, Variant,
};
use crate::transport::{HttpTransport, Transport};

pub use events::StreamEvent;
pub use selection::{SelectAll, SelectionPort, Selector};
pub use state::SessionState;

use selection::sanitize;
use state::{LoadTarget, SegmentPart};

type Completion = (LoadTarget, HlsResult<Resource>);

/// A segment waiting for its body, key or init section
struct Assembly {
    playlist_uri: String,
    segment: Segment,
}

pub struct HlsReadStream {
    url: String,
    config: HlsStreamConfig,
    loader: Loader,
    parser: Arc<dyn PlaylistParser>,
    selection: Box<dyn SelectionPort>,
    state: SessionState,

    master: Option<MasterPlaylist>,
    /// Bumped on every master playlist so late sub-resources of a replaced one are ignored
    master_generation: u64,
    /// Session data and keys of the current master still loading
    master_outstanding: usize,
    /// Latest revision of each tracked media playlist
    media_playlists: Vec<MediaPlaylist>,

    assemblies: HashMap<u64, Assembly>,
    next_segment_id: u64,

    loads: FuturesUnordered<BoxFuture<'static, Completion>>,
    pending_loads: usize,
    reloads: DelayQueue<String>,

    outbox: VecDeque<HlsResult<StreamEvent>>,
    finished: bool,
}

impl HlsReadStream {
    /// Session over HTTP with the `m3u8-rs` parser.
    pub fn new(url: impl Into<String>, config: HlsStreamConfig) -> HlsResult<Self> {
        let url = url.into();
        url::Url::parse(&url).map_err(|e| HlsError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let transport = HttpTransport::new(&config.http).map_err(|source| HlsError::Transport {
            url: url.clone(),
            source,
        })?;
        Ok(Self::with_collaborators(
            url,
            config,
            Arc::new(transport),
            Arc::new(M3u8Parser),
        ))
    }

    pub fn with_collaborators(
        url: impl Into<String>,
        config: HlsStreamConfig,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn PlaylistParser>,
    ) -> Self {
        let loader = Loader::new(transport, &config.loader);
        Self {
            url: url.into(),
            config,
            loader,
            parser,
            selection: Box::new(SelectAll),
            state: SessionState::Initialized,
            master: None,
            master_generation: 0,
            master_outstanding: 0,
            media_playlists: Vec::new(),
            assemblies: HashMap::new(),
            next_segment_id: 0,
            loads: FuturesUnordered::new(),
            pending_loads: 0,
            reloads: DelayQueue::new(),
            outbox: VecDeque::new(),
            finished: false,
        }
    }

    /// Replaces the default select-everything policy.
    pub fn with_selection(mut self, selection: impl SelectionPort + 'static) -> Self {
        self.selection = Box::new(selection);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Loads issued and not yet handled
    pub fn pending_loads(&self) -> usize {
        self.pending_loads
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    fn start(&mut self) {
        self.state = SessionState::Reading;
        info!(url = %self.url, "Starting HLS session");
        self.load_manifest(self.url.clone());
    }

    fn set_state(&mut self, next: SessionState) {
        // Ended is terminal
        if self.state == SessionState::Ended || self.state == next {
            return;
        }
        trace!(from = %self.state, to = %next, "Session state changed");
        self.state = next;
    }

    fn dispatch(&mut self, url: &str, options: LoadOptions, target: LoadTarget) {
        self.pending_loads += 1;
        let load = self.loader.load(url, options);
        self.loads.push(async move { (target, load.await) }.boxed());
    }

    fn load_manifest(&mut self, url: String) {
        // Manifests change between polls, always go to the network
        let options = LoadOptions::text().with_no_cache();
        self.dispatch(&url, options, LoadTarget::Manifest { url: url.clone() });
    }

    fn report(&mut self, err: HlsError) {
        warn!(url = err.url().unwrap_or("-"), error = %err, "Load failed");
        self.outbox.push_back(Err(err));
    }

    fn on_completion(&mut self, target: LoadTarget, result: HlsResult<Resource>) {
        debug_assert!(self.pending_loads > 0);
        self.pending_loads = self.pending_loads.saturating_sub(1);

        match target {
            LoadTarget::Manifest { url } => self.on_manifest(url, result),
            LoadTarget::Segment { id, part } => self.on_segment_part(id, part, result),
            LoadTarget::SessionData { generation, index } => {
                self.on_session_data(generation, index, result)
            }
            LoadTarget::SessionKey { generation, index } => {
                self.on_session_key(generation, index, result)
            }
        }
    }

    fn on_manifest(&mut self, url: String, result: HlsResult<Resource>) {
        let resource = match result {
            Ok(resource) => resource,
            Err(err) => return self.report(err),
        };
        let Some(text) = resource.data.as_text() else {
            return self.report(HlsError::Decode {
                url,
                reason: "manifest body is not text".to_string(),
            });
        };

        let hash = hex::encode(Md5::digest(text.as_bytes()));
        if let Some(unchanged) = self
            .media_playlists
            .iter()
            .find(|playlist| !playlist.is_vod() && playlist.hash == hash)
        {
            let delay = self.config.unchanged_delay(unchanged.target_duration);
            debug!(url = %url, delay = ?delay, "Playlist unchanged, retrying later");
            self.reloads.insert(url, delay);
            return;
        }

        match self.parser.parse(text, &url) {
            Ok(Playlist::Master(master)) => self.on_master(master),
            Ok(Playlist::Media(mut media)) => {
                media.hash = hash;
                self.on_media(media);
            }
            Err(err) => self.report(err),
        }
    }

    fn on_master(&mut self, master: MasterPlaylist) {
        self.set_state(SessionState::MasterParsed);
        self.master_generation += 1;
        let generation = self.master_generation;
        info!(
            url = %master.uri,
            variants = master.variants.len(),
            "Master playlist loaded"
        );

        let mut outstanding = 0;
        for (index, data) in master.session_data.iter().enumerate() {
            if let (true, Some(uri)) = (data.needs_fetch(), data.uri.as_deref()) {
                let target = LoadTarget::SessionData { generation, index };
                self.dispatch(uri, LoadOptions::text(), target);
                outstanding += 1;
            }
        }
        for (index, key) in master.session_keys.iter().enumerate() {
            if let (true, Some(uri)) = (key.needs_fetch(), key.uri.as_deref()) {
                let target = LoadTarget::SessionKey { generation, index };
                self.dispatch(uri, LoadOptions::buffer(), target);
                outstanding += 1;
            }
        }
        self.master_outstanding = outstanding;

        let streams = self.select_streams(&master.variants);
        self.master = Some(master);
        if outstanding == 0 {
            self.emit_master();
        }

        self.media_playlists.clear();
        // A variant is often also listed as a rendition of its own group
        let mut requested = HashSet::new();
        for url in streams {
            if requested.insert(url.clone()) {
                self.load_manifest(url);
            } else {
                trace!(url = %url, "Playlist already requested");
            }
        }
    }

    /// Runs the selection callbacks and returns the playlist URLs to load.
    fn select_streams(&mut self, variants: &[Variant]) -> Vec<String> {
        let chosen = self.selection.choose_variants(variants);
        let mut urls = Vec::new();
        for index in sanitize(chosen, variants.len(), "variant") {
            let variant = &variants[index];
            urls.push(variant.uri.clone());

            for kind in RenditionType::ALL {
                let renditions = variant.renditions(kind);
                if renditions.is_empty() {
                    continue;
                }
                let chosen = self.selection.choose_renditions(kind, renditions);
                for index in sanitize(chosen, renditions.len(), "rendition") {
                    // Renditions without URI are muxed into the variant stream
                    if let Some(uri) = &renditions[index].uri {
                        urls.push(uri.clone());
                    }
                }
            }
        }
        urls
    }

    fn emit_master(&mut self) {
        if let Some(master) = &self.master {
            let playlist = Playlist::Master(master.clone());
            self.outbox
                .push_back(Ok(StreamEvent::Playlist(Box::new(playlist))));
        }
    }

    /// One session data entry or key of the current master has settled.
    fn on_master_part_settled(&mut self) {
        self.master_outstanding = self.master_outstanding.saturating_sub(1);
        if self.master_outstanding == 0 {
            self.emit_master();
        }
    }

    fn on_session_data(&mut self, generation: u64, index: usize, result: HlsResult<Resource>) {
        if generation != self.master_generation {
            trace!(generation, "Ignoring session data of a replaced master playlist");
            if let Err(err) = result {
                self.report(err);
            }
            return;
        }
        let resource = match result {
            Ok(resource) => resource,
            Err(err) => {
                self.report(err);
                return self.on_master_part_settled();
            }
        };

        let entry = self
            .master
            .as_mut()
            .and_then(|master| master.session_data.get_mut(index));
        let malformed = entry.and_then(|entry| {
            let parsed: Result<serde_json::Value, String> = match resource.data.as_text() {
                Some(text) => serde_json::from_str(text).map_err(|e| e.to_string()),
                None => Err("body is not text".to_string()),
            };
            match parsed {
                Ok(value) => {
                    entry.data = Some(value);
                    None
                }
                Err(reason) => Some(HlsError::MalformedSessionData {
                    url: entry.uri.clone().unwrap_or_default(),
                    reason,
                }),
            }
        });
        if let Some(err) = malformed {
            self.report(err);
        }
        self.on_master_part_settled();
    }

    fn on_session_key(&mut self, generation: u64, index: usize, result: HlsResult<Resource>) {
        if generation != self.master_generation {
            trace!(generation, "Ignoring session key of a replaced master playlist");
            if let Err(err) = result {
                self.report(err);
            }
            return;
        }
        match result {
            Ok(resource) => {
                if let Some(key) = self
                    .master
                    .as_mut()
                    .and_then(|master| master.session_keys.get_mut(index))
                {
                    key.data = Some(resource.data.to_bytes().unwrap_or_default());
                }
            }
            Err(err) => self.report(err),
        }
        self.on_master_part_settled();
    }

    fn on_media(&mut self, mut media: MediaPlaylist) {
        self.set_state(SessionState::MediaParsed);
        debug!(
            url = %media.uri,
            segments = media.segments.len(),
            media_sequence = media.media_sequence,
            "Media playlist loaded"
        );
        self.outbox.push_back(Ok(StreamEvent::Playlist(Box::new(
            Playlist::Media(media.clone()),
        ))));

        let previous = self
            .media_playlists
            .iter()
            .position(|playlist| playlist.uri == media.uri);

        let mut fresh = Vec::new();
        for (index, segment) in media.segments.iter_mut().enumerate() {
            let known = previous.and_then(|i| {
                self.media_playlists[i]
                    .segments
                    .iter()
                    .find(|old| same_segment(old, segment))
            });
            match known {
                Some(old) => {
                    segment.data = old.data.clone();
                    segment.key = old.key.clone();
                    segment.map = old.map.clone();
                    segment.mime_type = old.mime_type.clone();
                }
                None => fresh.push(index),
            }
        }
        trace!(url = %media.uri, new_segments = fresh.len(), "Diffed playlist revision");
        for index in fresh {
            let segment = media.segments[index].clone();
            self.load_segment(&media.uri, segment);
        }

        let finished = media.is_finished();
        let target_duration = media.target_duration;
        let uri = media.uri.clone();
        match previous {
            Some(index) => self.media_playlists[index] = media,
            None => self.media_playlists.push(media),
        }

        if finished {
            info!(url = %uri, "Playlist has ended");
            self.set_state(SessionState::Ended);
        } else {
            let delay = self.config.reload_delay(target_duration);
            debug!(url = %uri, delay = ?delay, "Scheduling playlist reload");
            self.reloads.insert(uri, delay);
        }
    }

    fn load_segment(&mut self, playlist_uri: &str, segment: Segment) {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let raw = self.config.raw_response;

        let body = LoadOptions::buffer().with_raw_response(raw);
        let part = SegmentPart::Body;
        self.dispatch(&segment.uri, body, LoadTarget::Segment { id, part });

        let key_uri = segment
            .key
            .as_ref()
            .filter(|key| key.needs_fetch())
            .and_then(|key| key.uri.as_deref());
        if let Some(uri) = key_uri {
            let part = SegmentPart::Key;
            self.dispatch(uri, LoadOptions::buffer(), LoadTarget::Segment { id, part });
        }
        if let Some(map) = segment.map.as_ref().filter(|map| map.data.is_none()) {
            let part = SegmentPart::Map;
            self.dispatch(&map.uri, body, LoadTarget::Segment { id, part });
        }

        self.assemblies.insert(
            id,
            Assembly {
                playlist_uri: playlist_uri.to_owned(),
                segment,
            },
        );
    }

    fn on_segment_part(&mut self, id: u64, part: SegmentPart, result: HlsResult<Resource>) {
        let resource = match result {
            Ok(resource) => resource,
            Err(err) => {
                if self.assemblies.remove(&id).is_some() {
                    debug!(id, part = ?part, "Dropping segment after failed load");
                }
                return self.report(err);
            }
        };

        let raw = self.config.raw_response;
        let Some(assembly) = self.assemblies.get_mut(&id) else {
            trace!(id, "Segment was already dropped");
            return;
        };
        let segment = &mut assembly.segment;
        match part {
            SegmentPart::Body => {
                let data = if raw {
                    resource.data
                } else {
                    trim(resource.data, segment.byte_range)
                };
                segment.data = Some(data);
                segment.mime_type = resource.mime_type;
            }
            SegmentPart::Key => {
                if let Some(key) = segment.key.as_mut() {
                    key.data = Some(resource.data.to_bytes().unwrap_or_default());
                }
            }
            SegmentPart::Map => {
                if let Some(map) = segment.map.as_mut() {
                    let data = if raw {
                        resource.data
                    } else {
                        trim(resource.data, map.byte_range)
                    };
                    map.data = Some(data);
                    map.mime_type = resource.mime_type;
                }
            }
        }

        if !segment.is_complete() {
            return;
        }
        if let Some(Assembly {
            playlist_uri,
            segment,
        }) = self.assemblies.remove(&id)
        {
            self.store_segment(&playlist_uri, &segment);
            trace!(uri = %segment.uri, sequence = segment.media_sequence, "Segment ready");
            self.outbox
                .push_back(Ok(StreamEvent::Segment(Box::new(segment))));
        }
    }

    /// Records loaded data in the tracked playlist so later revisions carry it over.
    fn store_segment(&mut self, playlist_uri: &str, segment: &Segment) {
        let slot = self
            .media_playlists
            .iter_mut()
            .filter(|playlist| playlist.uri == playlist_uri)
            .flat_map(|playlist| playlist.segments.iter_mut())
            .find(|tracked| same_segment(tracked, segment));
        if let Some(slot) = slot {
            slot.data = segment.data.clone();
            slot.key = segment.key.clone();
            slot.map = segment.map.clone();
            slot.mime_type = segment.mime_type.clone();
        }
    }

    fn check_drained(&mut self) {
        if self.finished || self.state != SessionState::Ended || self.pending_loads > 0 {
            return;
        }
        info!(url = %self.url, "HLS stream ended");
        self.outbox.push_back(Ok(StreamEvent::End));
        self.finished = true;
        self.master = None;
        self.media_playlists.clear();
        self.assemblies.clear();
        self.reloads.clear();
    }
}

/// Segments are identified by URI, and by byte range when they address part of one.
fn same_segment(a: &Segment, b: &Segment) -> bool {
    a.uri == b.uri && a.byte_range == b.byte_range
}

fn trim(data: Payload, range: Option<ByteRange>) -> Payload {
    match (data, range) {
        (Payload::Binary(bytes), Some(range)) => Payload::Binary(range.slice(&bytes)),
        (data, _) => data,
    }
}

impl Stream for HlsReadStream {
    type Item = HlsResult<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.outbox.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            if this.state == SessionState::Initialized {
                this.start();
                continue;
            }

            if let Poll::Ready(Some((target, result))) = this.loads.poll_next_unpin(cx) {
                this.on_completion(target, result);
                this.check_drained();
                continue;
            }

            if let Poll::Ready(Some(expired)) = this.reloads.poll_expired(cx) {
                let url = expired.into_inner();
                debug!(url = %url, "Reloading playlist");
                this.load_manifest(url);
                continue;
            }

            if this.pending_loads == 0 && this.reloads.is_empty() {
                // Every branch failed or was dropped; no revision can arrive any more
                warn!(url = %this.url, state = %this.state, "Nothing left to load");
                this.state = SessionState::Ended;
                this.check_drained();
                continue;
            }

            return Poll::Pending;
        }
    }
}

impl std::fmt::Debug for HlsReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HlsReadStream")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("media_playlists", &self.media_playlists.len())
            .field("pending_loads", &self.pending_loads)
            .field("scheduled_reloads", &self.reloads.len())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::test_support::{FakeResponse, FakeTransport, init_tracing};

    const MASTER_URL: &str = "http://media.example.com/master.m3u8";

    const FIXTURE_MASTER: &str = r#"#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1280000,CODECS="avc1.640029,mp4a.40.2",VIDEO="low"
low-main.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2560000,CODECS="avc1.640029,mp4a.40.2",VIDEO="mid"
mid-main.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=7680000,CODECS="avc1.640029,mp4a.40.2",VIDEO="high"
high-main.m3u8

#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="low",NAME="Main",DEFAULT=YES,URI="low-main.m3u8"
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="low",NAME="Sub-1",DEFAULT=NO,URI="low-sub1.m3u8"
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="low",NAME="Sub-2",DEFAULT=NO,URI="low-sub2.m3u8"

#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="mid",NAME="Main",DEFAULT=YES,URI="mid-main.m3u8"
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="mid",NAME="Sub-1",DEFAULT=NO,URI="mid-sub1.m3u8"
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="mid",NAME="Sub-2",DEFAULT=NO,URI="mid-sub2.m3u8"

#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="high",NAME="Main",DEFAULT=YES,URI="high-main.m3u8"
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="high",NAME="Sub-1",DEFAULT=NO,URI="high-sub1.m3u8"
#EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="high",NAME="Sub-2",DEFAULT=NO,URI="high-sub2.m3u8"
"#;

    fn ts() -> FakeResponse {
        FakeResponse::ok_bytes(vec![0u8; 10]).with_content_type("video/mp2t")
    }

    fn media_with_segments(segments: &[&str], end_list: bool) -> String {
        let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n");
        for segment in segments {
            text.push_str(&format!("#EXTINF:9.009,\n{segment}\n"));
        }
        if end_list {
            text.push_str("#EXT-X-ENDLIST\n");
        }
        text
    }

    /// Three variants, each with a three-rendition video group whose first
    /// rendition is the variant itself
    fn fixture_transport() -> Arc<FakeTransport> {
        let transport = Arc::new(FakeTransport::new());
        transport.route(MASTER_URL, FakeResponse::ok_text(FIXTURE_MASTER));
        for group in ["low", "mid", "high"] {
            for name in ["main", "sub1", "sub2"] {
                let segments: Vec<String> = (1..=3)
                    .map(|n| format!("http://media.example.com/0{n}_{group}-{name}.ts"))
                    .collect();
                for segment in &segments {
                    transport.route(segment, ts());
                }
                let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
                transport.route(
                    &format!("http://media.example.com/{group}-{name}.m3u8"),
                    FakeResponse::ok_text(&media_with_segments(&refs, true)),
                );
            }
        }
        transport
    }

    fn session(url: &str, transport: &Arc<FakeTransport>) -> HlsReadStream {
        session_with_config(url, transport, HlsStreamConfig::default())
    }

    fn session_with_config(
        url: &str,
        transport: &Arc<FakeTransport>,
        config: HlsStreamConfig,
    ) -> HlsReadStream {
        HlsReadStream::with_collaborators(url, config, transport.clone(), Arc::new(M3u8Parser))
    }

    #[derive(Default)]
    struct Tally {
        masters: usize,
        media: usize,
        segments: Vec<Segment>,
        errors: Vec<HlsError>,
        ends: usize,
    }

    impl Tally {
        fn of(items: Vec<HlsResult<StreamEvent>>) -> Self {
            let mut tally = Tally::default();
            for item in items {
                match item {
                    Ok(StreamEvent::Playlist(playlist)) => match *playlist {
                        Playlist::Master(_) => tally.masters += 1,
                        Playlist::Media(_) => tally.media += 1,
                    },
                    Ok(StreamEvent::Segment(segment)) => tally.segments.push(*segment),
                    Ok(StreamEvent::End) => tally.ends += 1,
                    Err(err) => tally.errors.push(err),
                }
            }
            tally
        }
    }

    fn segment_bytes(segment: &Segment) -> Bytes {
        segment
            .data
            .as_ref()
            .and_then(|data| data.as_bytes().cloned())
            .unwrap()
    }

    #[tokio::test]
    async fn test_master_with_renditions_loads_everything_once() {
        init_tracing();
        let transport = fixture_transport();
        let variant_calls = Arc::new(AtomicUsize::new(0));
        let rendition_calls = Arc::new(AtomicUsize::new(0));
        let selector = {
            let variant_calls = variant_calls.clone();
            let rendition_calls = rendition_calls.clone();
            Selector::new()
                .on_variants(move |variants| {
                    variant_calls.fetch_add(1, Ordering::SeqCst);
                    (0..variants.len()).collect()
                })
                .on_renditions(move |kind, renditions| {
                    assert_eq!(kind, RenditionType::Video);
                    rendition_calls.fetch_add(1, Ordering::SeqCst);
                    (0..renditions.len()).collect()
                })
        };

        let stream = session(MASTER_URL, &transport).with_selection(selector);
        assert_eq!(stream.state(), SessionState::Initialized);
        let items: Vec<_> = stream.collect().await;
        assert!(matches!(items.last(), Some(Ok(StreamEvent::End))));

        let tally = Tally::of(items);
        assert!(tally.errors.is_empty(), "{:?}", tally.errors);
        assert_eq!(variant_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rendition_calls.load(Ordering::SeqCst), 3);
        assert_eq!(tally.masters + tally.media + tally.segments.len(), 1 + 9 + 27);
        assert_eq!(tally.masters, 1);
        assert_eq!(tally.ends, 1);

        // Listed both as variant and as rendition, fetched once
        assert_eq!(
            transport.fetch_count("http://media.example.com/low-main.m3u8"),
            1
        );
        for segment in &tally.segments {
            assert_eq!(segment_bytes(segment).len(), 10);
            assert_eq!(segment.mime_type.as_deref(), Some("video/mp2t"));
        }
    }

    #[tokio::test]
    async fn test_custom_selection_limits_loading() {
        let transport = fixture_transport();
        let selector = Selector::new()
            .on_variants(|_| vec![1, 1, 9])
            .on_renditions(|_, _| Vec::new());

        let items: Vec<_> = session(MASTER_URL, &transport)
            .with_selection(selector)
            .collect()
            .await;
        let tally = Tally::of(items);

        assert_eq!(tally.masters, 1);
        assert_eq!(tally.media, 1);
        assert_eq!(tally.segments.len(), 3);
        assert_eq!(tally.ends, 1);
        assert_eq!(
            transport.fetch_count("http://media.example.com/mid-main.m3u8"),
            1
        );
        assert_eq!(
            transport.fetch_count("http://media.example.com/low-main.m3u8"),
            0
        );
        assert_eq!(
            transport.fetch_count("http://media.example.com/mid-sub1.m3u8"),
            0
        );
    }

    const VOD_URL: &str = "http://vod.example.com/index.m3u8";
    const VOD: &str = r#"#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:10
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-MAP:URI="init.mp4"
#EXT-X-KEY:METHOD=AES-128,URI="key.bin"
#EXTINF:10,
#EXT-X-BYTERANGE:4@2
media.mp4
#EXTINF:10,
#EXT-X-BYTERANGE:3
media.mp4
"#;

    fn vod_transport(delay: Option<Duration>) -> Arc<FakeTransport> {
        let transport = match delay {
            Some(delay) => FakeTransport::new().with_delay(delay),
            None => FakeTransport::new(),
        };
        transport.route(VOD_URL, FakeResponse::ok_text(VOD));
        transport.route(
            "http://vod.example.com/media.mp4",
            FakeResponse::ok_bytes(&b"0123456789"[..]).with_content_type("video/mp4"),
        );
        transport.route(
            "http://vod.example.com/init.mp4",
            FakeResponse::ok_bytes(&b"INIT"[..]).with_content_type("video/mp4"),
        );
        transport.route(
            "http://vod.example.com/key.bin",
            FakeResponse::ok_bytes(vec![7u8; 16]),
        );
        Arc::new(transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_vod_segments_wait_for_key_and_map() {
        let transport = vod_transport(Some(Duration::from_millis(50)));
        let mut stream = session(VOD_URL, &transport);

        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        assert_eq!(stream.state(), SessionState::Ended);
        assert_eq!(stream.pending_loads(), 0);
        assert!(matches!(items.last(), Some(Ok(StreamEvent::End))));
        assert!(stream.next().await.is_none());

        let tally = Tally::of(items);
        assert!(tally.errors.is_empty(), "{:?}", tally.errors);
        assert_eq!(tally.media, 1);
        assert_eq!(tally.ends, 1);

        let mut segments = tally.segments;
        segments.sort_by_key(|segment| segment.media_sequence);
        assert_eq!(segments.len(), 2);
        assert_eq!(segment_bytes(&segments[0]), Bytes::from_static(b"2345"));
        assert_eq!(segment_bytes(&segments[1]), Bytes::from_static(b"678"));
        for segment in &segments {
            assert!(segment.is_complete());
            let key = segment.key.as_ref().unwrap();
            assert_eq!(key.data.as_deref(), Some(&[7u8; 16][..]));
            let map = segment.map.as_ref().unwrap();
            assert_eq!(
                map.data.as_ref().and_then(Payload::as_bytes),
                Some(&Bytes::from_static(b"INIT"))
            );
            assert_eq!(segment.mime_type.as_deref(), Some("video/mp4"));
        }

        // Shared resources are requested once
        assert_eq!(transport.fetch_count("http://vod.example.com/media.mp4"), 1);
        assert_eq!(transport.fetch_count("http://vod.example.com/init.mp4"), 1);
        assert_eq!(transport.fetch_count("http://vod.example.com/key.bin"), 1);
    }

    #[tokio::test]
    async fn test_raw_response_is_delivered_untrimmed() {
        let transport = vod_transport(None);
        let config = HlsStreamConfig::builder().with_raw_response(true).build();
        let mut stream = session_with_config(VOD_URL, &transport, config);

        let mut segments = Vec::new();
        while let Some(item) = stream.next().await {
            if let Ok(StreamEvent::Segment(segment)) = item {
                segments.push(*segment);
            }
        }
        assert_eq!(segments.len(), 2);
        assert!(!stream.loader().is_cached("http://vod.example.com/media.mp4"));

        // Both byte ranges point at one file and share its single response body
        let raws: Vec<_> = segments
            .iter()
            .map(|segment| match &segment.data {
                Some(Payload::Raw(raw)) => raw.clone(),
                other => panic!("expected a raw body, got {other:?}"),
            })
            .collect();
        let body = raws[0].take().unwrap();
        assert!(raws.iter().all(|raw| raw.is_taken()));
        assert!(raws[1].take().is_none());

        let chunks: Vec<_> = body.collect().await;
        let bytes: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(bytes, b"0123456789".to_vec());
        assert_eq!(transport.fetch_count("http://vod.example.com/media.mp4"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_playlist_reload_and_diff() {
        init_tracing();
        let url = "http://live.example.com/index.m3u8";
        let seg = |n: u32| format!("http://live.example.com/seg{n}.ts");
        let transport = Arc::new(FakeTransport::new());
        let first = media_with_segments(&[&seg(1), &seg(2)], false);
        transport.route_sequence(
            url,
            vec![
                FakeResponse::ok_text(&first),
                FakeResponse::ok_text(&first),
                FakeResponse::ok_text(&media_with_segments(&[&seg(2), &seg(3)], true)),
            ],
        );
        for n in 1..=3 {
            transport.route(&seg(n), ts());
        }

        let items: Vec<_> = session(url, &transport).collect().await;
        let tally = Tally::of(items);
        assert!(tally.errors.is_empty(), "{:?}", tally.errors);
        // The unchanged revision is not emitted again
        assert_eq!(tally.media, 2);
        assert_eq!(tally.ends, 1);

        let uris: Vec<_> = tally.segments.iter().map(|s| s.uri.clone()).collect();
        assert_eq!(uris.len(), 3);
        for n in 1..=3 {
            assert_eq!(uris.iter().filter(|u| **u == seg(n)).count(), 1);
            assert_eq!(transport.fetch_count(&seg(n)), 1);
        }

        let polls = transport.fetch_times(url);
        assert_eq!(polls.len(), 3);
        let reload = polls[1] - polls[0];
        assert!(reload >= Duration::from_secs(10) && reload < Duration::from_secs(11));
        let retry = polls[2] - polls[1];
        assert!(
            retry >= Duration::from_secs(15) && retry < Duration::from_secs(16),
            "{retry:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_live_reload_ends_session() {
        let url = "http://live.example.com/index.m3u8";
        let transport = Arc::new(FakeTransport::new());
        transport.route_sequence(
            url,
            vec![
                FakeResponse::ok_text(&media_with_segments(
                    &["http://live.example.com/seg1.ts"],
                    false,
                )),
                FakeResponse::status(503, "Service Unavailable"),
            ],
        );
        transport.route("http://live.example.com/seg1.ts", ts());

        let items: Vec<_> = session(url, &transport).collect().await;
        let tally = Tally::of(items);
        assert_eq!(tally.segments.len(), 1);
        assert_eq!(tally.errors.len(), 1);
        assert_eq!(tally.errors[0].status(), Some(503));
        assert_eq!(tally.ends, 1);
        assert_eq!(transport.fetch_count(url), 2);
    }

    #[tokio::test]
    async fn test_variant_failure_is_reported_with_url() {
        let master = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1000000
broken.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2000000
good.m3u8
";
        let transport = Arc::new(FakeTransport::new());
        transport.route(MASTER_URL, FakeResponse::ok_text(master));
        transport.route(
            "http://media.example.com/broken.m3u8",
            FakeResponse::status(500, "Mock Error"),
        );
        transport.route(
            "http://media.example.com/good.m3u8",
            FakeResponse::ok_text(&media_with_segments(&["good0.ts"], true)),
        );
        transport.route("http://media.example.com/good0.ts", ts());

        let items: Vec<_> = session(MASTER_URL, &transport).collect().await;
        assert!(matches!(items.last(), Some(Ok(StreamEvent::End))));
        let tally = Tally::of(items);

        assert_eq!(tally.errors.len(), 1);
        assert_eq!(
            tally.errors[0].url(),
            Some("http://media.example.com/broken.m3u8")
        );
        assert_eq!(tally.errors[0].status(), Some(500));
        assert_eq!(tally.segments.len(), 1);
        assert_eq!(tally.segments[0].uri, "http://media.example.com/good0.ts");
        assert_eq!(tally.ends, 1);
    }

    #[tokio::test]
    async fn test_all_variants_failing_still_ends() {
        let transport = Arc::new(FakeTransport::new());
        transport.route(
            MASTER_URL,
            FakeResponse::ok_text("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000\nmissing.m3u8\n"),
        );

        let mut stream = session(MASTER_URL, &transport);
        let items: Vec<_> = (&mut stream).collect().await;
        let tally = Tally::of(items);
        assert_eq!(tally.masters, 1);
        assert_eq!(tally.errors.len(), 1);
        assert_eq!(tally.errors[0].status(), Some(404));
        assert_eq!(tally.ends, 1);
        assert_eq!(stream.state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn test_root_failure_reports_then_ends() {
        let transport = Arc::new(FakeTransport::new());
        let mut stream = session("http://nowhere.example.com/index.m3u8", &transport);

        let first = stream.next().await.unwrap();
        let err = first.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.url(), Some("http://nowhere.example.com/index.m3u8"));
        assert!(matches!(stream.next().await, Some(Ok(StreamEvent::End))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_root_manifest() {
        let transport = Arc::new(FakeTransport::new());
        transport.route(VOD_URL, FakeResponse::ok_text("<html>oops</html>"));

        let items: Vec<_> = session(VOD_URL, &transport).collect().await;
        let tally = Tally::of(items);
        assert_eq!(tally.errors.len(), 1);
        assert!(matches!(
            tally.errors[0],
            HlsError::MalformedManifest { .. }
        ));
        assert_eq!(tally.ends, 1);
    }

    #[tokio::test]
    async fn test_master_waits_for_session_data_and_keys() {
        let master = r#"#EXTM3U
#EXT-X-SESSION-DATA:DATA-ID="com.example.title",VALUE="Example"
#EXT-X-SESSION-DATA:DATA-ID="com.example.meta",URI="meta.json"
#EXT-X-SESSION-DATA:DATA-ID="com.example.broken",URI="broken.json"
#EXT-X-SESSION-KEY:METHOD=AES-128,URI="session.key"
#EXT-X-STREAM-INF:BANDWIDTH=1000000
only.m3u8
"#;
        let transport = Arc::new(FakeTransport::new());
        transport.route(MASTER_URL, FakeResponse::ok_text(master));
        transport.route(
            "http://media.example.com/meta.json",
            FakeResponse::ok_text(r#"{"title": "Example", "episodes": [1, 2]}"#),
        );
        transport.route(
            "http://media.example.com/broken.json",
            FakeResponse::ok_text("not json"),
        );
        transport.route(
            "http://media.example.com/session.key",
            FakeResponse::ok_bytes(vec![1u8; 16]),
        );
        transport.route(
            "http://media.example.com/only.m3u8",
            FakeResponse::ok_text(&media_with_segments(&["only0.ts"], true)),
        );
        transport.route("http://media.example.com/only0.ts", ts());

        let items: Vec<_> = session(MASTER_URL, &transport).collect().await;
        let masters: Vec<MasterPlaylist> = items
            .iter()
            .filter_map(|item| item.as_ref().ok())
            .filter_map(StreamEvent::as_playlist)
            .filter_map(Playlist::as_master)
            .cloned()
            .collect();
        let tally = Tally::of(items);

        assert_eq!(masters.len(), 1);
        let master = &masters[0];
        assert_eq!(master.session_data[0].value.as_deref(), Some("Example"));
        assert_eq!(
            master.session_data[1].data,
            Some(json!({"title": "Example", "episodes": [1, 2]}))
        );
        assert!(master.session_data[2].data.is_none());
        assert_eq!(
            master.session_keys[0].data.as_deref(),
            Some(&[1u8; 16][..])
        );

        assert_eq!(tally.errors.len(), 1);
        assert!(matches!(
            tally.errors[0],
            HlsError::MalformedSessionData { .. }
        ));
        assert_eq!(
            tally.errors[0].url(),
            Some("http://media.example.com/broken.json")
        );
        assert_eq!(tally.segments.len(), 1);
        assert_eq!(tally.ends, 1);
    }

    #[tokio::test]
    async fn test_segment_failure_does_not_block_siblings() {
        let transport = Arc::new(FakeTransport::new());
        transport.route(
            VOD_URL,
            FakeResponse::ok_text(&media_with_segments(&["a.ts", "b.ts", "c.ts"], true)),
        );
        transport.route("http://vod.example.com/a.ts", ts());
        transport.route(
            "http://vod.example.com/b.ts",
            FakeResponse::network_failure("connection reset"),
        );
        transport.route("http://vod.example.com/c.ts", ts());

        let items: Vec<_> = session(VOD_URL, &transport).collect().await;
        let tally = Tally::of(items);
        assert_eq!(tally.segments.len(), 2);
        assert_eq!(tally.errors.len(), 1);
        assert!(matches!(tally.errors[0], HlsError::Transport { .. }));
        assert_eq!(tally.errors[0].url(), Some("http://vod.example.com/b.ts"));
        assert_eq!(tally.ends, 1);
    }

    #[tokio::test]
    async fn test_key_failure_drops_only_encrypted_segment() {
        let text = r#"#EXTM3U
#EXT-X-TARGETDURATION:10
#EXT-X-KEY:METHOD=AES-128,URI="key.bin"
#EXTINF:10,
enc.ts
#EXT-X-KEY:METHOD=NONE
#EXTINF:10,
plain.ts
#EXT-X-ENDLIST
"#;
        let transport = Arc::new(FakeTransport::new());
        transport.route(VOD_URL, FakeResponse::ok_text(text));
        transport.route("http://vod.example.com/enc.ts", ts());
        transport.route("http://vod.example.com/plain.ts", ts());
        transport.route(
            "http://vod.example.com/key.bin",
            FakeResponse::status(403, "Forbidden"),
        );

        let items: Vec<_> = session(VOD_URL, &transport).collect().await;
        assert!(matches!(items.last(), Some(Ok(StreamEvent::End))));
        let tally = Tally::of(items);

        assert_eq!(tally.segments.len(), 1);
        assert_eq!(tally.segments[0].uri, "http://vod.example.com/plain.ts");
        assert!(tally.segments[0].key.is_none());
        assert_eq!(tally.errors.len(), 1);
        assert_eq!(tally.errors[0].url(), Some("http://vod.example.com/key.bin"));
        assert_eq!(tally.errors[0].status(), Some(403));
        assert_eq!(tally.ends, 1);
    }

    #[tokio::test]
    async fn test_map_failure_does_not_block_other_playlists() {
        let master = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1000000
fmp4.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2000000
ts.m3u8
";
        let fmp4 = r#"#EXTM3U
#EXT-X-TARGETDURATION:10
#EXT-X-MAP:URI="init.mp4"
#EXTINF:10,
a.m4s
#EXT-X-ENDLIST
"#;
        let transport = Arc::new(FakeTransport::new());
        transport.route(MASTER_URL, FakeResponse::ok_text(master));
        transport.route("http://media.example.com/fmp4.m3u8", FakeResponse::ok_text(fmp4));
        transport.route("http://media.example.com/a.m4s", ts());
        transport.route(
            "http://media.example.com/ts.m3u8",
            FakeResponse::ok_text(&media_with_segments(&["b.ts"], true)),
        );
        transport.route("http://media.example.com/b.ts", ts());

        let items: Vec<_> = session(MASTER_URL, &transport).collect().await;
        assert!(matches!(items.last(), Some(Ok(StreamEvent::End))));
        let tally = Tally::of(items);

        assert_eq!(tally.media, 2);
        assert_eq!(tally.segments.len(), 1);
        assert_eq!(tally.segments[0].uri, "http://media.example.com/b.ts");
        assert_eq!(tally.errors.len(), 1);
        assert_eq!(
            tally.errors[0].url(),
            Some("http://media.example.com/init.mp4")
        );
        assert_eq!(tally.errors[0].status(), Some(404));
        assert_eq!(tally.ends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_range_parts_survive_reload() {
        let url = "http://live.example.com/index.m3u8";
        let part = |range: &str| format!("#EXTINF:4,\n#EXT-X-BYTERANGE:{range}\npart.ts\n");
        let header = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n";
        let first = format!("{header}{}{}", part("4@0"), part("4@4"));
        let second = format!("{first}{}#EXT-X-ENDLIST\n", part("2@8"));

        let transport = Arc::new(FakeTransport::new());
        transport.route_sequence(
            url,
            vec![FakeResponse::ok_text(&first), FakeResponse::ok_text(&second)],
        );
        transport.route(
            "http://live.example.com/part.ts",
            FakeResponse::ok_bytes(&b"0123456789"[..]),
        );

        let items: Vec<_> = session(url, &transport).collect().await;
        let tally = Tally::of(items);
        assert!(tally.errors.is_empty(), "{:?}", tally.errors);
        assert_eq!(tally.media, 2);
        assert_eq!(tally.ends, 1);

        // Each sub-range is emitted once, including the one added by the reload
        let mut segments = tally.segments;
        segments.sort_by_key(|segment| segment.byte_range.and_then(|range| range.offset));
        let bodies: Vec<Bytes> = segments.iter().map(segment_bytes).collect();
        assert_eq!(
            bodies,
            vec![
                Bytes::from_static(b"0123"),
                Bytes::from_static(b"4567"),
                Bytes::from_static(b"89"),
            ]
        );
        assert_eq!(transport.fetch_count(url), 2);
        assert_eq!(transport.fetch_count("http://live.example.com/part.ts"), 1);
    }
}
