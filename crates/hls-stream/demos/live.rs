//! Follows an HLS stream and prints what arrives.
//!
//! ```text
//! RUST_LOG=hls_stream=debug cargo run --example live -- https://example.com/master.m3u8
//! ```

use futures::StreamExt;
use hls_stream::{HlsStreamConfig, Playlist, Selector, StreamEvent};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {e}");
    }

    let Some(url) = std::env::args().nth(1) else {
        eprintln!("usage: live <playlist url>");
        std::process::exit(2);
    };

    // Lowest bandwidth variant, first rendition of every group
    let selector = Selector::new()
        .on_variants(|variants| {
            for (i, variant) in variants.iter().enumerate() {
                info!(index = i, bandwidth = variant.bandwidth, uri = %variant.uri, "Variant");
            }
            variants
                .iter()
                .enumerate()
                .min_by_key(|(_, variant)| variant.bandwidth)
                .map(|(i, _)| vec![i])
                .unwrap_or_default()
        })
        .on_renditions(|kind, renditions| {
            for rendition in renditions {
                info!(%kind, name = %rendition.name, group = %rendition.group_id, "Rendition");
            }
            vec![0]
        });

    let config = HlsStreamConfig::builder().with_concurrency(4).build();
    let mut stream = match hls_stream::open(&url, config, selector) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Cannot open stream");
            std::process::exit(1);
        }
    };

    let mut bytes = 0usize;
    while let Some(event) = stream.next().await {
        match event {
            Ok(StreamEvent::Playlist(playlist)) => match *playlist {
                Playlist::Master(master) => {
                    info!(uri = %master.uri, variants = master.variants.len(), "Master playlist")
                }
                Playlist::Media(media) => info!(
                    uri = %media.uri,
                    segments = media.segments.len(),
                    finished = media.is_finished(),
                    "Media playlist"
                ),
            },
            Ok(StreamEvent::Segment(segment)) => {
                let size = segment
                    .data
                    .as_ref()
                    .and_then(|data| data.as_bytes())
                    .map_or(0, |data| data.len());
                bytes += size;
                info!(
                    sequence = segment.media_sequence,
                    size,
                    mime = segment.mime_type.as_deref().unwrap_or("-"),
                    uri = %segment.uri,
                    "Segment"
                );
            }
            Ok(StreamEvent::End) => info!(total_bytes = bytes, "Stream ended"),
            Err(e) => error!(error = %e, "Load failed"),
        }
    }
}
