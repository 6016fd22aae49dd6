use crate::playlist::{Playlist, Segment};

/// Item produced by [`HlsReadStream`](super::HlsReadStream)
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A master playlist once its session data and keys are resolved, or a
    /// media playlist as soon as it is parsed
    Playlist(Box<Playlist>),
    /// A segment whose body, key and init section have all arrived
    Segment(Box<Segment>),
    /// Everything has been loaded; nothing follows
    End,
}

impl StreamEvent {
    pub fn as_playlist(&self) -> Option<&Playlist> {
        match self {
            StreamEvent::Playlist(playlist) => Some(playlist),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Segment> {
        match self {
            StreamEvent::Segment(segment) => Some(segment),
            _ => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, StreamEvent::End)
    }
}
