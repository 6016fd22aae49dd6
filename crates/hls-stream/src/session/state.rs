use std::fmt;

/// Lifecycle of a read session.
///
/// `Ended` means no further manifest revisions are expected. The stream itself
/// finishes once the session is `Ended` and no load is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Initialized,
    Reading,
    MasterParsed,
    MediaParsed,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initialized => "initialized",
            SessionState::Reading => "reading",
            SessionState::MasterParsed => "master-parsed",
            SessionState::MediaParsed => "media-parsed",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// What a completed load feeds into
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoadTarget {
    Manifest { url: String },
    Segment { id: u64, part: SegmentPart },
    /// Session data entry `index` of master revision `generation`
    SessionData { generation: u64, index: usize },
    SessionKey { generation: u64, index: usize },
}

/// Constituent of a segment that is loaded separately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentPart {
    Body,
    Key,
    Map,
}
