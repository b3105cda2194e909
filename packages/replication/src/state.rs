use std::fmt;

/// Where a replication session with one peer stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    /// Exchanging identifiers and bootstraps.
    Handshaking,
    /// Both sides are forwarding their changelog.
    Streaming,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Handshaking => "handshaking",
            SessionState::Streaming => "streaming",
        })
    }
}
