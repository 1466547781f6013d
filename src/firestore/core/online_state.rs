use std::fmt::{Display, Formatter};

/// Whether the client believes it can reach the backend. Drives the
/// `from_cache` flag of snapshots raised while offline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// No connection attempt has finished yet, or the last one was
    /// inconclusive. Listeners keep waiting for a server snapshot.
    #[default]
    Unknown,
    Online,
    /// Connection attempts keep failing; listeners are served from cache.
    Offline,
}

impl Display for OnlineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OnlineState::Unknown => "Unknown",
            OnlineState::Online => "Online",
            OnlineState::Offline => "Offline",
        };
        f.write_str(label)
    }
}

/// Who reported an online state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}
