use std::string::FromUtf8Error;

use thiserror::Error;

/// A three-frame message that cannot be read as a [`crate::entry::KvEntry`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("expected 3 frames, got {0}")]
    FrameCount(usize),
    #[error("sequence frame must be 8 bytes, got {0}")]
    SequenceWidth(usize),
    #[error("key frame is not valid UTF-8")]
    KeyEncoding(#[from] FromUtf8Error),
}

/// Why the publisher refused or could not sequence a mutation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("empty key is reserved for control sentinels")]
    EmptyKey,
    #[error("publisher state owner has shut down")]
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("control sentinels are never published on the update bus")]
    Sentinel,
    #[error("no subscribers connected")]
    NoSubscribers,
}

/// Violations of the snapshot or live-update exchange. Fatal to the exchange
/// that produced them, never repaired in place.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad snapshot request {0:?}")]
    BadRequest(String),
    #[error("peer closed the connection mid-exchange")]
    PeerClosed,
    #[error("update channel did not send its READY greeting")]
    MissingGreeting,
    #[error("snapshot responder went quiet mid-transfer")]
    SnapshotTimeout,
    #[error("snapshot sentinel received on the live update channel")]
    SentinelOnBus,
    #[error("live update received before the snapshot completed")]
    NotSynchronized,
    #[error("snapshot entry received after synchronization")]
    AlreadySynchronized,
}
