//! Subscriber-side replica and the merge rule.
//!
//! A replica starts out [`Phase::Bootstrapping`]: snapshot entries are
//! loaded as-is until the sentinel arrives and fixes the low-water mark.
//! From then on it is [`Phase::Synchronized`] and only live updates with a
//! sequence above the last applied one change the store. Anything else is a
//! duplicate or stale delivery and is dropped without complaint.

use tracing::warn;

use crate::{entry::KvEntry, error::ProtocolError, store::StateStore};

/// Applies `entry` if it is newer than `last_applied`.
///
/// Pure: the same inputs always give the same store and mark, so applying an
/// entry twice is the same as applying it once.
pub fn merge(mut store: StateStore, last_applied: u64, entry: KvEntry) -> (StateStore, u64) {
    if entry.sequence <= last_applied {
        return (store, last_applied);
    }
    let sequence = entry.sequence;
    store.put(entry);
    (store, sequence)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrapping,
    Synchronized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Discarded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStats {
    pub applied: u64,
    /// Stale or duplicate live updates.
    pub discarded: u64,
    /// Live updates that skipped one or more sequence numbers.
    pub gaps: u64,
}

#[derive(Debug, Clone)]
pub struct Replica {
    store: StateStore,
    last_applied: u64,
    phase: Phase,
    stats: ReplicaStats,
}

impl Replica {
    pub fn new() -> Self {
        Self {
            store: StateStore::new(),
            last_applied: 0,
            phase: Phase::Bootstrapping,
            stats: ReplicaStats::default(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> ReplicaStats {
        self.stats
    }

    /// Loads one message of a snapshot transfer.
    ///
    /// Returns the low-water mark once the sentinel arrives; the replica is
    /// synchronized from that point on.
    pub fn load_snapshot(&mut self, entry: KvEntry) -> Result<Option<u64>, ProtocolError> {
        if self.phase == Phase::Synchronized {
            return Err(ProtocolError::AlreadySynchronized);
        }
        if entry.is_sentinel() {
            self.last_applied = entry.sequence;
            self.phase = Phase::Synchronized;
            return Ok(Some(entry.sequence));
        }
        // Snapshot entries arrive in no particular sequence order and each
        // key appears once, so they overwrite unconditionally.
        self.store.put(entry);
        Ok(None)
    }

    /// Applies one live update through [`merge`].
    pub fn apply_update(&mut self, entry: KvEntry) -> Result<MergeOutcome, ProtocolError> {
        if self.phase != Phase::Synchronized {
            return Err(ProtocolError::NotSynchronized);
        }
        if entry.is_sentinel() {
            return Err(ProtocolError::SentinelOnBus);
        }

        let previous = self.last_applied;
        let incoming = entry.sequence;
        let (store, last_applied) = merge(std::mem::take(&mut self.store), previous, entry);
        self.store = store;
        self.last_applied = last_applied;

        if last_applied == previous {
            self.stats.discarded += 1;
            return Ok(MergeOutcome::Discarded);
        }

        if incoming > previous + 1 {
            self.stats.gaps += 1;
            warn!(
                expected = previous + 1,
                received = incoming,
                "sequence gap in live updates"
            );
        }
        self.stats.applied += 1;
        Ok(MergeOutcome::Applied)
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}
