//! Publisher-side owner of the authoritative store and the sequencer.
//!
//! A single task owns both. Writers and the snapshot responder reach it
//! through a cloneable [`PublisherHandle`] that sends requests over a channel,
//! so requests are handled strictly one at a time:
//!
//! - a mutation is sequenced, stored, then broadcast before the next request
//!   is looked at, which keeps issue order, store order and bus order equal;
//! - a snapshot copies the store and reads the sequence counter in one step,
//!   so its low-water mark always matches its contents.

use std::future::Future;

use bytes::Bytes;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::UpdateBus,
    entry::KvEntry,
    error::{PublishError, StateError},
    sequencer::Sequencer,
    store::StateStore,
};

const REQUEST_QUEUE: usize = 256;

/// Anything that can accept a proposed mutation and report the sequence it
/// was given.
///
/// The collector forwards network writers through this; tests and embedding
/// code can call it directly.
pub trait Submit {
    fn submit(
        &self,
        key: String,
        body: Bytes,
    ) -> impl Future<Output = Result<u64, StateError>> + Send;
}

/// Point-in-time copy of the authoritative state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub entries: Vec<KvEntry>,
    /// Sequence in effect when the copy was taken: the low-water mark.
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherStats {
    pub sequence: u64,
    pub entries: usize,
    /// Sequenced updates no live subscriber received.
    pub failed_broadcasts: u64,
}

enum StateRequest {
    Submit {
        key: String,
        body: Bytes,
        respond_to: oneshot::Sender<Result<u64, StateError>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Snapshot>,
    },
    Stats {
        respond_to: oneshot::Sender<PublisherStats>,
    },
}

#[derive(Debug, Clone)]
pub struct PublisherHandle {
    requests: mpsc::Sender<StateRequest>,
}

impl PublisherHandle {
    pub async fn submit(
        &self,
        key: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<u64, StateError> {
        let (respond_to, response) = oneshot::channel();
        self.request(StateRequest::Submit {
            key: key.into(),
            body: body.into(),
            respond_to,
        })
        .await?;
        response.await.map_err(|_| StateError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<Snapshot, StateError> {
        let (respond_to, response) = oneshot::channel();
        self.request(StateRequest::Snapshot { respond_to }).await?;
        response.await.map_err(|_| StateError::Closed)
    }

    pub async fn stats(&self) -> Result<PublisherStats, StateError> {
        let (respond_to, response) = oneshot::channel();
        self.request(StateRequest::Stats { respond_to }).await?;
        response.await.map_err(|_| StateError::Closed)
    }

    async fn request(&self, request: StateRequest) -> Result<(), StateError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| StateError::Closed)
    }
}

impl Submit for PublisherHandle {
    async fn submit(&self, key: String, body: Bytes) -> Result<u64, StateError> {
        PublisherHandle::submit(self, key, body).await
    }
}

pub struct StateOwner {
    store: StateStore,
    sequencer: Sequencer,
    bus: UpdateBus,
    requests: mpsc::Receiver<StateRequest>,
    failed_broadcasts: u64,
}

impl StateOwner {
    pub fn new(bus: UpdateBus) -> (Self, PublisherHandle) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let owner = Self {
            store: StateStore::new(),
            sequencer: Sequencer::new(),
            bus,
            requests: rx,
            failed_broadcasts: 0,
        };
        (owner, PublisherHandle { requests: tx })
    }

    /// Serves requests until `shutdown` fires or every handle is dropped.
    /// Returns the last sequence issued.
    pub async fn run(mut self, shutdown: CancellationToken) -> u64 {
        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            }
        }
        self.sequencer.current()
    }

    fn handle(&mut self, request: StateRequest) {
        match request {
            StateRequest::Submit {
                key,
                body,
                respond_to,
            } => {
                let _ = respond_to.send(self.apply(key, body));
            }
            StateRequest::Snapshot { respond_to } => {
                let _ = respond_to.send(self.capture());
            }
            StateRequest::Stats { respond_to } => {
                let _ = respond_to.send(PublisherStats {
                    sequence: self.sequencer.current(),
                    entries: self.store.len(),
                    failed_broadcasts: self.failed_broadcasts,
                });
            }
        }
    }

    fn apply(&mut self, key: String, body: Bytes) -> Result<u64, StateError> {
        if key.is_empty() {
            warn!("rejected proposal with an empty key");
            return Err(StateError::EmptyKey);
        }

        let sequence = self.sequencer.next();
        let entry = KvEntry {
            key,
            sequence,
            body,
        };

        if !self.store.put(entry.clone()) {
            debug!(sequence, key = %entry.key, "empty body sequenced but not stored");
        }

        // A failed broadcast leaves a permanent gap in the live stream.
        match self.bus.publish(entry) {
            Ok(receivers) => debug!(sequence, receivers, "update queued for subscribers"),
            Err(PublishError::NoSubscribers) => {
                self.failed_broadcasts += 1;
                debug!(sequence, "no subscribers for update");
            }
            Err(err) => {
                self.failed_broadcasts += 1;
                warn!(sequence, error = %err, "update not broadcast");
            }
        }

        info!("publishing update {sequence}");
        Ok(sequence)
    }

    fn capture(&self) -> Snapshot {
        Snapshot {
            entries: self.store.snapshot().cloned().collect(),
            sequence: self.sequencer.current(),
        }
    }
}
