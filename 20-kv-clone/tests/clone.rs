use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use bytes::Bytes;
use kv_clone::{
    client::Subscriber,
    collector::CollectorClient,
    config::ChannelAddrs,
    entry::KvEntry,
    replica::MergeOutcome,
    server::Publisher,
    state::PublisherHandle,
    transport::Connection,
};
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};

const WAIT: Duration = Duration::from_secs(2);

struct Running {
    addrs: ChannelAddrs,
    handle: PublisherHandle,
    stop: oneshot::Sender<()>,
    server: JoinHandle<Result<()>>,
}

impl Running {
    async fn stop(self) -> Result<()> {
        let _ = self.stop.send(());
        self.server.await?
    }
}

async fn start_publisher() -> Result<Running> {
    let any: SocketAddr = "127.0.0.1:0".parse()?;
    let publisher = Publisher::bind(&ChannelAddrs::uniform(any)).await?;
    let addrs = publisher.local_addrs()?;
    let handle = publisher.handle();

    let (stop, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(publisher.run_until(async move {
        let _ = stop_rx.await;
    }));

    Ok(Running {
        addrs,
        handle,
        stop,
        server,
    })
}

/// Polls until the replica has applied `sequence` or the wait runs out.
async fn follow_until(subscriber: &mut Subscriber, sequence: u64) -> Result<()> {
    timeout(WAIT, async {
        while subscriber.replica().last_applied() < sequence {
            subscriber.poll_update(Duration::from_millis(100)).await?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|_| anyhow!("update {sequence} never arrived"))?
}

/// Collector writes are fire-and-forget; wait until the publisher has
/// sequenced them.
async fn wait_for_sequence(handle: &PublisherHandle, sequence: u64) -> Result<()> {
    timeout(WAIT, async {
        while handle.stats().await?.sequence < sequence {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .map_err(|_| anyhow!("sequence {sequence} was never issued"))?
}

fn body_of(subscriber: &Subscriber, key: &str) -> Option<Bytes> {
    subscriber.replica().store().get(key).map(|entry| entry.body.clone())
}

#[tokio::test]
async fn late_subscriber_catches_up_then_follows() -> Result<()> {
    let running = start_publisher().await?;
    assert_eq!(running.handle.submit("a", "1").await, Ok(1));
    assert_eq!(running.handle.submit("b", "2").await, Ok(2));

    let mut subscriber = Subscriber::connect(&running.addrs).await?;
    assert_eq!(subscriber.bootstrap().await?, 2);
    assert_eq!(subscriber.replica().store().len(), 2);
    assert_eq!(body_of(&subscriber, "a"), Some(Bytes::from_static(b"1")));
    assert_eq!(body_of(&subscriber, "b"), Some(Bytes::from_static(b"2")));

    assert_eq!(running.handle.submit("a", "3").await, Ok(3));
    let outcome = timeout(WAIT, subscriber.poll_update(WAIT)).await??;
    assert_eq!(outcome, Some(MergeOutcome::Applied));
    assert_eq!(subscriber.replica().last_applied(), 3);
    assert_eq!(body_of(&subscriber, "a"), Some(Bytes::from_static(b"3")));

    running.stop().await
}

#[tokio::test]
async fn updates_covered_by_the_snapshot_are_discarded() -> Result<()> {
    let running = start_publisher().await?;

    // Registered on the live channel before the write, so the update is
    // both in the snapshot and in flight.
    let mut subscriber = Subscriber::connect(&running.addrs).await?;
    assert_eq!(running.handle.submit("b", "2").await, Ok(1));
    assert_eq!(subscriber.bootstrap().await?, 1);

    let stale = timeout(WAIT, subscriber.poll_update(WAIT)).await??;
    assert_eq!(stale, Some(MergeOutcome::Discarded));

    assert_eq!(running.handle.submit("c", "3").await, Ok(2));
    let fresh = timeout(WAIT, subscriber.poll_update(WAIT)).await??;
    assert_eq!(fresh, Some(MergeOutcome::Applied));

    let stats = subscriber.replica().stats();
    assert_eq!((stats.applied, stats.discarded), (1, 1));
    assert_eq!(subscriber.replica().store().len(), 2);

    running.stop().await
}

#[tokio::test]
async fn duplicate_writes_through_the_collector_get_distinct_sequences() -> Result<()> {
    let running = start_publisher().await?;
    let mut subscriber = Subscriber::connect(&running.addrs).await?;
    assert_eq!(subscriber.bootstrap().await?, 0);

    let mut writer = CollectorClient::connect(running.addrs.collector).await?;
    writer.push("a", "1").await?;
    writer.push("a", "1").await?;
    writer.close().await?;

    follow_until(&mut subscriber, 2).await?;
    assert_eq!(subscriber.replica().store().len(), 1);
    assert_eq!(subscriber.replica().store().get("a").map(|e| e.sequence), Some(2));

    let stats = running.handle.stats().await?;
    assert_eq!((stats.sequence, stats.entries), (2, 1));

    running.stop().await
}

#[tokio::test]
async fn wrong_snapshot_token_closes_the_connection() -> Result<()> {
    let running = start_publisher().await?;
    running.handle.submit("a", "1").await?;

    let mut conn = Connection::connect(running.addrs.snapshot).await?;
    conn.send(vec![Bytes::from_static(b"GIMME")]).await?;
    let reply = timeout(WAIT, conn.recv()).await?;
    assert!(matches!(reply, Ok(None) | Err(_)), "unexpected reply: {reply:?}");

    // The responder keeps serving well-behaved requesters.
    let mut subscriber = Subscriber::connect(&running.addrs).await?;
    assert_eq!(subscriber.bootstrap().await?, 1);

    running.stop().await
}

#[tokio::test]
async fn sentinel_never_lands_in_either_store() -> Result<()> {
    let running = start_publisher().await?;
    let mut subscriber = Subscriber::connect(&running.addrs).await?;

    let mut writer = CollectorClient::connect(running.addrs.collector).await?;
    writer.push("", "not a key").await?;
    writer.push("k", "v").await?;
    writer.close().await?;

    wait_for_sequence(&running.handle, 1).await?;
    assert_eq!(subscriber.bootstrap().await?, 1);
    assert!(subscriber.replica().store().get("").is_none());

    let snapshot = running.handle.snapshot().await?;
    assert!(snapshot.entries.iter().all(|entry| !entry.is_sentinel()));
    assert_eq!(snapshot.entries, vec![KvEntry::new("k", "v").with_sequence(1)]);

    running.stop().await
}

#[tokio::test]
async fn empty_body_is_sequenced_but_not_stored() -> Result<()> {
    let running = start_publisher().await?;
    let mut subscriber = Subscriber::connect(&running.addrs).await?;
    assert_eq!(subscriber.bootstrap().await?, 0);

    running.handle.submit("a", "1").await?;
    running.handle.submit("a", Bytes::new()).await?;
    follow_until(&mut subscriber, 2).await?;

    // The key keeps its previous value; no deletion is modelled.
    assert_eq!(body_of(&subscriber, "a"), Some(Bytes::from_static(b"1")));
    assert_eq!(subscriber.replica().store().get("a").map(|e| e.sequence), Some(1));
    let stats = running.handle.stats().await?;
    assert_eq!(stats.sequence, 2);

    running.stop().await
}

#[tokio::test]
async fn shutdown_is_not_held_up_by_a_subscriber_that_stops_reading() -> Result<()> {
    let running = start_publisher().await?;

    // Read the greeting so the connection is registered, then never read again.
    let mut stalled = Connection::connect(running.addrs.publisher).await?;
    let greeting = timeout(WAIT, stalled.recv()).await??;
    assert!(greeting.is_some());

    let body = Bytes::from(vec![b'x'; 1 << 20]);
    for index in 0..64 {
        running.handle.submit(format!("k{index}"), body.clone()).await?;
    }

    let stopped = timeout(Duration::from_secs(5), running.stop()).await;
    assert!(stopped.is_ok(), "publisher shutdown hung on a stalled subscriber");
    stopped??;

    drop(stalled);
    Ok(())
}

#[tokio::test]
async fn subscribers_bootstrapping_during_writes_converge() -> Result<()> {
    const WRITES: u64 = 300;

    let running = start_publisher().await?;
    let writer = {
        let handle = running.handle.clone();
        tokio::spawn(async move {
            for index in 0..WRITES {
                handle.submit(format!("k{}", index % 20), index.to_string()).await?;
                if index % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            Ok::<_, anyhow::Error>(())
        })
    };

    let mut joiners = Vec::new();
    for delay in [0, 5, 10, 20] {
        let addrs = running.addrs;
        joiners.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let mut subscriber = Subscriber::connect(&addrs).await?;
            subscriber.bootstrap().await?;
            Ok::<_, anyhow::Error>(subscriber)
        }));
    }

    writer.await??;
    let mut expected = running.handle.snapshot().await?;
    assert_eq!(expected.sequence, WRITES);
    expected.entries.sort_by(|a, b| a.key.cmp(&b.key));

    for joiner in joiners {
        let mut subscriber = joiner.await??;
        follow_until(&mut subscriber, WRITES).await?;

        let mut replica: Vec<KvEntry> = subscriber.replica().store().snapshot().cloned().collect();
        replica.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(replica, expected.entries);
    }

    running.stop().await
}
