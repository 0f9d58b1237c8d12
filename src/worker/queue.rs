//! Hash-sharded bounded job queues with one consumer task per shard

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::memory::UserKey;

struct Shards<J> {
    senders: Vec<mpsc::Sender<J>>,
    consumers: Vec<JoinHandle<()>>,
    started: bool,
}

/// A fixed set of bounded queues, each drained by its own task.
///
/// Jobs for one user always land on the same shard, so they are handled in
/// the order they were enqueued. Enqueueing holds the shared lock for the
/// duration of the send; `stop` takes the exclusive lock, so a send can
/// never race a closing channel.
pub(crate) struct JobQueueShardSet<J> {
    shard_count: usize,
    queue_capacity: usize,
    shards: RwLock<Shards<J>>,
}

impl<J: Send + 'static> JobQueueShardSet<J> {
    pub(crate) fn new(shard_count: usize, queue_capacity: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
            queue_capacity: queue_capacity.max(1),
            shards: RwLock::new(Shards {
                senders: Vec::new(),
                consumers: Vec::new(),
                started: false,
            }),
        }
    }

    /// Spawn one consumer per shard. Returns false if already running.
    ///
    /// A panic inside `handler` is logged and the consumer moves on to the
    /// next job.
    pub(crate) async fn start<H, Fut>(&self, handler: H) -> bool
    where
        H: Fn(J) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shards = self.shards.write().await;
        if shards.started {
            return false;
        }

        for shard in 0..self.shard_count {
            let (tx, mut rx) = mpsc::channel::<J>(self.queue_capacity);
            let handler = handler.clone();
            let consumer = tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    if let Err(panic) = AssertUnwindSafe(handler(job)).catch_unwind().await {
                        tracing::error!(
                            "auto_memory: panic in memory worker (shard {}): {}",
                            shard,
                            panic_message(panic.as_ref())
                        );
                    }
                }
            });
            shards.senders.push(tx);
            shards.consumers.push(consumer);
        }
        shards.started = true;
        true
    }

    /// Close every queue and wait for the consumers to drain them.
    pub(crate) async fn stop(&self) {
        let mut shards = self.shards.write().await;
        if !shards.started {
            return;
        }

        // Dropping the senders closes the channels; receivers still drain
        // whatever was buffered before returning None.
        shards.senders.clear();
        for consumer in shards.consumers.drain(..) {
            if let Err(e) = consumer.await {
                tracing::error!("auto_memory: memory worker task failed: {}", e);
            }
        }
        shards.started = false;
    }

    /// Hand a job to its shard without waiting.
    ///
    /// The job comes back when the caller is already cancelled, the set is
    /// stopped, or the shard is full.
    pub(crate) async fn try_enqueue(
        &self,
        user_key: &UserKey,
        job: J,
        cancel: &CancellationToken,
    ) -> Result<(), J> {
        if cancel.is_cancelled() {
            return Err(job);
        }

        let shards = self.shards.read().await;
        if !shards.started || shards.senders.is_empty() {
            return Err(job);
        }

        let index = shard_index(user_key, shards.senders.len());
        match shards.senders[index].try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!("auto_memory: memory job queue full, fallback to sync");
                Err(job)
            }
            Err(mpsc::error::TrySendError::Closed(job)) => Err(job),
        }
    }

    pub(crate) async fn is_started(&self) -> bool {
        self.shards.read().await.started
    }

    /// Consumer tasks currently alive
    pub(crate) async fn running_consumers(&self) -> usize {
        let shards = self.shards.read().await;
        shards.consumers.iter().filter(|c| !c.is_finished()).count()
    }
}

pub(crate) fn shard_index(user_key: &UserKey, shard_count: usize) -> usize {
    fnv1a_32(&[user_key.app_name.as_bytes(), user_key.user_id.as_bytes()]) as usize % shard_count
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the concatenation of `parts`
fn fnv1a_32(parts: &[&[u8]]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in parts.iter().flat_map(|p| p.iter()) {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a_32(&[]), 0x811c_9dc5);
        assert_eq!(fnv1a_32(&["a".as_bytes()]), 0xe40c_292c);
        assert_eq!(fnv1a_32(&["foobar".as_bytes()]), 0xbf9c_f968);
        assert_eq!(
            fnv1a_32(&["foo".as_bytes(), "bar".as_bytes()]),
            fnv1a_32(&["foobar".as_bytes()])
        );
    }

    #[test]
    fn same_user_same_shard() {
        let key = UserKey::new("app", "alice");
        let first = shard_index(&key, 8);
        for _ in 0..10 {
            assert_eq!(shard_index(&key.clone(), 8), first);
        }
        assert!(first < 8);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let set = JobQueueShardSet::<u32>::new(3, 4);
        assert!(!set.is_started().await);
        set.stop().await;

        assert!(set.start(|_job| async {}).await);
        assert!(!set.start(|_job| async {}).await);
        assert!(set.is_started().await);
        assert_eq!(set.running_consumers().await, 3);

        set.stop().await;
        set.stop().await;
        assert!(!set.is_started().await);
        assert_eq!(set.running_consumers().await, 0);

        // restart after stop
        assert!(set.start(|_job| async {}).await);
        assert_eq!(set.running_consumers().await, 3);
        set.stop().await;
    }

    #[tokio::test]
    async fn zero_sizes_are_floored() {
        let set = JobQueueShardSet::<u32>::new(0, 0);
        set.start(|_job| async {}).await;
        assert_eq!(set.running_consumers().await, 1);
        set.stop().await;
    }

    #[tokio::test]
    async fn stopped_or_cancelled_enqueue_returns_job() {
        let set = JobQueueShardSet::<u32>::new(1, 1);
        let key = UserKey::new("app", "u");
        let live = CancellationToken::new();
        assert_eq!(set.try_enqueue(&key, 7, &live).await, Err(7));

        set.start(|_job| async {}).await;
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert_eq!(set.try_enqueue(&key, 8, &cancelled).await, Err(8));
        set.stop().await;
    }

    #[tokio::test]
    async fn full_queue_refuses_and_stop_drains() {
        let set = JobQueueShardSet::<u32>::new(1, 1);
        let key = UserKey::new("app", "u");
        let live = CancellationToken::new();
        let gate = Arc::new(Notify::new());
        let handled = Arc::new(AtomicUsize::new(0));

        let (g, h) = (gate.clone(), handled.clone());
        set.start(move |_job| {
            let (g, h) = (g.clone(), h.clone());
            async move {
                g.notified().await;
                h.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        // first job is picked up by the consumer and blocks on the gate
        assert_eq!(set.try_enqueue(&key, 1, &live).await, Ok(()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // second job fills the single slot
        assert_eq!(set.try_enqueue(&key, 2, &live).await, Ok(()));
        assert_eq!(set.try_enqueue(&key, 3, &live).await, Err(3));

        let releaser = {
            let gate = gate.clone();
            tokio::spawn(async move {
                for _ in 0..2 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    gate.notify_one();
                }
            })
        };
        set.stop().await;
        releaser.await.unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_consumer() {
        let set = JobQueueShardSet::<u32>::new(1, 4);
        let key = UserKey::new("app", "u");
        let live = CancellationToken::new();
        let handled = Arc::new(AtomicUsize::new(0));

        let h = handled.clone();
        set.start(move |job| {
            let h = h.clone();
            async move {
                if job == 0 {
                    panic!("bad job");
                }
                h.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        set.try_enqueue(&key, 0, &live).await.unwrap();
        set.try_enqueue(&key, 1, &live).await.unwrap();
        set.stop().await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
