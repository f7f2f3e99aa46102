use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::rendition_key::RenditionKey;

/// Marks a build for a given key as in progress.
///
/// Grounded on the reference scan orchestrator's `JobLease`: an owned record
/// with a start time and a TTL, except here the "worker" is implicit (one
/// HTTP task) and completion is signaled via a [`Notify`] rather than a
/// renew/expire RPC surface.
struct Lease {
    started_at: Instant,
    done: Arc<Notify>,
}

/// At-most-one-builder-per-key coalescer for rendition builds.
///
/// Callers call [`Coalescer::enter`]; the first caller for a key becomes the
/// leader and receives a [`LeaderGuard`] whose `Drop` always clears the
/// lease, so a panicking or early-returning leader can never wedge followers
/// forever. Every other concurrent caller for the same key becomes a
/// follower and is handed a future that resolves once the leader finishes.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Mutex<HashMap<RenditionKey, Lease>>>,
    lease_timeout: Duration,
}

pub enum Entry {
    Leader(LeaderGuard),
    Follower(Follower),
}

pub struct LeaderGuard {
    key: RenditionKey,
    table: Arc<Mutex<HashMap<RenditionKey, Lease>>>,
    done: Arc<Notify>,
    released: bool,
}

impl LeaderGuard {
    /// Releases the lease and wakes any followers. Idempotent.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.table.lock().remove(&self.key);
        self.done.notify_waiters();
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

pub struct Follower {
    done: Arc<Notify>,
}

impl Follower {
    pub async fn wait(self) {
        self.done.notified().await;
    }
}

impl Coalescer {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            lease_timeout,
        }
    }

    pub fn enter(&self, key: &RenditionKey) -> Entry {
        let mut table = self.inner.lock();
        if let Some(existing) = table.get(key) {
            return Entry::Follower(Follower {
                done: Arc::clone(&existing.done),
            });
        }
        let done = Arc::new(Notify::new());
        table.insert(
            key.clone(),
            Lease {
                started_at: Instant::now(),
                done: Arc::clone(&done),
            },
        );
        Entry::Leader(LeaderGuard {
            key: key.clone(),
            table: Arc::clone(&self.inner),
            done,
            released: false,
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Force-clears leases older than the configured timeout, protecting
    /// against a leader that crashed or hung without releasing. Meant to be
    /// driven by a periodic background task.
    pub fn sweep_expired(&self) -> usize {
        let mut table = self.inner.lock();
        let timeout = self.lease_timeout;
        let mut expired = Vec::new();
        for (key, lease) in table.iter() {
            if lease.started_at.elapsed() > timeout {
                expired.push(key.clone());
            }
        }
        for key in &expired {
            if let Some(lease) = table.remove(key) {
                debug!(key = %key, "coalescer lease expired, force-clearing");
                lease.done.notify_waiters();
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendition_key::{LongEdge, RenditionSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(n: u64) -> RenditionKey {
        RenditionKey::compute(&RenditionSpec {
            source_path: "/a.jpg".into(),
            long_edge: LongEdge::Pixels(800),
            quality: 60,
            source_mtime_ms: n as i64,
            source_len: 1,
        })
    }

    #[tokio::test]
    async fn second_entrant_becomes_follower() {
        let c = Coalescer::new(Duration::from_secs(30));
        let k = key(1);
        let leader = match c.enter(&k) {
            Entry::Leader(g) => g,
            Entry::Follower(_) => panic!("expected leader"),
        };
        match c.enter(&k) {
            Entry::Follower(_) => {}
            Entry::Leader(_) => panic!("expected follower"),
        }
        leader.release();
        assert_eq!(c.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn follower_wakes_on_leader_release() {
        let c = Coalescer::new(Duration::from_secs(30));
        let k = key(2);
        let leader = match c.enter(&k) {
            Entry::Leader(g) => g,
            _ => unreachable!(),
        };
        let follower = match c.enter(&k) {
            Entry::Follower(f) => f,
            _ => unreachable!(),
        };

        let woke = Arc::new(AtomicUsize::new(0));
        let woke2 = Arc::clone(&woke);
        let handle = tokio::spawn(async move {
            follower.wait().await;
            woke2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::task::yield_now().await;
        assert_eq!(woke.load(Ordering::SeqCst), 0);
        leader.release();
        handle.await.unwrap();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_without_explicit_release_still_frees_lease() {
        let c = Coalescer::new(Duration::from_secs(30));
        let k = key(3);
        {
            let _leader = match c.enter(&k) {
                Entry::Leader(g) => g,
                _ => unreachable!(),
            };
        }
        assert_eq!(c.in_flight_count(), 0);
    }

    #[test]
    fn sweep_expired_clears_stale_leases() {
        let c = Coalescer::new(Duration::from_millis(1));
        let k = key(4);
        let _leader = match c.enter(&k) {
            Entry::Leader(g) => g,
            _ => unreachable!(),
        };
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(c.sweep_expired(), 1);
        assert_eq!(c.in_flight_count(), 0);
    }
}
