use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Outcome handed back to a caller whose item never got to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    ShedOverload,
    CancelledFolderSwitch,
}

pub struct QueueItem {
    pub display_path: PathBuf,
    pub folder: PathBuf,
    pub enqueued_at: Instant,
    reply: oneshot::Sender<Result<(), Rejection>>,
}

struct SchedulerState {
    buffer: VecDeque<QueueItem>,
    current_folder: Option<PathBuf>,
    processing: bool,
    processing_since: Option<Instant>,
}

/// Adaptive single-worker admission queue in front of the transcoder.
///
/// Grounded on the reference scan orchestrator's `WeightedFairScheduler`:
/// the same `Arc<Mutex<State>>` ownership shape and reserve-then-release
/// lifecycle, simplified from weighted multi-library fairness down to the
/// gateway's single adaptive stack (FIFO under light load, LIFO once the
/// buffer gets deep, with folder-switch cancellation layered on top).
#[derive(Clone)]
pub struct RequestScheduler {
    state: Arc<Mutex<SchedulerState>>,
    max_size: usize,
    lifo_threshold: usize,
    processing_delay: Duration,
}

impl RequestScheduler {
    pub fn new(max_size: usize, lifo_threshold: usize, processing_delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                buffer: VecDeque::new(),
                current_folder: None,
                processing: false,
                processing_since: None,
            })),
            max_size,
            lifo_threshold,
            processing_delay,
        }
    }

    /// Enqueues a request for `display_path`. Resolves to `Ok(())` once this
    /// item is admitted for processing by the caller itself (the scheduler
    /// only gates *when* the caller may proceed, not *how*); resolves to
    /// `Err` if the item was shed for load or cancelled by a folder switch.
    pub async fn admit(&self, display_path: PathBuf) -> Result<Admission, Rejection> {
        let folder = display_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock().await;
            if state.current_folder.as_ref() != Some(&folder) {
                cancel_all(&mut state);
                state.current_folder = Some(folder.clone());
            }
            shed_if_overloaded(&mut state.buffer, self.max_size);
            state.buffer.push_back(QueueItem {
                display_path,
                folder,
                enqueued_at: Instant::now(),
                reply: tx,
            });
        }

        self.drive_one().await;

        match rx.await {
            Ok(Ok(())) => Ok(Admission {
                scheduler: self.clone(),
            }),
            Ok(Err(rejection)) => Err(rejection),
            Err(_) => Err(Rejection::CancelledFolderSwitch),
        }
    }

    async fn drive_one(&self) {
        let mut state = self.state.lock().await;
        if state.processing {
            return;
        }
        let item = if state.buffer.len() > self.lifo_threshold {
            state.buffer.pop_back()
        } else {
            state.buffer.pop_front()
        };
        let Some(item) = item else { return };
        state.processing = true;
        state.processing_since = Some(Instant::now());
        drop(state);

        tokio::time::sleep(self.processing_delay).await;
        let _ = item.reply.send(Ok(()));
    }

    /// Must be called by whoever received an [`Admission`] once their
    /// processing is complete, freeing the worker slot for the next item.
    async fn release(&self) {
        {
            let mut state = self.state.lock().await;
            state.processing = false;
            state.processing_since = None;
        }
        self.drive_one().await;
    }

    pub async fn depth(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    /// Periodic watchdog: resets a worker stuck processing past `stuck_after`,
    /// and separately sheds a backed-up buffer that the drive loop isn't
    /// draining fast enough, per the two-tier buffer-depth policy (drop 30%
    /// past 60, force-recover past 100).
    pub async fn detect_stuck(&self, stuck_after: Duration) {
        let mut state = self.state.lock().await;
        if let Some(since) = state.processing_since {
            if since.elapsed() > stuck_after {
                warn!("scheduler worker stuck, forcing reset");
                state.processing = false;
                state.processing_since = None;
            }
        }
        shed_stuck_buffer(&mut state);
    }

    /// Runs `fut` under a hard outer timeout and a tighter inner timeout,
    /// mapping timeouts to the distinct status-relevant rejections the
    /// frontend needs to choose between 408 and 500.
    pub async fn run_with_timeouts<F, T>(
        outer: Duration,
        inner: Duration,
        fut: F,
    ) -> Result<T, TimeoutKind>
    where
        F: std::future::Future<Output = T>,
    {
        match timeout(outer, async {
            match timeout(inner, fut).await {
                Ok(v) => Ok(v),
                Err(_) => Err(TimeoutKind::Inner),
            }
        })
        .await
        {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(k)) => Err(k),
            Err(_) => Err(TimeoutKind::Outer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Outer,
    Inner,
}

/// RAII handle proving a request was admitted; dropping it frees the
/// scheduler's worker slot even if the caller's own processing panics.
pub struct Admission {
    scheduler: RequestScheduler,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").finish()
    }
}

impl PartialEq for Admission {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.scheduler.state, &other.scheduler.state)
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            scheduler.release().await;
        });
    }
}

/// Folder switch invalidates the whole buffer *and* the in-flight worker
/// slot: a request already being processed for the stale folder has no
/// reader left waiting on it, so the slot is freed immediately rather than
/// left for the separate stuck-detector to notice up to 5s later.
fn cancel_all(state: &mut SchedulerState) {
    let cancelled = state.buffer.len();
    for item in state.buffer.drain(..) {
        let _ = item.reply.send(Err(Rejection::CancelledFolderSwitch));
    }
    if cancelled > 0 {
        debug!(cancelled, "folder switch cancelled buffered requests");
    }
    if state.processing {
        state.processing = false;
        state.processing_since = None;
    }
}

/// Buffer-depth half of the stuck-buffer watchdog: past 60 queued items,
/// drop the oldest 30% to relieve pressure; past 100, force-recover by
/// draining the whole buffer and releasing the worker slot, since a buffer
/// that deep means the drive loop has fallen far enough behind that partial
/// shedding won't catch up.
fn shed_stuck_buffer(state: &mut SchedulerState) {
    let len = state.buffer.len();
    if len > 100 {
        warn!(depth = len, "buffer depth critical, force-recovering");
        cancel_all(state);
        return;
    }
    if len > 60 {
        let drop_count = len * 3 / 10;
        warn!(depth = len, drop_count, "buffer depth high, shedding oldest 30%");
        for _ in 0..drop_count {
            if let Some(oldest) = state.buffer.pop_front() {
                let _ = oldest.reply.send(Err(Rejection::ShedOverload));
            }
        }
    }
}

fn shed_if_overloaded(buffer: &mut VecDeque<QueueItem>, max_size: usize) {
    let len = buffer.len();
    let drop_count = if len >= max_size * 4 / 5 {
        len / 2
    } else if len >= max_size / 2 {
        len / 4
    } else if len >= max_size {
        1
    } else {
        0
    };
    for _ in 0..drop_count {
        if let Some(oldest) = buffer.pop_front() {
            let _ = oldest.reply.send(Err(Rejection::ShedOverload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_under_light_load() {
        let sched = RequestScheduler::new(100, 30, Duration::from_millis(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let sched = sched.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let admission = sched.admit(PathBuf::from(format!("/a/{i}.jpg"))).await.unwrap();
                order.lock().await.push(i);
                drop(admission);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let observed = order.lock().await.clone();
        assert_eq!(observed, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn folder_switch_cancels_buffered_items() {
        let sched = RequestScheduler::new(100, 30, Duration::from_millis(50));
        let sched_a = sched.clone();
        // occupy the worker so subsequent admits queue up
        let busy = tokio::spawn(async move {
            let _admission = sched_a.admit(PathBuf::from("/A/0.jpg")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut queued = Vec::new();
        for i in 1..4 {
            let sched = sched.clone();
            queued.push(tokio::spawn(
                async move { sched.admit(PathBuf::from(format!("/A/{i}.jpg"))).await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        // switching folder should cancel the three queued-but-not-yet-run items
        let switcher = sched.admit(PathBuf::from("/B/0.jpg"));
        let _ = tokio::join!(busy, switcher);

        for h in queued {
            let res = h.await.unwrap();
            assert_eq!(res, Err(Rejection::CancelledFolderSwitch));
        }
    }

    #[tokio::test]
    async fn shedding_caps_buffer_depth() {
        let sched = RequestScheduler::new(10, 3, Duration::from_millis(20));
        let sched_a = sched.clone();
        let busy = tokio::spawn(async move {
            let _a = sched_a.admit(PathBuf::from("/A/0.jpg")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut handles = Vec::new();
        for i in 1..20 {
            let sched = sched.clone();
            handles.push(tokio::spawn(async move {
                sched.admit(PathBuf::from(format!("/A/{i}.jpg"))).await
            }));
        }
        let depth_during = sched.depth().await;
        assert!(depth_during <= 10);
        busy.abort();
        for h in handles {
            let _ = h.await;
        }
    }
}
