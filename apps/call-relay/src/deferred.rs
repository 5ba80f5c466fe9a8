use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredKind {
    RecordingLookup,
    Eviction,
}

impl DeferredKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecordingLookup => "recording_lookup",
            Self::Eviction => "eviction",
        }
    }
}

type TaskKey = (String, DeferredKind);

struct PendingTask {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct DeferredInner {
    next_generation: u64,
    pending: HashMap<TaskKey, PendingTask>,
}

/// Delayed background work keyed by call id and kind.
///
/// Scheduling a kind that is already pending for the same call replaces it.
#[derive(Default)]
pub struct DeferredTasks {
    inner: Mutex<DeferredInner>,
}

impl DeferredTasks {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn schedule<F>(
        self: &Arc<Self>,
        call_id: &str,
        kind: DeferredKind,
        delay: Duration,
        work: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = (call_id.to_string(), kind);
        let mut inner = self.inner.lock().await;
        inner.next_generation = inner.next_generation.wrapping_add(1);
        let generation = inner.next_generation;

        let tasks = Arc::clone(self);
        let task_key = key.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
            tasks.finish(&task_key, generation).await;
        });

        if let Some(previous) = inner.pending.insert(
            key,
            PendingTask {
                generation,
                handle: join.abort_handle(),
            },
        ) {
            previous.handle.abort();
            tracing::debug!(
                call_id,
                kind = kind.as_str(),
                "replaced pending deferred task"
            );
        }
    }

    pub async fn cancel(&self, call_id: &str, kind: DeferredKind) -> bool {
        let key = (call_id.to_string(), kind);
        match self.inner.lock().await.pending.remove(&key) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn is_pending(&self, call_id: &str, kind: DeferredKind) -> bool {
        self.inner
            .lock()
            .await
            .pending
            .contains_key(&(call_id.to_string(), kind))
    }

    async fn finish(&self, key: &TaskKey, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner
            .pending
            .get(key)
            .is_some_and(|task| task.generation == generation)
        {
            inner.pending.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn scheduled_work_runs_after_delay_and_clears_itself() {
        let tasks = DeferredTasks::shared();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tasks
            .schedule(
                "CA1",
                DeferredKind::Eviction,
                Duration::from_millis(10),
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;
        assert!(tasks.is_pending("CA1", DeferredKind::Eviction).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!tasks.is_pending("CA1", DeferredKind::Eviction).await);
    }

    #[tokio::test]
    async fn rescheduling_replaces_the_pending_task() {
        let tasks = DeferredTasks::shared();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&hits);
            tasks
                .schedule(
                    "CA1",
                    DeferredKind::RecordingLookup,
                    Duration::from_millis(20),
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_only_touches_the_named_kind() {
        let tasks = DeferredTasks::shared();
        let hits = Arc::new(AtomicUsize::new(0));
        for (call_id, kind) in [
            ("CA1", DeferredKind::RecordingLookup),
            ("CA1", DeferredKind::Eviction),
            ("CA2", DeferredKind::RecordingLookup),
        ] {
            let counter = Arc::clone(&hits);
            tasks
                .schedule(call_id, kind, Duration::from_millis(30), async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        assert!(tasks.cancel("CA1", DeferredKind::RecordingLookup).await);
        assert!(!tasks.cancel("CA1", DeferredKind::RecordingLookup).await);
        assert!(tasks.is_pending("CA1", DeferredKind::Eviction).await);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
