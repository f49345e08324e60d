use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::core::error::EngineError;

/// Ordered backlog of pending jobs.
///
/// Each item carries a collision key (resolved output identity). `dequeue`
/// claims the key of the job it hands out and skips jobs whose key is
/// already claimed, so no two jobs writing the same output run concurrently;
/// skipped jobs stay queued in place and become eligible again when
/// `release` is called. Among dispatchable items the order is strict FIFO.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

struct QueueInner {
    items: VecDeque<(Uuid, String)>,
    in_flight: HashSet<String>,
    closed: bool,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                in_flight: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends a job at the tail. Never blocks; fails only after shutdown.
    pub fn enqueue(&self, id: Uuid, key: String) -> Result<(), EngineError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(EngineError::EngineClosed);
            }
            inner.items.push_back((id, key));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Removes and returns the first dispatchable job, waiting if none is
    /// available. Returns `None` once the queue is closed: no more work.
    pub async fn dequeue(&self) -> Option<(Uuid, String)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                let pos = inner
                    .items
                    .iter()
                    .position(|(_, key)| !inner.in_flight.contains(key));
                if let Some(pos) = pos {
                    if let Some((id, key)) = inner.items.remove(pos) {
                        inner.in_flight.insert(key.clone());
                        return Some((id, key));
                    }
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases a collision key claimed by `dequeue`, waking workers whose
    /// head-of-queue job was blocked on it.
    pub fn release(&self, key: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight.remove(key);
        }
        self.notify.notify_waiters();
    }

    /// Excises a still-pending job. Returns false if the job had already
    /// been dispatched to a worker (or was never queued).
    pub fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.items.iter().position(|(queued, _)| *queued == id);
        match pos {
            Some(pos) => {
                inner.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Closes the queue and drains whatever was still pending. Blocked
    /// `dequeue` calls return `None`.
    pub fn close(&self) -> Vec<Uuid> {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.items.drain(..).map(|(id, _)| id).collect()
        };
        self.notify.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn id() -> Uuid {
        Uuid::new_v4()
    }

    #[tokio::test]
    async fn dispatches_in_fifo_order() {
        let queue = JobQueue::new();
        let (a, b, c) = (id(), id(), id());
        queue.enqueue(a, "ka".into()).unwrap();
        queue.enqueue(b, "kb".into()).unwrap();
        queue.enqueue(c, "kc".into()).unwrap();

        assert_eq!(queue.dequeue().await.map(|(id, _)| id), Some(a));
        assert_eq!(queue.dequeue().await.map(|(id, _)| id), Some(b));
        assert_eq!(queue.dequeue().await.map(|(id, _)| id), Some(c));
    }

    #[tokio::test]
    async fn skips_jobs_with_claimed_output_key() {
        let queue = JobQueue::new();
        let (a, b, c) = (id(), id(), id());
        queue.enqueue(a, "same".into()).unwrap();
        queue.enqueue(b, "same".into()).unwrap();
        queue.enqueue(c, "other".into()).unwrap();

        let (first, key) = queue.dequeue().await.unwrap();
        assert_eq!(first, a);
        // b collides with the in-flight key, so c is handed out next.
        assert_eq!(queue.dequeue().await.map(|(id, _)| id), Some(c));

        queue.release(&key);
        assert_eq!(queue.dequeue().await.map(|(id, _)| id), Some(b));
    }

    #[tokio::test]
    async fn remove_reports_whether_job_was_still_pending() {
        let queue = JobQueue::new();
        let (a, b) = (id(), id());
        queue.enqueue(a, "ka".into()).unwrap();
        queue.enqueue(b, "kb".into()).unwrap();

        let _ = queue.dequeue().await.unwrap();
        assert!(!queue.remove(a), "already dispatched");
        assert!(queue.remove(b));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn close_unblocks_waiting_workers() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let drained = queue.close();
        assert!(drained.is_empty());
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn enqueue_after_close_fails() {
        let queue = JobQueue::new();
        queue.close();
        assert!(matches!(
            queue.enqueue(id(), "k".into()),
            Err(EngineError::EngineClosed)
        ));
    }

    #[tokio::test]
    async fn close_drains_pending_items() {
        let queue = JobQueue::new();
        let (a, b) = (id(), id());
        queue.enqueue(a, "ka".into()).unwrap();
        queue.enqueue(b, "kb".into()).unwrap();
        let drained = queue.close();
        assert_eq!(drained, vec![a, b]);
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn blocked_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let a = id();
        queue.enqueue(a, "ka".into()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.map(|(id, _)| id), Some(a));
    }
}
