//! Deduplicating work queue keyed by bundle.
//!
//! A key is queued at most once and is never handed to two workers at the
//! same time. A key added while it is being worked on is remembered and
//! queued again when the worker reports it done.

use std::collections::VecDeque;

use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Default)]
struct State {
    order: VecDeque<String>,
    queued: FxHashSet<String>,
    in_flight: FxHashSet<String>,
    /// Re-added while in flight.
    dirty: FxHashSet<String>,
    dropped: u64,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    cap: usize,
}

impl WorkQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self { state: Mutex::new(State::default()), notify: Notify::new(), cap: cap.max(1) }
    }

    /// Queues `key` unless it is already waiting. Returns whether the key was
    /// newly queued or marked for another run.
    pub async fn add(&self, key: &str) -> bool {
        let mut st = self.state.lock().await;
        if st.in_flight.contains(key) {
            return st.dirty.insert(key.to_string());
        }
        if st.queued.contains(key) {
            return false;
        }
        if st.order.len() >= self.cap {
            if let Some(old) = st.order.pop_front() {
                st.queued.remove(&old);
                st.dropped += 1;
                counter!("workqueue_dropped_total", 1u64);
                warn!(key = %old, capacity = self.cap, "work queue full; dropped oldest key");
            }
        }
        st.order.push_back(key.to_string());
        st.queued.insert(key.to_string());
        drop(st);
        self.notify.notify_one();
        true
    }

    async fn try_take(&self) -> Option<String> {
        let mut st = self.state.lock().await;
        let key = st.order.pop_front()?;
        st.queued.remove(&key);
        st.in_flight.insert(key.clone());
        Some(key)
    }

    /// Waits for the next key. `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(key) = self.try_take().await {
                return Some(key);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Releases `key`; queues it again if it was re-added meanwhile.
    pub async fn done(&self, key: &str) {
        let requeue = {
            let mut st = self.state.lock().await;
            st.in_flight.remove(key);
            st.dirty.remove(key)
        };
        if requeue {
            self.add(key).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn dropped(&self) -> u64 {
        self.state.lock().await.dropped
    }
}
