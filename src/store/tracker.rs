use crate::foundation::core::FrameIndex;
use crate::foundation::error::{SketchError, SketchResult};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TrackerState {
    // Writes complete in index order, so one watermark covers every persisted frame.
    durable_through: u32,
    failed: Option<(FrameIndex, String)>,
}

/// Per-frame write-completion signal shared by the store's I/O worker and its waiters.
#[derive(Debug, Default)]
pub(crate) struct WriteTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
}

impl WriteTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Tracker for a session whose frames `1..=count` are already on disk.
    pub(crate) fn persisted_through(count: u32) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                durable_through: count,
                failed: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn mark_persisted(&self, index: FrameIndex) {
        let mut st = self.lock();
        st.durable_through = st.durable_through.max(index.get());
        drop(st);
        self.changed.notify_all();
    }

    pub(crate) fn mark_failed(&self, index: FrameIndex, reason: String) {
        let mut st = self.lock();
        if st.failed.is_none() {
            st.failed = Some((index, reason));
        }
        drop(st);
        self.changed.notify_all();
    }

    pub(crate) fn durable_through(&self) -> u32 {
        self.lock().durable_through
    }

    pub(crate) fn failure(&self) -> Option<SketchError> {
        self.lock()
            .failed
            .as_ref()
            .map(|(i, r)| SketchError::frame_write(*i, r.clone()))
    }

    /// Block until `index` is durable, a write at or before it failed, or `timeout` elapses.
    ///
    /// `None` waits without a deadline.
    pub(crate) fn wait_for(&self, index: FrameIndex, timeout: Option<Duration>) -> SketchResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.lock();
        loop {
            if let Some((failed, reason)) = st.failed.as_ref()
                && failed.get() <= index.get()
            {
                return Err(SketchError::frame_write(*failed, reason.clone()));
            }
            if st.durable_through >= index.get() {
                return Ok(());
            }

            st = match deadline {
                None => self.changed.wait(st).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SketchError::frame_write(
                            index,
                            "timed out waiting for durable write",
                        ));
                    }
                    self.changed
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/store/tracker.rs"]
mod tests;
