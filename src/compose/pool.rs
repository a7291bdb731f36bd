use crate::foundation::core::Canvas;
use crate::foundation::error::{SketchError, SketchResult};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Pixel layout of every pooled buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PixelFormat {
    /// Opaque 8-bit RGBA, tightly packed, row-major.
    Rgba8,
}

/// Encoder-compatible raster handed to a [`crate::VideoWriter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout of `data`.
    pub format: PixelFormat,
    /// Pixel bytes (`width * height * 4`).
    pub data: Vec<u8>,
}

impl PixelBuffer {
    fn new(canvas: Canvas, format: PixelFormat) -> Self {
        Self {
            width: canvas.width,
            height: canvas.height,
            format,
            data: vec![0u8; canvas.byte_len()],
        }
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    /// Fill every pixel with `rgba`.
    pub fn fill(&mut self, rgba: [u8; 4]) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolOpts {
    /// Dimensions of every buffer.
    pub canvas: Canvas,
    /// Fixed pixel format.
    pub format: PixelFormat,
    /// Maximum number of buffers that may exist at once.
    pub capacity: usize,
}

/// Allocation counters, useful for leak checks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated over the pool's lifetime (never more than `capacity`).
    pub allocated: usize,
    /// Buffers currently checked out.
    pub outstanding: usize,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to wait for a release.
    pub waits: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
}

#[derive(Default)]
struct PoolState {
    free: Vec<PixelBuffer>,
    stats: PoolStats,
}

struct PoolShared {
    opts: BufferPoolOpts,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, buf: PixelBuffer) {
        let mut st = self.lock();
        st.stats.outstanding = st.stats.outstanding.saturating_sub(1);
        st.free.push(buf);
        drop(st);
        self.released.notify_one();
    }
}

/// Bounded set of reusable pixel buffers of one size and format.
///
/// Buffers are allocated lazily up to `capacity`; after that, acquisition blocks until a
/// [`PooledBuffer`] is dropped. Cloning the pool shares it.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new(opts: BufferPoolOpts) -> SketchResult<Self> {
        if opts.capacity == 0 {
            return Err(SketchError::validation("buffer pool capacity must be > 0"));
        }
        if opts.canvas.is_empty() {
            return Err(SketchError::validation("buffer pool canvas must be non-empty"));
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                opts,
                state: Mutex::new(PoolState::default()),
                released: Condvar::new(),
            }),
        })
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().stats.outstanding
    }

    /// Take a buffer without waiting.
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let mut st = self.shared.lock();
        let buf = self.take_locked(&mut st)?;
        Some(self.wrap(buf))
    }

    /// Take a buffer, waiting up to `timeout` for one to be released.
    ///
    /// Fails with [`SketchError::BufferPoolExhausted`] when the timeout elapses.
    pub fn acquire(&self, timeout: Duration) -> SketchResult<PooledBuffer> {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        let mut waited = false;
        loop {
            if let Some(buf) = self.take_locked(&mut st) {
                if waited {
                    st.stats.waits += 1;
                }
                drop(st);
                return Ok(self.wrap(buf));
            }

            let now = Instant::now();
            if now >= deadline {
                st.stats.timeouts += 1;
                return Err(SketchError::pool_exhausted(format!(
                    "all {} buffers in use after {:?}",
                    self.shared.opts.capacity, timeout
                )));
            }
            waited = true;
            st = self
                .shared
                .released
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn take_locked(&self, st: &mut PoolState) -> Option<PixelBuffer> {
        let buf = match st.free.pop() {
            Some(buf) => buf,
            None if st.stats.allocated < self.shared.opts.capacity => {
                st.stats.allocated += 1;
                PixelBuffer::new(self.shared.opts.canvas, self.shared.opts.format)
            }
            None => return None,
        };
        st.stats.outstanding += 1;
        st.stats.acquisitions += 1;
        Some(buf)
    }

    fn wrap(&self, buf: PixelBuffer) -> PooledBuffer {
        PooledBuffer {
            buf,
            shared: self.shared.clone(),
        }
    }
}

/// A checked-out buffer; returns to its pool when dropped.
pub struct PooledBuffer {
    buf: PixelBuffer,
    shared: Arc<PoolShared>,
}

impl Deref for PooledBuffer {
    type Target = PixelBuffer;

    fn deref(&self) -> &PixelBuffer {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut PixelBuffer {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::replace(
            &mut self.buf,
            PixelBuffer {
                width: 0,
                height: 0,
                format: PixelFormat::Rgba8,
                data: Vec::new(),
            },
        );
        self.shared.release(buf);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/compose/pool.rs"]
mod tests;
