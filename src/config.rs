use crate::compose::compositor::CompositorOpts;
use crate::foundation::error::{SketchError, SketchResult};
use crate::pipeline::progress::ProgressOpts;
use crate::store::frame_store::FrameStoreOpts;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

/// Options for a [`crate::PipelineController`] and every component it owns.
///
/// Every field has a calibrated default, so a JSON document only needs to name what it overrides:
///
/// ```json
/// { "compositor": { "pool_capacity": 4 }, "flush_timeout_ms": 5000 }
/// ```
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PipelineOpts {
    /// Frame persistence.
    pub store: FrameStoreOpts,
    /// Video assembly.
    pub compositor: CompositorOpts,
    /// Synthetic progress signal.
    pub progress: ProgressOpts,
    /// Upper bound for waiting on the last frame write after recording stops.
    pub flush_timeout_ms: u64,
}

impl Default for PipelineOpts {
    fn default() -> Self {
        Self {
            store: FrameStoreOpts::default(),
            compositor: CompositorOpts::default(),
            progress: ProgressOpts::default(),
            flush_timeout_ms: 10_000,
        }
    }
}

impl PipelineOpts {
    /// Parse options from a JSON reader. Missing fields keep their defaults.
    pub fn from_reader<R: std::io::Read>(r: R) -> SketchResult<Self> {
        let opts: Self = serde_json::from_reader(r)
            .map_err(|e| SketchError::validation(format!("parse pipeline options JSON: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Parse options from a JSON string.
    pub fn from_json_str(s: &str) -> SketchResult<Self> {
        Self::from_reader(s.as_bytes())
    }

    /// Parse options from a JSON file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> SketchResult<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| {
            SketchError::validation(format!("open pipeline options '{}': {e}", path.display()))
        })?;
        Self::from_reader(BufReader::new(f))
    }

    /// Validate every nested options struct.
    pub fn validate(&self) -> SketchResult<()> {
        self.store.validate()?;
        self.compositor.validate()?;
        self.progress.validate()?;
        if self.flush_timeout_ms == 0 {
            return Err(SketchError::validation("flush_timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// [`PipelineOpts::flush_timeout_ms`] as a duration.
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[cfg(test)]
#[path = "../tests/unit/config.rs"]
mod tests;
