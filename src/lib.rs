//! Sketchreel turns a narrated drawing session into a single timed video.
//!
//! The crate is a library-level pipeline driven by an embedding UI shell:
//!
//! - Capture timestamped raster snapshots into a [`FrameStore`] while an [`AudioRecorder`]
//!   records narration
//! - Derive per-frame presentation intervals with [`Timeline`]
//! - Assemble frames and narration into one video with the [`Compositor`], streaming into a
//!   [`VideoWriter`] such as [`FfmpegWriter`]
//! - Sequence all of it, with retry and cancellation, through the [`PipelineController`]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod foundation;

pub(crate) mod audio;
pub(crate) mod compose;
pub(crate) mod config;
pub(crate) mod encode;
pub(crate) mod pipeline;
pub(crate) mod session;
pub(crate) mod store;
pub(crate) mod timeline;

pub use crate::foundation::core::{Canvas, Fps, FrameIndex};
pub use crate::foundation::error::{ErrorKind, SketchError, SketchResult};

pub use crate::audio::recorder::{AudioRecorder, WavFeed, WavRecorder};
pub use crate::audio::track::AudioTrack;
pub use crate::compose::compositor::{
    CancelToken, CompositionRequest, CompositionResult, Compositor, CompositorOpts, RunOutcome,
    RunReport,
};
pub use crate::compose::pool::{
    BufferPool, BufferPoolOpts, PixelBuffer, PixelFormat, PoolStats, PooledBuffer,
};
pub use crate::compose::raster::{OutputGeometry, rasterize_into};
pub use crate::config::PipelineOpts;
pub use crate::encode::ffmpeg::{FfmpegWriter, FfmpegWriterOpts, is_ffmpeg_on_path};
pub use crate::encode::writer::{
    InMemoryWriter, VideoWriter, WriterConfig, WriterFactory, WriterLog,
};
pub use crate::pipeline::controller::{
    CopyToDirectory, KeepInPlace, PipelineController, PipelineEvent, VideoSaver,
};
pub use crate::pipeline::progress::{ProgressEstimator, ProgressOpts};
pub use crate::pipeline::state::PipelineState;
pub use crate::session::{FRAME_EXTENSION, SessionPaths};
pub use crate::store::frame_store::{
    Frame, FrameEvent, FrameHandle, FrameReader, FrameStore, FrameStoreOpts,
};
pub use crate::timeline::{PresentationInterval, Timeline};
