//! Writer sessions consuming rasterized frames in presentation order.

pub(crate) mod ffmpeg;
pub(crate) mod writer;
