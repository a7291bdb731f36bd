use crate::compose::pool::PixelBuffer;
use crate::foundation::core::Canvas;
use crate::foundation::error::{SketchError, SketchResult};
use crate::foundation::math::{align_down, align_up, blend_over_opaque};
use std::borrow::Cow;

/// Output raster size and the region frames are drawn into.
///
/// `canvas` satisfies the encoder's alignment; `content` is the source size rounded down to the
/// same alignment and anchored at the origin. Pixels outside `content` show the background.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputGeometry {
    /// Encoder-facing buffer size.
    pub canvas: Canvas,
    /// Draw region inside `canvas`.
    pub content: Canvas,
}

impl OutputGeometry {
    /// Derive the geometry from the first frame's dimensions.
    pub fn for_source(source: Canvas, alignment: u32) -> SketchResult<Self> {
        if alignment == 0 {
            return Err(SketchError::validation("alignment must be > 0"));
        }
        if source.is_empty() {
            return Err(SketchError::validation("source frame must be non-empty"));
        }

        let canvas = Canvas {
            width: align_up(source.width, alignment),
            height: align_up(source.height, alignment),
        };
        let content = Canvas {
            width: non_zero_or(align_down(source.width, alignment), source.width),
            height: non_zero_or(align_down(source.height, alignment), source.height),
        };
        Ok(Self { canvas, content })
    }

    /// Return `true` when the source already satisfied the alignment.
    pub fn is_aligned(&self) -> bool {
        self.canvas == self.content
    }
}

fn non_zero_or(v: u32, fallback: u32) -> u32 {
    if v == 0 { fallback } else { v }
}

/// Fill `dst` with `bg_rgba` and draw `src` at the origin, fitted into the content region.
///
/// The source keeps its aspect ratio and is never upscaled. Alpha is composited over the
/// background so the result is opaque RGBA8.
pub fn rasterize_into(
    dst: &mut PixelBuffer,
    src: &image::RgbaImage,
    geom: &OutputGeometry,
    bg_rgba: [u8; 4],
) -> SketchResult<()> {
    if dst.width != geom.canvas.width || dst.height != geom.canvas.height {
        return Err(SketchError::encoder_write(format!(
            "pixel buffer is {}x{}, expected {}x{}",
            dst.width, dst.height, geom.canvas.width, geom.canvas.height
        )));
    }
    if src.width() == 0 || src.height() == 0 {
        return Err(SketchError::encoder_write("cannot draw an empty frame"));
    }

    let bg = [bg_rgba[0], bg_rgba[1], bg_rgba[2], 255];
    dst.fill(bg);

    let (w, h) = fitted_size(src.width(), src.height(), geom.content);
    let img: Cow<'_, image::RgbaImage> = if (w, h) == src.dimensions() {
        Cow::Borrowed(src)
    } else {
        Cow::Owned(image::imageops::resize(
            src,
            w,
            h,
            image::imageops::FilterType::Triangle,
        ))
    };

    let stride = dst.stride();
    for (y, row) in img.rows().enumerate() {
        let off = y * stride;
        let out = &mut dst.data[off..off + w as usize * 4];
        for (d, px) in out.chunks_exact_mut(4).zip(row) {
            d.copy_from_slice(&blend_over_opaque(px.0, bg));
        }
    }
    Ok(())
}

fn fitted_size(src_w: u32, src_h: u32, content: Canvas) -> (u32, u32) {
    if src_w <= content.width && src_h <= content.height {
        return (src_w, src_h);
    }
    let scale = (f64::from(content.width) / f64::from(src_w))
        .min(f64::from(content.height) / f64::from(src_h));
    let w = ((f64::from(src_w) * scale).round() as u32).clamp(1, content.width);
    let h = ((f64::from(src_h) * scale).round() as u32).clamp(1, content.height);
    (w, h)
}

#[cfg(test)]
#[path = "../../tests/unit/compose/raster.rs"]
mod tests;
