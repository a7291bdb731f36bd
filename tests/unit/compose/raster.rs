use super::*;
use crate::compose::pool::PixelFormat;

fn buffer(canvas: Canvas) -> PixelBuffer {
    PixelBuffer {
        width: canvas.width,
        height: canvas.height,
        format: PixelFormat::Rgba8,
        data: vec![7u8; canvas.byte_len()],
    }
}

fn px(b: &PixelBuffer, x: u32, y: u32) -> [u8; 4] {
    let i = y as usize * b.stride() + x as usize * 4;
    [b.data[i], b.data[i + 1], b.data[i + 2], b.data[i + 3]]
}

#[test]
fn aligned_source_keeps_its_size() {
    let g = OutputGeometry::for_source(
        Canvas {
            width: 1024,
            height: 768,
        },
        16,
    )
    .unwrap();
    assert!(g.is_aligned());
    assert_eq!(
        g.canvas,
        Canvas {
            width: 1024,
            height: 768
        }
    );
}

#[test]
fn misaligned_source_pads_canvas_and_shrinks_content() {
    let g = OutputGeometry::for_source(
        Canvas {
            width: 1000,
            height: 750,
        },
        16,
    )
    .unwrap();
    assert_eq!(
        g.canvas,
        Canvas {
            width: 1008,
            height: 752
        }
    );
    assert_eq!(
        g.content,
        Canvas {
            width: 992,
            height: 736
        }
    );
}

#[test]
fn tiny_source_falls_back_to_native_content() {
    let g = OutputGeometry::for_source(
        Canvas {
            width: 10,
            height: 20,
        },
        16,
    )
    .unwrap();
    assert_eq!(
        g.canvas,
        Canvas {
            width: 16,
            height: 32
        }
    );
    assert_eq!(
        g.content,
        Canvas {
            width: 10,
            height: 16
        }
    );
}

#[test]
fn draws_at_origin_and_fills_remainder_with_background() {
    let src_canvas = Canvas {
        width: 20,
        height: 16,
    };
    let g = OutputGeometry::for_source(src_canvas, 16).unwrap();
    let mut dst = buffer(g.canvas);
    let src = image::RgbaImage::from_pixel(20, 16, image::Rgba([255, 255, 255, 255]));
    rasterize_into(&mut dst, &src, &g, [0, 0, 0, 255]).unwrap();

    assert_eq!(g.canvas.width, 32);
    // Content is 16x16: the 20x16 source is scaled down to 16x13 (aspect kept).
    assert_eq!(px(&dst, 0, 0), [255, 255, 255, 255]);
    assert_eq!(px(&dst, 15, 12), [255, 255, 255, 255]);
    assert_eq!(px(&dst, 16, 0), [0, 0, 0, 255]);
    assert_eq!(px(&dst, 31, 15), [0, 0, 0, 255]);
    assert_eq!(px(&dst, 0, 14), [0, 0, 0, 255]);
}

#[test]
fn translucent_source_is_flattened_over_background() {
    let g = OutputGeometry::for_source(
        Canvas {
            width: 16,
            height: 16,
        },
        16,
    )
    .unwrap();
    let mut dst = buffer(g.canvas);
    let src = image::RgbaImage::from_pixel(16, 16, image::Rgba([255, 0, 0, 128]));
    rasterize_into(&mut dst, &src, &g, [0, 0, 255, 255]).unwrap();
    assert_eq!(px(&dst, 3, 3), [128, 0, 127, 255]);
}

#[test]
fn smaller_later_frames_are_not_upscaled() {
    let g = OutputGeometry::for_source(
        Canvas {
            width: 32,
            height: 32,
        },
        16,
    )
    .unwrap();
    let mut dst = buffer(g.canvas);
    let src = image::RgbaImage::from_pixel(8, 8, image::Rgba([9, 9, 9, 255]));
    rasterize_into(&mut dst, &src, &g, [0, 0, 0, 255]).unwrap();
    assert_eq!(px(&dst, 7, 7), [9, 9, 9, 255]);
    assert_eq!(px(&dst, 8, 8), [0, 0, 0, 255]);
}

#[test]
fn mismatched_buffer_is_rejected() {
    let g = OutputGeometry::for_source(
        Canvas {
            width: 16,
            height: 16,
        },
        16,
    )
    .unwrap();
    let mut dst = buffer(Canvas {
        width: 8,
        height: 8,
    });
    let src = image::RgbaImage::new(16, 16);
    assert!(rasterize_into(&mut dst, &src, &g, [0, 0, 0, 255]).is_err());
}
