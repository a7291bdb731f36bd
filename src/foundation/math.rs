/// `round(x * y / 255)` for 8-bit channel values widened to `u16`.
pub(crate) fn mul_div255_u16(x: u16, y: u16) -> u16 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u16
}

/// Composite a straight-alpha RGBA8 pixel over an opaque background and return opaque RGBA8.
pub(crate) fn blend_over_opaque(src: [u8; 4], bg: [u8; 4]) -> [u8; 4] {
    let a = u16::from(src[3]);
    if a == 255 {
        return [src[0], src[1], src[2], 255];
    }
    if a == 0 {
        return [bg[0], bg[1], bg[2], 255];
    }

    let inv = 255 - a;
    let mut out = [0u8, 0, 0, 255];
    for c in 0..3 {
        let v = mul_div255_u16(u16::from(src[c]), a) + mul_div255_u16(u16::from(bg[c]), inv);
        out[c] = v.min(255) as u8;
    }
    out
}

/// Round `v` down to a multiple of `align` (`align` must be non-zero).
pub(crate) fn align_down(v: u32, align: u32) -> u32 {
    v - v % align
}

/// Round `v` up to a multiple of `align` (`align` must be non-zero), saturating at `u32::MAX`.
pub(crate) fn align_up(v: u32, align: u32) -> u32 {
    match v % align {
        0 => v,
        r => v.saturating_add(align - r),
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/math.rs"]
mod tests;
