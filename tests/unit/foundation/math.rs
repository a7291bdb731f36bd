use super::*;

#[test]
fn mul_div255_rounds_to_nearest() {
    assert_eq!(mul_div255_u16(255, 255), 255);
    assert_eq!(mul_div255_u16(255, 0), 0);
    assert_eq!(mul_div255_u16(128, 255), 128);
    assert_eq!(mul_div255_u16(255, 128), 128);
}

#[test]
fn blend_transparent_returns_background() {
    assert_eq!(blend_over_opaque([9, 9, 9, 0], [10, 20, 30, 255]), [10, 20, 30, 255]);
}

#[test]
fn blend_opaque_is_identity() {
    assert_eq!(blend_over_opaque([1, 2, 3, 255], [10, 20, 30, 255]), [1, 2, 3, 255]);
}

#[test]
fn blend_half_alpha_mixes_channels() {
    let out = blend_over_opaque([255, 0, 0, 128], [0, 0, 0, 255]);
    assert_eq!(out, [128, 0, 0, 255]);
}

#[test]
fn alignment_helpers() {
    assert_eq!(align_down(1000, 16), 992);
    assert_eq!(align_up(1000, 16), 1008);
    assert_eq!(align_down(1024, 16), 1024);
    assert_eq!(align_up(1024, 16), 1024);
    assert_eq!(align_down(10, 16), 0);
    assert_eq!(align_up(u32::MAX, 16), u32::MAX);
}
