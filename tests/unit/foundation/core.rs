use super::*;

#[test]
fn handle_none_is_reserved() {
    assert!(Handle::NONE.is_none());
    assert!(!Handle(7).is_none());
}

#[test]
fn fourcc_matches_drm_codes() {
    // DRM_FORMAT_ARGB8888 == fourcc_code('A', 'R', '2', '4')
    assert_eq!(FourCc::ARGB8888.0, 0x3432_5241);
    assert_eq!(FourCc::XRGB8888.0, 0x3432_5258);
    assert_eq!(FourCc::NV12.plane_count(), 2);
    assert_eq!(FourCc::ARGB8888.plane_count(), 1);
    assert!(FourCc::ARGB8888.has_alpha());
    assert!(!FourCc::XRGB8888.has_alpha());
}

#[test]
fn fourcc_debug_prints_ascii() {
    assert_eq!(format!("{:?}", FourCc::NV12), "FourCc(NV12)");
    assert_eq!(format!("{:?}", FourCc(1)), "FourCc(0x00000001)");
}

#[test]
fn texture_flags_compose() {
    let f = TextureFlags::FLIP_Y | TextureFlags::BLEND;
    assert!(f.contains(TextureFlags::FLIP_Y));
    assert!(f.contains(TextureFlags::BLEND));
    assert_eq!(TextureFlags::default(), TextureFlags::empty());
}

#[test]
fn content_type_serde_is_snake_case() {
    let s = serde_json::to_string(&ContentType::WebGl).unwrap();
    assert_eq!(s, "\"web_gl\"");
    let v: ContentType = serde_json::from_str("\"video\"").unwrap();
    assert_eq!(v, ContentType::Video);
}
