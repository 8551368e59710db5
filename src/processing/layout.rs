use crate::model::CropWindow;

/// Pixel rectangle inside a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Convert a percentage crop window into pixel bounds of a `src_w`x`src_h`
/// image. The result always lies inside the image and is at least 1x1.
pub fn crop_bounds(src_w: u32, src_h: u32, crop: &CropWindow) -> PixelRect {
    let w = src_w.max(1);
    let h = src_h.max(1);

    let left = percent_of(w, crop.x).min(w - 1);
    let top = percent_of(h, crop.y).min(h - 1);
    let right = left.saturating_add(percent_of(w, crop.width)).min(w);
    let bottom = top.saturating_add(percent_of(h, crop.height)).min(h);

    PixelRect {
        left,
        top,
        width: right.saturating_sub(left).max(1),
        height: bottom.saturating_sub(top).max(1),
    }
}

fn percent_of(extent: u32, pct: f64) -> u32 {
    let px = (f64::from(extent) * pct / 100.0).floor();
    if px.is_finite() && px > 0.0 {
        px.min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

/// Largest size with the source's aspect ratio that fits in the canvas.
pub fn resize_to_contain(canvas_w: u32, canvas_h: u32, src_w: u32, src_h: u32) -> (u32, u32) {
    let iw = src_w.max(1) as f32;
    let ih = src_h.max(1) as f32;
    let cw = canvas_w.max(1) as f32;
    let ch = canvas_h.max(1) as f32;
    let scale = (cw / iw).min(ch / ih).max(0.0);
    let scale = if scale.is_finite() { scale } else { 1.0 };
    let w = (iw * scale).round().clamp(1.0, cw);
    let h = (ih * scale).round().clamp(1.0, ch);
    (w as u32, h as u32)
}

pub fn center_offset(inner_w: u32, inner_h: u32, outer_w: u32, outer_h: u32) -> (u32, u32) {
    let ox = outer_w.saturating_sub(inner_w) / 2;
    let oy = outer_h.saturating_sub(inner_h) / 2;
    (ox, oy)
}
