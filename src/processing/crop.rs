//! Default crop windows that center an image on the display's aspect ratio.

use crate::model::{CropWindow, Resolution};

/// Aspect ratios closer than this are treated as equal.
pub const ASPECT_TOLERANCE: f64 = 0.01;

/// Centered crop of a `width`x`height` image for a `"W,H"` display resolution.
///
/// Never fails: a malformed resolution or a zero-sized image yields the full
/// frame.
#[must_use]
pub fn smart_crop(width: u32, height: u32, resolution: &str) -> CropWindow {
    match Resolution::parse(resolution) {
        Some(target) => smart_crop_for(width, height, target),
        None => CropWindow::FULL_FRAME,
    }
}

#[must_use]
pub fn smart_crop_for(width: u32, height: u32, target: Resolution) -> CropWindow {
    if width == 0 || height == 0 || target.width == 0 || target.height == 0 {
        return CropWindow::FULL_FRAME;
    }
    let display_aspect = target.aspect();
    let image_aspect = f64::from(width) / f64::from(height);

    if (display_aspect - image_aspect).abs() < ASPECT_TOLERANCE {
        return CropWindow::FULL_FRAME;
    }

    let window = if image_aspect > display_aspect {
        // wider than the display: keep full height, trim the sides
        let crop_width = display_aspect / image_aspect * 100.0;
        CropWindow::new((100.0 - crop_width) / 2.0, 0.0, crop_width, 100.0)
    } else {
        let crop_height = image_aspect / display_aspect * 100.0;
        CropWindow::new(0.0, (100.0 - crop_height) / 2.0, 100.0, crop_height)
    };

    CropWindow::new(
        round2(window.x),
        round2(window.y),
        round2(window.width),
        round2(window.height),
    )
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
