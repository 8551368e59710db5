//! Frame rendering: map a source photo onto the fixed display resolution.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, anyhow};
use fast_image_resize as fir;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage, RgbaImage, imageops};
use tracing::debug;

use crate::error::{Error, Result};
use crate::meta;
use crate::model::{CropWindow, FitMode, Image, Resolution, Settings};
use crate::processing::layout::{center_offset, crop_bounds, resize_to_contain};
use crate::storage::ImageStore;

/// JPEG quality of the frame handed to the display.
pub const FRAME_QUALITY: u8 = 90;
/// JPEG quality of upload thumbnails.
pub const THUMBNAIL_QUALITY: u8 = 85;

/// Render `source` to exactly `target` pixels.
pub fn render_frame(
    source: &DynamicImage,
    target: Resolution,
    crop: &CropWindow,
    fit: FitMode,
) -> Result<RgbImage> {
    let rgba = source.to_rgba8();
    let framed = match fit {
        FitMode::Letterbox => letterbox(&rgba, target),
        FitMode::CropFill => crop_and_fill(&rgba, target, crop),
    };
    framed.map_err(Error::Render)
}

/// Scale to fit inside the frame and pad the rest with black.
fn letterbox(source: &RgbaImage, target: Resolution) -> anyhow::Result<RgbImage> {
    let (w, h) = resize_to_contain(target.width, target.height, source.width(), source.height());
    let scaled = DynamicImage::ImageRgba8(resize_rgba(source, w, h)?).to_rgb8();
    let mut canvas = RgbImage::from_pixel(target.width, target.height, Rgb([0, 0, 0]));
    let (ox, oy) = center_offset(w, h, target.width, target.height);
    imageops::replace(&mut canvas, &scaled, i64::from(ox), i64::from(oy));
    Ok(canvas)
}

/// Cut the crop window out and stretch it over the whole frame.
fn crop_and_fill(
    source: &RgbaImage,
    target: Resolution,
    crop: &CropWindow,
) -> anyhow::Result<RgbImage> {
    let rect = crop_bounds(source.width(), source.height(), crop);
    debug!(?rect, "crop-and-fill bounds");
    let region = imageops::crop_imm(source, rect.left, rect.top, rect.width, rect.height).to_image();
    let filled = resize_rgba(&region, target.width, target.height)?;
    Ok(DynamicImage::ImageRgba8(filled).to_rgb8())
}

fn resize_rgba(source: &RgbaImage, target_w: u32, target_h: u32) -> anyhow::Result<RgbaImage> {
    if target_w == 0 || target_h == 0 {
        anyhow::bail!("resize dimensions must be positive");
    }
    if source.width() == target_w && source.height() == target_h {
        return Ok(source.clone());
    }

    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .context("failed to create source view for frame resize")?;
    let mut dst_image = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3));
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .context("frame resize failed")?;
    let buffer = dst_image.into_vec();
    RgbaImage::from_raw(target_w, target_h, buffer)
        .ok_or_else(|| anyhow!("failed to construct resized RGBA image"))
}

/// Downscale so the longest side is at most `max_side`. Never upscales.
pub fn thumbnail(source: &DynamicImage, max_side: u32) -> Result<RgbImage> {
    let (w, h) = (source.width(), source.height());
    let longest = w.max(h);
    let rgba = source.to_rgba8();
    if longest <= max_side {
        return Ok(DynamicImage::ImageRgba8(rgba).to_rgb8());
    }
    let (tw, th) = resize_to_contain(max_side, max_side, w, h);
    let scaled = resize_rgba(&rgba, tw, th).map_err(Error::Render)?;
    Ok(DynamicImage::ImageRgba8(scaled).to_rgb8())
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(out.into_inner())
}

/// Write `image` as a JPEG, replacing `path` atomically.
///
/// Parent directories are created as needed.
pub fn write_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    let bytes = encode_jpeg(image, quality)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    if let Err(err) = fs::write(&tmp, &bytes).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Load an image's original through `files` and render it to `output_path`.
pub fn render_image(
    settings: &Settings,
    image: &Image,
    files: &dyn ImageStore,
    output_path: &Path,
) -> Result<()> {
    let source_path = settings.image_path(&image.filename);
    let bytes = files.read(&source_path)?;
    let source = meta::decode_oriented(&bytes)?;
    let target = settings.resolution();
    let frame = render_frame(&source, target, &image.crop, image.fit)?;
    write_jpeg(&frame, output_path, FRAME_QUALITY)?;
    debug!(
        image_id = image.id,
        source = %source_path.display(),
        output = %output_path.display(),
        %target,
        "rendered frame"
    );
    Ok(())
}
