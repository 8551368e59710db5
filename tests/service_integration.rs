use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use epaper_frame::events::UploadFile;
use epaper_frame::model::{CropWindow, FitMode, Image, ImageUpdate, OrderMode, Resolution, Settings};
use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender, unbounded};
use epaper_frame::platform::display_sink::{DevSink, DisplaySink};
use epaper_frame::storage::FsImageStore;
use epaper_frame::store::Store;
use epaper_frame::tasks::upload::TaskStatus;
use epaper_frame::{Error, FrameOptions, PhotoFrame};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tempfile::{TempDir, tempdir};

const WAIT: Duration = Duration::from_secs(10);

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn start() -> (TempDir, PhotoFrame) {
    start_with(Arc::new(DevSink::new(Resolution::new(800, 480))))
}

fn start_with(sink: Arc<dyn DisplaySink>) -> (TempDir, PhotoFrame) {
    let dir = tempdir().unwrap();
    let store = Store::open(&dir.path().join("frame.db")).unwrap();
    let options = FrameOptions {
        output_path: dir.path().join("static").join("current.jpg"),
        shutdown_timeout: Duration::from_secs(5),
        defaults: Settings {
            image_root: dir.path().join("uploads"),
            thumb_root: dir.path().join("thumbs"),
            ..Settings::default()
        },
        run_slideshow: false,
        ..FrameOptions::default()
    };
    let frame = PhotoFrame::start(
        Arc::new(store),
        Arc::new(FsImageStore),
        sink,
        options,
    )
    .unwrap();
    (dir, frame)
}

fn upload(frame: &PhotoFrame, files: &[(&str, u32, u32)]) -> Vec<Image> {
    let files = files
        .iter()
        .map(|(name, w, h)| UploadFile {
            filename: name.to_string(),
            bytes: png(*w, *h),
        })
        .collect();
    upload_files(frame, files)
}

fn upload_files(frame: &PhotoFrame, files: Vec<UploadFile>) -> Vec<Image> {
    let task_id = frame
        .trigger_upload(files, String::new(), "from the test".into())
        .unwrap();
    let deadline = Instant::now() + WAIT;
    loop {
        let status = frame.upload_status(&task_id).unwrap();
        if status.status.is_terminal() {
            assert_eq!(status.status, TaskStatus::Completed, "{status:?}");
            return status
                .image_ids
                .iter()
                .map(|id| frame.image(*id).unwrap())
                .collect();
        }
        assert!(Instant::now() < deadline, "upload never finished");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn start_seeds_settings_and_directories() {
    let (dir, frame) = start();
    let settings = frame.settings().unwrap();
    assert_eq!(settings.resolution, "800,480");
    assert!(dir.path().join("uploads").is_dir());
    assert!(dir.path().join("thumbs").is_dir());
    assert_eq!(frame.display_resolution(), Resolution::new(800, 480));
    frame.shutdown();
    frame.shutdown();
}

#[test]
fn show_now_renders_and_records_display() {
    let (dir, frame) = start();
    let image = upload(&frame, &[("tall.png", 300, 400)]).remove(0);
    assert_eq!(image.description, "from the test");

    assert!(frame.show_now(image.id).unwrap());
    let deadline = Instant::now() + WAIT;
    while frame.image(image.id).unwrap().times_shown == 0 {
        assert!(Instant::now() < deadline, "frame never displayed");
        thread::sleep(Duration::from_millis(10));
    }
    let rendered = image::open(dir.path().join("static").join("current.jpg")).unwrap();
    assert_eq!((rendered.width(), rendered.height()), (800, 480));

    let status = frame.status().unwrap();
    assert_eq!(status.images, 1);
    assert!(status.current_frame_present);
    assert_eq!(status.dropped_frames, 0);

    assert!(matches!(frame.show_now(9_999), Err(Error::NotFound(9_999))));
    frame.shutdown();
}

#[test]
fn image_edits_go_through_validation() {
    let (_dir, frame) = start();
    let image = upload(&frame, &[("a.png", 64, 48)]).remove(0);

    let edited = frame
        .update_image(
            image.id,
            &ImageUpdate {
                title: Some("Renamed".into()),
                ..ImageUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(edited.title, "Renamed");

    assert!(matches!(
        frame.set_crop(image.id, CropWindow::new(0.0, 0.0, 0.0, 10.0), FitMode::CropFill),
        Err(Error::InvalidCrop(_))
    ));
    let cropped = frame
        .set_crop(image.id, CropWindow::new(10.0, 10.0, 50.0, 50.0), FitMode::Letterbox)
        .unwrap();
    assert_eq!(cropped.fit, FitMode::Letterbox);

    assert!(!frame.toggle_image(image.id).unwrap());
    assert_eq!(frame.status().unwrap().enabled_images, 0);
    frame.shutdown();
}

#[test]
fn delete_removes_files_and_record() {
    let (_dir, frame) = start();
    let image = upload(&frame, &[("a.png", 64, 48)]).remove(0);
    let settings = frame.settings().unwrap();
    let original = settings.image_path(&image.filename);
    let thumb = settings.thumb_path(&image.filename);
    assert!(original.is_file() && thumb.is_file());

    frame.delete_image(image.id).unwrap();
    assert!(!original.exists());
    assert!(!thumb.exists());
    assert!(matches!(frame.image(image.id), Err(Error::NotFound(_))));
    assert!(matches!(frame.delete_image(image.id), Err(Error::NotFound(_))));
    frame.shutdown();
}

#[test]
fn settings_updates_are_normalized_and_validated() {
    let (dir, frame) = start();
    let mut next = frame.settings().unwrap();
    next.resolution = " 1600,1200 ".into();
    next.order_mode = OrderMode::Random;
    next.image_root = dir.path().join("elsewhere");
    let stored = frame.update_settings(next).unwrap();
    assert_eq!(stored.resolution, "1600,1200");
    assert_eq!(stored.order_mode, OrderMode::Random);
    assert!(dir.path().join("elsewhere").is_dir());

    let mut bad = stored.clone();
    bad.resolution = "tall".into();
    assert!(matches!(frame.update_settings(bad), Err(Error::InvalidSettings(_))));
    let mut bad = stored;
    bad.interval_ms = 0;
    assert!(matches!(frame.update_settings(bad), Err(Error::InvalidSettings(_))));
    frame.shutdown();
}

#[test]
fn recalculation_follows_the_resolution_setting() {
    let (_dir, frame) = start();
    let image = upload(&frame, &[("a.png", 800, 480)]).remove(0);
    assert!(image.crop.is_full_frame());
    assert_eq!(frame.recalculate_crops().unwrap(), 0);

    let mut settings = frame.settings().unwrap();
    settings.resolution = "480,800".into();
    frame.update_settings(settings).unwrap();
    assert_eq!(frame.recalculate_crops().unwrap(), 1);
    let crop = frame.image(image.id).unwrap().crop;
    assert!((crop.width - 36.0).abs() < 0.01, "{crop:?}");
    assert_eq!(crop.height, 100.0);
    frame.shutdown();
}

#[test]
fn empty_uploads_are_rejected() {
    let (_dir, frame) = start();
    assert!(matches!(
        frame.trigger_upload(Vec::new(), String::new(), String::new()),
        Err(Error::EmptyUpload)
    ));
    assert!(matches!(frame.upload_status("nope"), Err(Error::UnknownTask(_))));
    frame.shutdown();
}

/// Reports the centre pixel of every frame it is handed, then blocks until
/// the gate opens.
struct PixelSink {
    shown: Sender<[u8; 3]>,
    gate: Receiver<()>,
}

impl DisplaySink for PixelSink {
    fn show_image(&self, path: &Path, _saturation: f32) -> anyhow::Result<()> {
        let frame = image::ImageReader::open(path)?
            .with_guessed_format()?
            .decode()?
            .to_rgb8();
        let Rgb(pixel) = *frame.get_pixel(frame.width() / 2, frame.height() / 2);
        let _ = self.shown.send(pixel);
        self.gate
            .recv_timeout(WAIT)
            .map_err(|_| anyhow!("gate never opened"))
    }

    fn resolution(&self) -> Resolution {
        Resolution::new(800, 480)
    }
}

fn strongest_channel(pixel: [u8; 3]) -> usize {
    (0..3).max_by_key(|&i| pixel[i]).unwrap()
}

#[test]
fn queued_requests_show_their_own_image() {
    let (shown_tx, shown) = unbounded();
    let (open_gate, gate) = unbounded();
    let (dir, frame) = start_with(Arc::new(PixelSink {
        shown: shown_tx,
        gate,
    }));
    let colors = [("red.png", [255, 0, 0]), ("green.png", [0, 255, 0]), ("blue.png", [0, 0, 255])];
    let files = colors
        .iter()
        .map(|(name, rgb)| UploadFile {
            filename: name.to_string(),
            bytes: solid_png(16, 16, *rgb),
        })
        .collect();
    let images = upload_files(&frame, files);
    assert_eq!(images.len(), 3);

    assert!(frame.show_now(images[0].id).unwrap());
    // the display is now busy with red
    assert_eq!(strongest_channel(shown.recv_timeout(WAIT).unwrap()), 0);
    assert!(frame.show_now(images[1].id).unwrap());
    assert!(frame.show_now(images[2].id).unwrap());
    for _ in 0..3 {
        open_gate.send(()).unwrap();
    }
    assert_eq!(strongest_channel(shown.recv_timeout(WAIT).unwrap()), 1, "green request");
    assert_eq!(strongest_channel(shown.recv_timeout(WAIT).unwrap()), 2, "blue request");

    let deadline = Instant::now() + WAIT;
    while frame.image(images[2].id).unwrap().times_shown == 0 {
        assert!(Instant::now() < deadline, "blue never recorded");
        thread::sleep(Duration::from_millis(10));
    }
    for image in &images {
        assert_eq!(frame.image(image.id).unwrap().times_shown, 1, "{}", image.filename);
    }
    frame.shutdown();

    // staged frames were all moved into place
    let leftovers: Vec<String> = std::fs::read_dir(dir.path().join("static"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["current.jpg".to_string()]);
}

#[test]
fn partial_settings_changes_merge_with_the_stored_row() {
    let (_dir, frame) = start();
    frame.modify_settings(|s| s.order_mode = OrderMode::Custom).unwrap();
    let stored = frame.modify_settings(|s| s.interval_ms = 30_000).unwrap();
    assert_eq!(stored.order_mode, OrderMode::Custom);
    assert_eq!(stored.interval_ms, 30_000);

    assert!(matches!(
        frame.modify_settings(|s| s.resolution = "wide".into()),
        Err(Error::InvalidSettings(_))
    ));
    assert_eq!(frame.settings().unwrap(), stored);
    frame.shutdown();
}
