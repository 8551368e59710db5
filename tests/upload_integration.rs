use std::io::{self, Cursor};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use epaper_frame::Error;
use epaper_frame::events::{UploadFile, UploadJob};
use epaper_frame::model::{CropWindow, Settings};
use epaper_frame::storage::{FsImageStore, ImageStore, list_files};
use epaper_frame::store::Store;
use epaper_frame::tasks::upload::{self, Ingest, TaskStatus, UploadTasks, WatchdogLimits};
use image::{DynamicImage, ImageFormat};
use tempfile::{TempDir, tempdir};

type WriteFilter = Box<dyn Fn(&Path) -> bool + Send + Sync>;

/// Filesystem store that refuses writes matching a predicate.
struct FlakyStore {
    inner: FsImageStore,
    fail_write: WriteFilter,
}

impl ImageStore for FlakyStore {
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if (self.fail_write)(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "disk refused write"));
        }
        self.inner.write(path, bytes)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        self.inner.delete(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn file(name: &str, bytes: Vec<u8>) -> UploadFile {
    UploadFile {
        filename: name.to_string(),
        bytes,
    }
}

struct Fixture {
    _dir: TempDir,
    settings: Settings,
    ingest: Ingest,
}

fn fixture(files: Arc<dyn ImageStore>) -> Fixture {
    let dir = tempdir().unwrap();
    let settings = Settings {
        image_root: dir.path().join("uploads"),
        thumb_root: dir.path().join("thumbs"),
        ..Settings::default()
    };
    let store = Store::open(&dir.path().join("frame.db")).unwrap();
    store.ensure_settings(&settings).unwrap();
    let ingest = Ingest {
        store: Arc::new(store),
        files,
        tasks: UploadTasks::new(WatchdogLimits::default()),
        thumbnail_max_side: 480,
    };
    Fixture {
        _dir: dir,
        settings,
        ingest,
    }
}

fn run_batch(fx: &Fixture, files: Vec<UploadFile>, title: &str) -> String {
    let task_id = fx.ingest.tasks.create(files.len());
    fx.ingest.process(UploadJob {
        task_id: task_id.clone(),
        files,
        title: title.to_string(),
        description: String::new(),
    });
    task_id
}

fn stem_is(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(prefix))
}

#[test]
fn one_failing_file_does_not_fail_the_batch() {
    let fx = fixture(Arc::new(FlakyStore {
        inner: FsImageStore,
        fail_write: Box::new(|p| stem_is(p, "file3-")),
    }));
    let files = (1..=5).map(|i| file(&format!("file{i}.png"), png(64, 48))).collect();
    let task_id = run_batch(&fx, files, "");

    let status = fx.ingest.tasks.poll(&task_id).unwrap();
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.total, 5);
    assert_eq!(status.uploaded, 4);
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].starts_with("file3.png: "), "{:?}", status.errors);
    assert!(status.current_file.is_none());
    assert_eq!(status.image_ids.len(), 4);

    assert_eq!(fx.ingest.store.count_images().unwrap(), 4);
    assert_eq!(list_files(&fx.settings.image_root).len(), 4);
    assert_eq!(list_files(&fx.settings.thumb_root).len(), 4);
}

#[test]
fn a_batch_where_every_file_fails_is_an_error() {
    let fx = fixture(Arc::new(FsImageStore));
    let files = vec![
        file("a.jpg", b"not an image".to_vec()),
        file("b.jpg", Vec::from(&b"\xff\xd8 truncated"[..])),
    ];
    let task_id = run_batch(&fx, files, "");

    let status = fx.ingest.tasks.poll(&task_id).unwrap();
    assert_eq!(status.status, TaskStatus::Error);
    assert_eq!(status.uploaded, 0);
    assert_eq!(status.errors.len(), 2);
    assert!(status.message.is_some());
    assert!(list_files(&fx.settings.image_root).is_empty());
}

#[test]
fn files_written_before_a_failure_are_removed() {
    let fx = fixture(Arc::new(FlakyStore {
        inner: FsImageStore,
        fail_write: Box::new(|p| p.components().any(|c| c.as_os_str() == "thumbs")),
    }));
    let task_id = run_batch(&fx, vec![file("photo.png", png(40, 30))], "");

    let status = fx.ingest.tasks.poll(&task_id).unwrap();
    assert_eq!(status.status, TaskStatus::Error);
    assert!(status.errors[0].starts_with("photo.png: "));
    assert!(list_files(&fx.settings.image_root).is_empty(), "original left behind");
    assert_eq!(fx.ingest.store.count_images().unwrap(), 0);
}

#[test]
fn ingest_stores_thumbnail_crop_and_titles() {
    let fx = fixture(Arc::new(FsImageStore));
    let task_id = run_batch(
        &fx,
        vec![file("Tall Photo.PNG", png(1200, 1600)), file("wide.png", png(800, 480))],
        "",
    );
    let status = fx.ingest.tasks.poll(&task_id).unwrap();
    assert_eq!(status.status, TaskStatus::Completed);

    let images = fx.ingest.store.list_images().unwrap();
    assert_eq!(images.len(), 2);
    let tall = &images[0];
    assert_eq!(tall.title, "Tall Photo");
    assert_eq!(tall.original_name, "Tall Photo.PNG");
    assert!(tall.filename.starts_with("Tall_Photo-"), "{}", tall.filename);
    assert!(tall.filename.ends_with(".png"));
    assert_eq!((tall.width, tall.height), (1200, 1600));
    assert_eq!(tall.crop, CropWindow::new(0.0, 27.5, 100.0, 45.0));
    assert_eq!((tall.sort_order, images[1].sort_order), (1, 2));
    assert!(images[1].crop.is_full_frame());

    // thumbnails are always JPEG, whatever the original's extension
    let thumb = image::ImageReader::open(fx.settings.thumb_path(&tall.filename))
        .unwrap()
        .with_guessed_format()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!((thumb.width(), thumb.height()), (360, 480));
    assert!(fx.settings.image_path(&tall.filename).is_file());
}

#[test]
fn shared_title_applies_to_every_file() {
    let fx = fixture(Arc::new(FsImageStore));
    run_batch(
        &fx,
        vec![file("a.png", png(8, 8)), file("b.png", png(8, 8))],
        "  Holiday  ",
    );
    let titles: Vec<String> = fx
        .ingest
        .store
        .list_images()
        .unwrap()
        .into_iter()
        .map(|i| i.title)
        .collect();
    assert_eq!(titles, vec!["Holiday".to_string(), "Holiday".to_string()]);
}

#[test]
fn queued_batches_are_processed_in_the_background() {
    let fx = fixture(Arc::new(FsImageStore));
    let (queue, consumer) = upload::spawn(fx.ingest.clone()).unwrap();

    assert!(matches!(
        queue.submit(Vec::new(), String::new(), String::new()),
        Err(Error::EmptyUpload)
    ));

    let task_id = queue
        .submit(vec![file("a.png", png(16, 16))], String::new(), String::new())
        .unwrap();
    assert_eq!(task_id.len(), 16);

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        let status = queue.tasks().poll(&task_id).unwrap();
        if status.status.is_terminal() {
            break status;
        }
        assert!(Instant::now() < deadline, "upload never finished");
        thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.uploaded, 1);
    assert!(consumer.shutdown(Duration::from_secs(5)));
}
