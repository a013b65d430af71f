//! Per-file feature extraction: content hashes, perceptual hashes and the
//! EXIF subset, persisted in one transaction per file.

pub mod hashing;
pub mod metadata;

use std::path::Path;
use std::time::Duration;

use crate::config::Settings;
use crate::db::{Database, FeatureRow, FileRow};
use crate::error::{Error, Result};

/// Bounded retries for transient I/O inside a task; exhaustion downgrades
/// the file to unprocessable for the current run.
const IO_RETRIES: usize = 3;
const IO_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Images smaller than this on either side are icons or thumbnails, not
/// photos; they are recorded but never grouped.
const MIN_IMAGE_DIMENSION: u32 = 256;

const RAW_EXTENSIONS: &[&str] = &[
    "raw", "cr2", "cr3", "nef", "orf", "arw", "dng", "raf", "rw2", "pef", "srw",
];
const TIFF_EXTENSIONS: &[&str] = &["tif", "tiff"];

#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub processed: usize,
    pub unprocessable: usize,
    pub errors: Vec<String>,
}

pub struct FeatureExtractor {
    settings: Settings,
}

impl FeatureExtractor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn format_rejected(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        (self.settings.skip_raw_formats && RAW_EXTENSIONS.contains(&ext.as_str()))
            || (self.settings.skip_tiff_formats && TIFF_EXTENSIONS.contains(&ext.as_str()))
    }

    /// Run the full pipeline for one file and commit the feature row.
    ///
    /// Errors classify the failure: `Unprocessable`/`Decode` mean the file
    /// is skipped by grouping until its bytes change, `TransientIo` means
    /// retries were exhausted this run, anything else is fatal.
    pub fn process_file(&self, db: &mut Database, file: &FileRow) -> Result<()> {
        let path = Path::new(&file.path);

        if self.format_rejected(path) {
            return Err(Error::Unprocessable(path.to_path_buf()));
        }

        let fast_hash = with_io_retries(|| hashing::fast_hash(path))?;

        let (img, native_w, native_h) =
            metadata::decode_bounded(path, self.settings.max_decode_dimension)?;

        if native_w < MIN_IMAGE_DIMENSION || native_h < MIN_IMAGE_DIMENSION {
            return Err(Error::Unprocessable(path.to_path_buf()));
        }

        let exif = metadata::read_exif(path);
        let oriented = metadata::apply_orientation(img, exif.orientation);
        let hashes = hashing::perceptual_hashes(&oriented);

        let (width, height) = if metadata::orientation_swaps_axes(exif.orientation) {
            (native_h, native_w)
        } else {
            (native_w, native_h)
        };

        let feature = FeatureRow {
            file_id: file.id,
            phash: Some(hashes.phash),
            dhash: Some(hashes.dhash),
            ahash: Some(hashes.ahash),
            width: Some(width),
            height: Some(height),
            exif_dt: exif.capture_time,
            camera_make: exif.camera_make,
            camera_model: exif.camera_model,
            orientation: exif.orientation,
        };
        db.commit_extraction(&feature, fast_hash)?;
        Ok(())
    }

    /// Process a batch, recovering per-file failures by marking the row
    /// unprocessable. Only store errors propagate.
    pub fn process_batch(&self, db: &mut Database, files: &[FileRow]) -> Result<ExtractionOutcome> {
        let mut outcome = ExtractionOutcome::default();
        for file in files {
            match self.process_file(db, file) {
                Ok(()) => outcome.processed += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!(path = %file.path, error = %e, "file unprocessable");
                    db.mark_unprocessable(file.id)?;
                    outcome.unprocessable += 1;
                    outcome.errors.push(format!("{}: {e}", file.path));
                }
            }
        }
        Ok(outcome)
    }
}

fn with_io_retries<T>(mut op: impl FnMut() -> std::io::Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < IO_RETRIES => {
                attempt += 1;
                tracing::debug!(error = %e, attempt, "transient I/O error, retrying");
                std::thread::sleep(IO_RETRY_DELAY);
            }
            Err(e) => return Err(Error::TransientIo(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path, w: u32, h: u32, seed: u8) {
        let img = image::RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([seed, (x % 256) as u8, (y % 256) as u8])
        });
        img.save(path).unwrap();
    }

    fn scan_one(db: &Database, path: &Path) -> FileRow {
        let metadata = std::fs::metadata(path).unwrap();
        db.insert_file(&path.to_string_lossy(), metadata.len(), 1.0)
            .unwrap();
        db.file_by_path(&path.to_string_lossy()).unwrap().unwrap()
    }

    #[test]
    fn processes_a_real_image_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        write_png(&path, 512, 384, 7);

        let mut db = Database::open_in_memory().unwrap();
        let file = scan_one(&db, &path);

        let extractor = FeatureExtractor::new(Settings::default());
        extractor.process_file(&mut db, &file).unwrap();

        let row = db.file_by_id(file.id).unwrap().unwrap();
        assert!(row.fast_hash.is_some());
        assert!(!row.needs_features);

        let feature = db.feature_for(file.id).unwrap().unwrap();
        assert_eq!(feature.width, Some(512));
        assert_eq!(feature.height, Some(384));
        assert!(feature.phash.is_some());
        assert!(feature.dhash.is_some());
        assert!(feature.ahash.is_some());
    }

    #[test]
    fn identical_files_get_identical_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        write_png(&a, 512, 384, 3);
        std::fs::copy(&a, &b).unwrap();

        let mut db = Database::open_in_memory().unwrap();
        let fa = scan_one(&db, &a);
        let fb = scan_one(&db, &b);

        let extractor = FeatureExtractor::new(Settings::default());
        extractor.process_file(&mut db, &fa).unwrap();
        extractor.process_file(&mut db, &fb).unwrap();

        let ra = db.file_by_id(fa.id).unwrap().unwrap();
        let rb = db.file_by_id(fb.id).unwrap().unwrap();
        assert_eq!(ra.fast_hash, rb.fast_hash);

        let feat_a = db.feature_for(fa.id).unwrap().unwrap();
        let feat_b = db.feature_for(fb.id).unwrap().unwrap();
        assert_eq!(feat_a.phash, feat_b.phash);
        assert_eq!(feat_a.dhash, feat_b.dhash);
    }

    #[test]
    fn corrupt_file_becomes_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not image data").unwrap();

        let mut db = Database::open_in_memory().unwrap();
        let file = scan_one(&db, &path);

        let extractor = FeatureExtractor::new(Settings::default());
        let outcome = extractor
            .process_batch(&mut db, std::slice::from_ref(&file))
            .unwrap();
        assert_eq!(outcome.unprocessable, 1);
        assert_eq!(outcome.processed, 0);

        let row = db.file_by_id(file.id).unwrap().unwrap();
        assert!(row.unprocessable);
        assert!(!row.needs_features);
    }

    #[test]
    fn tiny_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icon.png");
        write_png(&path, 64, 64, 1);

        let mut db = Database::open_in_memory().unwrap();
        let file = scan_one(&db, &path);

        let extractor = FeatureExtractor::new(Settings::default());
        let err = extractor.process_file(&mut db, &file).unwrap_err();
        assert!(matches!(err, Error::Unprocessable(_)));
    }

    #[test]
    fn raw_formats_respect_the_skip_flag() {
        let mut settings = Settings::default();
        settings.skip_raw_formats = true;
        let extractor = FeatureExtractor::new(settings);
        assert!(extractor.format_rejected(Path::new("/p/shot.CR2")));
        assert!(extractor.format_rejected(Path::new("/p/shot.dng")));
        assert!(!extractor.format_rejected(Path::new("/p/shot.jpg")));

        let extractor = FeatureExtractor::new(Settings::default());
        assert!(!extractor.format_rejected(Path::new("/p/shot.cr2")));
    }
}
