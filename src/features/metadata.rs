//! Image decoding and EXIF metadata extraction.

use image::DynamicImage;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::Error;

/// The EXIF subset the engine persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifSubset {
    pub capture_time: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub orientation: u16,
}

/// Decode an image and bound its longest side to `max_dimension`. Returns
/// the (possibly downscaled) image plus the native dimensions before
/// scaling.
pub fn decode_bounded(path: &Path, max_dimension: u32) -> crate::error::Result<(DynamicImage, u32, u32)> {
    let img = image::ImageReader::open(path)
        .map_err(Error::TransientIo)?
        .decode()
        .map_err(|e| Error::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    let (native_w, native_h) = (img.width(), img.height());
    let img = if native_w > max_dimension || native_h > max_dimension {
        img.thumbnail(max_dimension, max_dimension)
    } else {
        img
    };
    Ok((img, native_w, native_h))
}

/// Bake the EXIF orientation into the pixels so rotated shots of the same
/// scene hash alike.
pub fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Orientations 5 through 8 transpose the image.
pub fn orientation_swaps_axes(orientation: u16) -> bool {
    (5..=8).contains(&orientation)
}

/// Read the EXIF subset. Absent or unparsable EXIF is not an error; every
/// field is optional and orientation falls back to 1.
pub fn read_exif(path: &Path) -> ExifSubset {
    let mut subset = ExifSubset {
        orientation: 1,
        ..Default::default()
    };

    let Ok(file) = File::open(path) else {
        return subset;
    };
    let mut reader = BufReader::new(file);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut reader) else {
        return subset;
    };

    if let Some(field) = exif.get_field(exif::Tag::Make, exif::In::PRIMARY) {
        subset.camera_make = Some(display_string(field));
    }
    if let Some(field) = exif.get_field(exif::Tag::Model, exif::In::PRIMARY) {
        subset.camera_model = Some(display_string(field));
    }
    if let Some(field) = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) {
        if let exif::Value::Short(ref v) = field.value {
            if let Some(&o) = v.first() {
                if (1..=8).contains(&o) {
                    subset.orientation = o;
                }
            }
        }
    }

    let datetime = exif
        .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
        .or_else(|| exif.get_field(exif::Tag::DateTime, exif::In::PRIMARY))
        .map(display_string);
    let subsec = exif
        .get_field(exif::Tag::SubSecTimeOriginal, exif::In::PRIMARY)
        .map(display_string);
    if let Some(datetime) = datetime {
        subset.capture_time = parse_exif_datetime(&datetime, subsec.as_deref());
    }

    subset
}

fn display_string(field: &exif::Field) -> String {
    field
        .display_value()
        .to_string()
        .trim_matches('"')
        .trim()
        .to_string()
}

/// Parse the EXIF "YYYY:MM:DD HH:MM:SS" form, with an optional sub-second
/// fraction field, into epoch seconds.
pub fn parse_exif_datetime(datetime: &str, subsec: Option<&str>) -> Option<f64> {
    let parsed =
        chrono::NaiveDateTime::parse_from_str(datetime.trim(), "%Y:%m:%d %H:%M:%S").ok()?;
    let mut timestamp = parsed.and_utc().timestamp() as f64;
    if let Some(subsec) = subsec {
        let digits = subsec.trim();
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(value) = digits.parse::<f64>() {
                timestamp += value / 10f64.powi(digits.len() as i32);
            }
        }
    }
    Some(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exif_datetime_with_subseconds() {
        let ts = parse_exif_datetime("2023:10:02 14:30:00", None).unwrap();
        assert_eq!(ts, 1696257000.0);

        let with_subsec = parse_exif_datetime("2023:10:02 14:30:00", Some("25")).unwrap();
        assert!((with_subsec - (ts + 0.25)).abs() < 1e-9);

        assert!(parse_exif_datetime("not a date", None).is_none());
    }

    #[test]
    fn orientation_rotations_swap_dimensions() {
        let img = DynamicImage::ImageLuma8(image::GrayImage::new(4, 2));
        let rotated = apply_orientation(img.clone(), 6);
        assert_eq!((rotated.width(), rotated.height()), (2, 4));

        let unchanged = apply_orientation(img, 1);
        assert_eq!((unchanged.width(), unchanged.height()), (4, 2));

        assert!(orientation_swaps_axes(5));
        assert!(orientation_swaps_axes(8));
        assert!(!orientation_swaps_axes(1));
        assert!(!orientation_swaps_axes(3));
    }

    #[test]
    fn decode_bounds_the_long_side() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        let img = image::RgbImage::from_pixel(800, 400, image::Rgb([10, 20, 30]));
        img.save(&path).unwrap();

        let (bounded, native_w, native_h) = decode_bounded(&path, 128).unwrap();
        assert_eq!((native_w, native_h), (800, 400));
        assert!(bounded.width() <= 128 && bounded.height() <= 128);
    }

    #[test]
    fn decode_failure_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let err = decode_bounded(&path, 128).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn exif_on_plain_png_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        image::RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let subset = read_exif(&path);
        assert_eq!(subset.orientation, 1);
        assert!(subset.capture_time.is_none());
        assert!(subset.camera_model.is_none());
    }
}
