//! Capture-time resolution.
//!
//! Every source photo is mapped to a [`CaptureInstant`] by one of three
//! strategies. EXIF and file-name timestamps carry no zone, so they are read
//! as wall-clock time in the configured zone; modification times are absolute
//! and converted into it. After resolution all instants share one zone, and
//! the canonical key depends on wall-clock fields only.

use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use jiff::Timestamp;
use jiff::Zoned;
use jiff::civil::DateTime;
use jiff::tz::TimeZone;
use serde::{Deserialize, Serialize};

/// strftime pattern of the canonical key: second resolution, fixed width.
pub const CANONICAL_KEY_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// EXIF stores `YYYY:MM:DD HH:MM:SS`.
const EXIF_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Where a photo's capture instant is read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// Embedded EXIF capture time.
    #[default]
    Exif,
    /// The file stem, parsed with the configured pattern.
    Filename,
    /// The filesystem's last-modified time.
    Filemod,
}

impl fmt::Display for TimestampSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exif => "exif",
            Self::Filename => "filename",
            Self::Filemod => "filemod",
        })
    }
}

/// No usable timestamp could be read for a file.
#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    #[error("no EXIF capture time in {}", .0.display())]
    NoExifTime(PathBuf),

    #[error("cannot read EXIF from {}: {source}", path.display())]
    Exif { path: PathBuf, source: exif::Error },

    #[error("file name {stem:?} does not match {format:?}: {source}")]
    FilenameMismatch {
        stem: String,
        format: String,
        source: jiff::Error,
    },

    #[error("timestamp {value:?} in {} is invalid: {source}", path.display())]
    Invalid {
        path: PathBuf,
        value: String,
        source: jiff::Error,
    },

    #[error("cannot read modification time of {}: {source}", path.display())]
    Modified { path: PathBuf, source: std::io::Error },

    #[error("cannot open {}: {source}", path.display())]
    Open { path: PathBuf, source: std::io::Error },
}

/// The resolved point in time a photo represents.
///
/// Ordered by absolute time. Two instants with the same canonical key are
/// the same timelapse frame.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaptureInstant(Zoned);

impl CaptureInstant {
    pub fn new(zoned: Zoned) -> Self {
        Self(zoned)
    }

    /// Second-resolution key used for staging file names and deduplication.
    pub fn canonical_key(&self) -> String {
        self.0.strftime(CANONICAL_KEY_FORMAT).to_string()
    }

    /// Format with an arbitrary strftime pattern, for overlay text.
    pub fn display(&self, format: &str) -> String {
        self.0.strftime(format).to_string()
    }

    /// `_YYYY-MM-DD`, the date suffix of the output video.
    pub fn date_suffix(&self) -> String {
        self.0.strftime("_%Y-%m-%d").to_string()
    }

    /// Recover an instant from a canonical key, e.g. a staged file stem.
    pub fn from_canonical_key(key: &str, zone: &TimeZone) -> Option<Self> {
        parse_canonical_key(key)?.to_zoned(zone.clone()).ok().map(Self)
    }
}

/// True if `key` is exactly a canonical key, e.g. `2024-03-01-142530`.
pub fn is_canonical_key(key: &str) -> bool {
    parse_canonical_key(key).is_some()
}

fn parse_canonical_key(key: &str) -> Option<DateTime> {
    let civil = DateTime::strptime(CANONICAL_KEY_FORMAT, key).ok()?;
    // Reject unpadded fields that strptime tolerates.
    (civil.strftime(CANONICAL_KEY_FORMAT).to_string() == key).then_some(civil)
}

impl fmt::Display for CaptureInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves capture instants with one configured strategy.
#[derive(Debug, Clone)]
pub struct Resolver {
    source: TimestampSource,
    filename_format: String,
    zone: TimeZone,
}

impl Resolver {
    pub fn new(source: TimestampSource, filename_format: impl Into<String>, zone: TimeZone) -> Self {
        Self {
            source,
            filename_format: filename_format.into(),
            zone,
        }
    }

    /// Resolve the capture instant of the file at `path`.
    pub fn resolve(&self, path: &Path) -> Result<CaptureInstant, TimestampError> {
        match self.source {
            TimestampSource::Exif => self.read_exif(path),
            TimestampSource::Filename => self.parse_filename(path),
            TimestampSource::Filemod => self.read_modified(path),
        }
    }

    fn read_exif(&self, path: &Path) -> Result<CaptureInstant, TimestampError> {
        let file = fs::File::open(path).map_err(|source| TimestampError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let data = match exif::Reader::new().read_from_container(&mut BufReader::new(file)) {
            Ok(data) => data,
            Err(exif::Error::NotFound(_)) => {
                return Err(TimestampError::NoExifTime(path.to_path_buf()));
            }
            Err(source) => {
                return Err(TimestampError::Exif {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let raw = [exif::Tag::DateTimeOriginal, exif::Tag::DateTime]
            .into_iter()
            .find_map(|tag| data.get_field(tag, exif::In::PRIMARY))
            .and_then(|field| match &field.value {
                exif::Value::Ascii(values) => values.first().cloned(),
                _ => None,
            })
            .ok_or_else(|| TimestampError::NoExifTime(path.to_path_buf()))?;

        let value = String::from_utf8_lossy(&raw)
            .trim_end_matches('\0')
            .trim()
            .to_string();

        parse_exif_datetime(&value)
            .and_then(|civil| civil.to_zoned(self.zone.clone()))
            .map(CaptureInstant::new)
            .map_err(|source| TimestampError::Invalid {
                path: path.to_path_buf(),
                value,
                source,
            })
    }

    fn parse_filename(&self, path: &Path) -> Result<CaptureInstant, TimestampError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        DateTime::strptime(&self.filename_format, &stem)
            .and_then(|civil| civil.to_zoned(self.zone.clone()))
            .map(CaptureInstant::new)
            .map_err(|source| TimestampError::FilenameMismatch {
                stem,
                format: self.filename_format.clone(),
                source,
            })
    }

    fn read_modified(&self, path: &Path) -> Result<CaptureInstant, TimestampError> {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|source| TimestampError::Modified {
                path: path.to_path_buf(),
                source,
            })?;

        let timestamp = Timestamp::try_from(modified).map_err(|source| TimestampError::Invalid {
            path: path.to_path_buf(),
            value: format!("{modified:?}"),
            source,
        })?;

        Ok(CaptureInstant::new(timestamp.to_zoned(self.zone.clone())))
    }
}

/// Parse an EXIF `DateTime`/`DateTimeOriginal` value.
fn parse_exif_datetime(value: &str) -> Result<DateTime, jiff::Error> {
    DateTime::strptime(EXIF_FORMAT, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;
    use std::time::{Duration, SystemTime};

    use jiff::civil::date;
    use tempfile::TempDir;

    fn utc(y: i16, mo: i8, d: i8, h: i8, mi: i8, s: i8) -> CaptureInstant {
        CaptureInstant::new(date(y, mo, d).at(h, mi, s, 0).to_zoned(TimeZone::UTC).unwrap())
    }

    fn write_png(path: &Path) {
        image::RgbImage::new(4, 4).save(path).unwrap();
    }

    /// A small JPEG carrying the given ASCII tags in an APP1 Exif segment.
    fn write_jpeg_with_exif(path: &Path, tags: &[(exif::Tag, &str)]) {
        let fields: Vec<exif::Field> = tags
            .iter()
            .map(|(tag, value)| exif::Field {
                tag: *tag,
                ifd_num: exif::In::PRIMARY,
                value: exif::Value::Ascii(vec![value.as_bytes().to_vec()]),
            })
            .collect();
        let mut writer = exif::experimental::Writer::new();
        for field in &fields {
            writer.push_field(field);
        }
        let mut tiff = Cursor::new(Vec::new());
        writer.write(&mut tiff, false).unwrap();
        let tiff = tiff.into_inner();

        let mut jpeg = Vec::new();
        image::RgbImage::new(8, 8)
            .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        // SOI, then APP1 "Exif\0\0" + TIFF, then the rest of the image.
        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&u16::try_from(tiff.len() + 8).unwrap().to_be_bytes());
        out.extend_from_slice(b"Exif\0\0");
        out.extend_from_slice(&tiff);
        out.extend_from_slice(&jpeg[2..]);
        fs::write(path, out).unwrap();
    }

    #[test]
    fn canonical_key_is_fixed_width_seconds() {
        let instant = utc(2024, 3, 1, 9, 5, 7);
        assert_eq!(instant.canonical_key(), "2024-03-01-090507");
    }

    #[test]
    fn canonical_key_ignores_subseconds() {
        let a = CaptureInstant::new(
            date(2024, 3, 1).at(9, 5, 7, 100).to_zoned(TimeZone::UTC).unwrap(),
        );
        let b = CaptureInstant::new(
            date(2024, 3, 1).at(9, 5, 7, 900_000_000).to_zoned(TimeZone::UTC).unwrap(),
        );
        assert_ne!(a, b);
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn display_and_date_suffix() {
        let instant = utc(2024, 3, 1, 14, 25, 30);
        assert_eq!(instant.display("%d.%m.%Y"), "01.03.2024");
        assert_eq!(instant.display("%H:%M:%S"), "14:25:30");
        assert_eq!(instant.date_suffix(), "_2024-03-01");
    }

    #[test]
    fn canonical_key_round_trips_through_file_stem() {
        let instant = utc(2023, 12, 31, 23, 59, 59);
        let back = CaptureInstant::from_canonical_key(&instant.canonical_key(), &TimeZone::UTC);
        assert_eq!(back, Some(instant));
        assert_eq!(CaptureInstant::from_canonical_key("not-a-key", &TimeZone::UTC), None);
    }

    #[test]
    fn instants_order_chronologically() {
        let earlier = utc(2024, 1, 1, 0, 0, 0);
        let later = utc(2024, 1, 1, 0, 0, 1);
        assert!(earlier < later);
        assert_eq!(earlier.clone().max(later.clone()), later);
    }

    #[test]
    fn filename_strategy_parses_stem() {
        let resolver = Resolver::new(TimestampSource::Filename, "%Y-%m-%d_%H%M%S", TimeZone::UTC);
        let instant = resolver
            .resolve(Path::new("photos/2024-03-01_142530.jpg"))
            .unwrap();
        assert_eq!(instant, utc(2024, 3, 1, 14, 25, 30));
    }

    #[test]
    fn filename_strategy_strips_any_extension() {
        let resolver = Resolver::new(TimestampSource::Filename, "%Y-%m-%d_%H%M%S", TimeZone::UTC);
        let instant = resolver
            .resolve(Path::new("2024-03-01_142530.PNG"))
            .unwrap();
        assert_eq!(instant.canonical_key(), "2024-03-01-142530");
    }

    #[test]
    fn filename_mismatch_is_an_error() {
        let resolver = Resolver::new(TimestampSource::Filename, "%Y-%m-%d_%H%M%S", TimeZone::UTC);
        let err = resolver.resolve(Path::new("IMG_0042.jpg")).unwrap_err();
        assert!(matches!(err, TimestampError::FilenameMismatch { .. }));
    }

    #[test]
    fn filemod_strategy_reads_modified_time() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.png");
        write_png(&path);

        // 2024-03-01T14:25:30Z
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_709_303_130);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let resolver = Resolver::new(TimestampSource::Filemod, "", TimeZone::UTC);
        let instant = resolver.resolve(&path).unwrap();
        assert_eq!(instant, utc(2024, 3, 1, 14, 25, 30));
    }

    #[test]
    fn filemod_missing_file_is_an_error() {
        let resolver = Resolver::new(TimestampSource::Filemod, "", TimeZone::UTC);
        let err = resolver.resolve(Path::new("/definitely/not/here.jpg")).unwrap_err();
        assert!(matches!(err, TimestampError::Modified { .. }));
    }

    #[test]
    fn exif_strategy_reads_capture_time() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_0001.jpg");
        write_jpeg_with_exif(&path, &[(exif::Tag::DateTimeOriginal, "2024:03:01 14:25:30")]);

        let resolver = Resolver::new(TimestampSource::Exif, "", TimeZone::UTC);
        assert_eq!(resolver.resolve(&path).unwrap(), utc(2024, 3, 1, 14, 25, 30));
    }

    #[test]
    fn exif_original_time_wins_over_modified_time() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_0002.jpg");
        write_jpeg_with_exif(
            &path,
            &[
                (exif::Tag::DateTime, "2024:05:05 10:00:00"),
                (exif::Tag::DateTimeOriginal, "2024:03:01 14:25:30"),
            ],
        );

        let resolver = Resolver::new(TimestampSource::Exif, "", TimeZone::UTC);
        assert_eq!(resolver.resolve(&path).unwrap(), utc(2024, 3, 1, 14, 25, 30));
    }

    #[test]
    fn exif_falls_back_to_date_time() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_0003.jpg");
        write_jpeg_with_exif(&path, &[(exif::Tag::DateTime, "2024:05:05 10:00:00")]);

        let resolver = Resolver::new(TimestampSource::Exif, "", TimeZone::UTC);
        assert_eq!(resolver.resolve(&path).unwrap(), utc(2024, 5, 5, 10, 0, 0));
    }

    #[test]
    fn exif_with_blank_capture_time_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_0004.jpg");
        write_jpeg_with_exif(&path, &[(exif::Tag::DateTimeOriginal, "0000:00:00 00:00:00")]);

        let resolver = Resolver::new(TimestampSource::Exif, "", TimeZone::UTC);
        let err = resolver.resolve(&path).unwrap_err();
        assert!(matches!(err, TimestampError::Invalid { .. }));
    }

    #[test]
    fn exif_strategy_without_metadata_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.jpg");
        image::RgbImage::new(8, 8).save(&path).unwrap();

        let resolver = Resolver::new(TimestampSource::Exif, "", TimeZone::UTC);
        let err = resolver.resolve(&path).unwrap_err();
        assert!(matches!(err, TimestampError::NoExifTime(_)));
    }

    #[test]
    fn canonical_keys_are_recognised_exactly() {
        assert!(is_canonical_key("2024-03-01-142530"));
        assert!(!is_canonical_key("thumb"));
        assert!(!is_canonical_key("2024-3-1-142530"));
        assert!(!is_canonical_key("2024-03-01-142530-extra"));
    }

    #[test]
    fn exif_value_parses() {
        let civil = parse_exif_datetime("2024:03:01 14:25:30").unwrap();
        assert_eq!(civil, date(2024, 3, 1).at(14, 25, 30, 0));
        assert!(parse_exif_datetime("0000:00:00 00:00:00").is_err());
    }

    #[test]
    fn zoneless_sources_share_the_configured_zone() {
        let oslo = TimeZone::get("Europe/Oslo").unwrap();
        let resolver = Resolver::new(TimestampSource::Filename, "%Y-%m-%d_%H%M%S", oslo);
        let instant = resolver.resolve(Path::new("2024-07-01_120000.jpg")).unwrap();

        // Wall clock is kept; the key does not shift to UTC.
        assert_eq!(instant.canonical_key(), "2024-07-01-120000");
        assert_eq!(instant.0.timestamp(), "2024-07-01T10:00:00Z".parse::<Timestamp>().unwrap());
    }
}
