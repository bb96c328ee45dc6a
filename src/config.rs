//! Timelapse configuration.
//!
//! Loaded once at startup from a flat TOML file and passed by reference to
//! every stage of the pipeline. Lookup order:
//!
//! 1. `--config <path>`: explicit file, must exist
//! 2. `./timelapse.toml`: project-local settings
//! 3. `~/.timelapse/config.toml`: per-user defaults
//!
//! Missing keys take their defaults. `font` has no default and is required.

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use jiff::tz::TimeZone;
use serde::{Deserialize, Serialize};

use crate::encode::CodecProfile;
use crate::timestamp::TimestampSource;

/// File name looked up in the working directory when `--config` is absent.
pub const LOCAL_CONFIG: &str = "timelapse.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("no font configured: set `font = \"path/to/font.ttf\"`")]
    FontMissing,

    #[error("font file {} is not readable: {source}", path.display())]
    FontUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("logo file {} is not readable: {source}", path.display())]
    LogoUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unknown time zone `{name}`: {source}")]
    TimeZone { name: String, source: jiff::Error },

    #[error("{key} is out of range: {value}")]
    OutOfRange { key: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Resampling filter used when scaling the logo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageBackend {
    #[default]
    Lanczos3,
    CatmullRom,
    Triangle,
    Nearest,
}

impl ImageBackend {
    pub fn filter(self) -> FilterType {
        match self {
            Self::Lanczos3 => FilterType::Lanczos3,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Triangle => FilterType::Triangle,
            Self::Nearest => FilterType::Nearest,
        }
    }
}

/// Every recognised setting, with its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    /// Where each photo's capture instant comes from.
    pub timestamp_source: TimestampSource,
    /// strftime pattern matched against the file stem for `filename`.
    pub filename_format: String,
    /// IANA zone all instants are normalised to. `None` uses the system zone.
    pub time_zone: Option<String>,

    pub image_backend: ImageBackend,
    pub jpeg_quality: u8,

    /// TrueType/OpenType font used for the date and time overlay.
    pub font: Option<PathBuf>,
    pub font_size_date: f32,
    pub font_size_time: f32,
    pub date_format: String,
    pub time_format: String,

    pub logo: bool,
    pub logo_file: PathBuf,
    /// Logo height in pixels after scaling. Width follows the aspect ratio.
    pub logo_height: u32,
    /// Logo opacity in percent. 0 is invisible, 100 is opaque.
    pub logo_opacity: u8,

    /// Turn frames upside down.
    pub rotate: bool,
    /// Number of leading frames left unrotated.
    pub rotate_skip: usize,

    pub codec: CodecProfile,
    pub framerate: u32,
    pub crf_hevc: u8,
    pub crf_h264: u8,
    /// Target bitrate for `hevc_hardware`, in ffmpeg notation (`6000K`).
    pub hardware_bitrate: String,

    pub source_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub sequence_dir: PathBuf,
    pub output_dir: PathBuf,

    pub keep_staging: bool,
    pub keep_sequence: bool,
    /// Delete source files that collide with an earlier source in the same run.
    pub discard_duplicates: bool,

    /// Encoder binary.
    pub ffmpeg: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timestamp_source: TimestampSource::Exif,
            filename_format: "%Y-%m-%d_%H%M%S".into(),
            time_zone: None,
            image_backend: ImageBackend::default(),
            jpeg_quality: 90,
            font: None,
            font_size_date: 26.0,
            font_size_time: 40.0,
            date_format: "%d.%m.%Y".into(),
            time_format: "%H:%M:%S".into(),
            logo: true,
            logo_file: "logo.png".into(),
            logo_height: 200,
            logo_opacity: 40,
            rotate: false,
            rotate_skip: 0,
            codec: CodecProfile::Hevc,
            framerate: 25,
            crf_hevc: 30,
            crf_h264: 25,
            hardware_bitrate: "6000K".into(),
            source_dir: "images-src".into(),
            staging_dir: "tmp-processed".into(),
            sequence_dir: "tmp-sequence".into(),
            output_dir: "video".into(),
            keep_staging: false,
            keep_sequence: false,
            discard_duplicates: true,
            ffmpeg: "ffmpeg".into(),
        }
    }
}

impl Config {
    /// Load and validate configuration.
    ///
    /// An explicit path must exist. Without one, the first of
    /// `./timelapse.toml` and `~/.timelapse/config.toml` that exists is used,
    /// and defaults apply when neither does.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Self::from_file(path)?,
            None => {
                if let Some(path) = Self::candidates().into_iter().find(|p| p.is_file()) {
                    Self::from_file(&path)?
                } else {
                    log::debug!("no config file found, using defaults");
                    Self::default()
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without validating it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// The per-user config file path: `~/.timelapse/config.toml`.
    pub fn user_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".timelapse").join("config.toml"))
    }

    fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        paths.extend(Self::user_path());
        paths
    }

    /// Fail fast on anything that would otherwise surface mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let font = self.font_path()?;
        check_readable(font).map_err(|source| ConfigError::FontUnreadable {
            path: font.to_path_buf(),
            source,
        })?;

        if self.logo {
            check_readable(&self.logo_file).map_err(|source| ConfigError::LogoUnreadable {
                path: self.logo_file.clone(),
                source,
            })?;
            if self.logo_height == 0 {
                return Err(out_of_range("logo-height", &self.logo_height));
            }
            if self.logo_opacity > 100 {
                return Err(out_of_range("logo-opacity", &self.logo_opacity));
            }
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(out_of_range("jpeg-quality", &self.jpeg_quality));
        }
        if self.framerate == 0 {
            return Err(out_of_range("framerate", &self.framerate));
        }
        if self.font_size_date <= 0.0 {
            return Err(out_of_range("font-size-date", &self.font_size_date));
        }
        if self.font_size_time <= 0.0 {
            return Err(out_of_range("font-size-time", &self.font_size_time));
        }
        if self.timestamp_source == TimestampSource::Filename && self.filename_format.is_empty() {
            return Err(ConfigError::Empty("filename-format"));
        }
        if self.hardware_bitrate.is_empty() {
            return Err(ConfigError::Empty("hardware-bitrate"));
        }

        self.zone()?;
        Ok(())
    }

    /// The configured font path, or [`ConfigError::FontMissing`].
    pub fn font_path(&self) -> Result<&Path, ConfigError> {
        match &self.font {
            Some(path) if !path.as_os_str().is_empty() => Ok(path),
            _ => Err(ConfigError::FontMissing),
        }
    }

    /// The zone every capture instant is normalised to.
    pub fn zone(&self) -> Result<TimeZone, ConfigError> {
        match &self.time_zone {
            None => Ok(TimeZone::system()),
            Some(name) => TimeZone::get(name).map_err(|source| ConfigError::TimeZone {
                name: name.clone(),
                source,
            }),
        }
    }
}

fn check_readable(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "is a directory",
        ));
    }
    fs::File::open(path).map(drop)
}

fn out_of_range(key: &'static str, value: &impl ToString) -> ConfigError {
    ConfigError::OutOfRange {
        key,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    /// Config with a real (if empty) font file and no logo.
    fn valid_config(dir: &TempDir) -> Config {
        let font = dir.path().join("font.ttf");
        fs::write(&font, b"not really a font").unwrap();
        Config {
            font: Some(font),
            logo: false,
            time_zone: Some("UTC".into()),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.timestamp_source, TimestampSource::Exif);
        assert_eq!(config.jpeg_quality, 90);
        assert_eq!(config.codec, CodecProfile::Hevc);
        assert_eq!(config.framerate, 25);
        assert_eq!(config.crf_hevc, 30);
        assert_eq!(config.crf_h264, 25);
        assert_eq!(config.hardware_bitrate, "6000K");
        assert!(config.logo);
        assert!(!config.keep_staging);
    }

    #[test]
    fn missing_font_fails_validation() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::FontMissing));
    }

    #[test]
    fn unreadable_font_fails_validation() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            font: Some(dir.path().join("absent.ttf")),
            ..valid_config(&dir)
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::FontUnreadable { .. }));
    }

    #[test]
    fn missing_logo_fails_when_enabled() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            logo: true,
            logo_file: dir.path().join("logo.png"),
            ..valid_config(&dir)
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::LogoUnreadable { .. }));
    }

    #[test]
    fn jpeg_quality_out_of_range() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            jpeg_quality: 0,
            ..valid_config(&dir)
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "jpeg-quality", .. }));
    }

    #[test]
    fn unknown_time_zone_fails() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            time_zone: Some("Mars/Olympus_Mons".into()),
            ..valid_config(&dir)
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::TimeZone { .. }));
    }

    #[test]
    fn valid_config_passes() {
        let dir = TempDir::new().unwrap();
        valid_config(&dir).validate().unwrap();
    }

    #[test]
    fn parses_flat_kebab_case_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timelapse.toml");
        fs::write(
            &path,
            r#"
timestamp-source = "filename"
filename-format = "%Y%m%d-%H%M%S"
codec = "hevc_vt"
crf-h264 = 23
keep-sequence = true
image-backend = "triangle"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.timestamp_source, TimestampSource::Filename);
        assert_eq!(config.filename_format, "%Y%m%d-%H%M%S");
        assert_eq!(config.codec, CodecProfile::HevcHardware);
        assert_eq!(config.crf_h264, 23);
        assert!(config.keep_sequence);
        assert_eq!(config.image_backend, ImageBackend::Triangle);
        // Untouched keys keep their defaults.
        assert_eq!(config.framerate, 25);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timelapse.toml");
        fs::write(&path, "frame-rate = 30\n").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.toml");
        let err = Config::load(Some(path.as_path())).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
