//! Frame annotation: stamp date, time and logo onto a photo.
//!
//! Each admitted source becomes one JPEG in the staging directory, named by
//! its canonical key:
//!
//! ```text
//! <staging>/2024-03-01-142530.jpg
//! ```
//!
//! Layout, measured from the bottom-right corner:
//!
//! - date: 200px in from the right edge, top at 80px above the bottom
//! - time: same column, top at `80 - font-size-date` above the bottom, so it
//!   starts where the date line ends
//! - logo: 10px in from the top-left corner
//!
//! Frames are written to a `.part` file and renamed into place. A canonical-key
//! file therefore always holds a complete frame.

mod paint;

pub use paint::{FontPainter, TextPainter, TextStyle};

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader, RgbaImage, imageops};

use crate::config::Config;
use crate::pipeline::SourceImage;
use crate::timestamp::CaptureInstant;

/// Horizontal distance of the text column from the right edge.
pub const TEXT_INSET_RIGHT: i32 = 200;

/// Distance of the date line's top from the bottom edge.
pub const DATE_OFFSET: i32 = 80;

/// Logo distance from the top and left edges.
pub const LOGO_INSET: i64 = 10;

const DATE_OPACITY: f32 = 0.6;
const TIME_OPACITY: f32 = 0.7;

/// Errors from decoding, drawing or encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum AnnotateError {
    #[error("cannot decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("cannot encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("cannot write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("cannot load logo {}: {source}", path.display())]
    Logo {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("cannot read font {}: {source}", path.display())]
    Font { path: PathBuf, source: io::Error },

    #[error("no usable font face in {}", .0.display())]
    NoFontFace(PathBuf),
}

/// What happened to a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stamped {
    /// A new frame was written.
    Written(PathBuf),
    /// A frame with this key was already on disk; nothing was done.
    AlreadyPresent(PathBuf),
}

/// Load the logo, scale it to `height` keeping its aspect ratio, and apply
/// `opacity` percent to its alpha channel.
pub fn prepare_logo(
    path: &Path,
    height: u32,
    opacity: u8,
    filter: imageops::FilterType,
) -> Result<RgbaImage, AnnotateError> {
    let logo = image::open(path).map_err(|source| AnnotateError::Logo {
        path: path.to_path_buf(),
        source,
    })?;

    let mut logo = logo.resize(u32::MAX, height, filter).to_rgba8();
    let factor = f32::from(opacity.min(100)) / 100.0;
    for px in logo.pixels_mut() {
        px.0[3] = (f32::from(px.0[3]) * factor).round() as u8;
    }

    log::debug!(
        "prepared logo {} at {}x{}, {opacity}% opacity",
        path.display(),
        logo.width(),
        logo.height()
    );
    Ok(logo)
}

/// Stamps frames into the staging directory.
pub struct Annotator {
    painter: Box<dyn TextPainter>,
    /// Shared by every frame of the run; read-only once prepared.
    logo: Option<RgbaImage>,
    staging_dir: PathBuf,
    date_format: String,
    time_format: String,
    date_style: TextStyle,
    time_style: TextStyle,
    jpeg_quality: u8,
    rotate: bool,
    rotate_skip: usize,
}

impl Annotator {
    /// Build an annotator, preparing the logo once if it is enabled.
    pub fn new(config: &Config, painter: Box<dyn TextPainter>) -> Result<Self, AnnotateError> {
        let logo = if config.logo {
            Some(prepare_logo(
                &config.logo_file,
                config.logo_height,
                config.logo_opacity,
                config.image_backend.filter(),
            )?)
        } else {
            None
        };

        Ok(Self {
            painter,
            logo,
            staging_dir: config.staging_dir.clone(),
            date_format: config.date_format.clone(),
            time_format: config.time_format.clone(),
            date_style: TextStyle::white(config.font_size_date, DATE_OPACITY),
            time_style: TextStyle::white(config.font_size_time, TIME_OPACITY),
            jpeg_quality: config.jpeg_quality,
            rotate: config.rotate,
            rotate_skip: config.rotate_skip,
        })
    }

    /// The staging path of the frame for `instant`.
    pub fn frame_path(&self, instant: &CaptureInstant) -> PathBuf {
        self.staging_dir
            .join(format!("{}.jpg", instant.canonical_key()))
    }

    /// Stamp `source` and write it to the staging directory.
    ///
    /// Skips all work if the canonical-key file already exists.
    pub fn stamp(
        &mut self,
        source: &SourceImage,
        instant: &CaptureInstant,
    ) -> Result<Stamped, AnnotateError> {
        let target = self.frame_path(instant);
        if target.exists() {
            return Ok(Stamped::AlreadyPresent(target));
        }

        let mut canvas = decode(&source.path)?;

        if self.rotate && source.index > self.rotate_skip {
            imageops::rotate180_in_place(&mut canvas);
        }

        self.draw_overlay(&mut canvas, instant);

        write_jpeg(&canvas, &target, self.jpeg_quality)?;
        Ok(Stamped::Written(target))
    }

    fn draw_overlay(&mut self, canvas: &mut RgbaImage, instant: &CaptureInstant) {
        let width = i32::try_from(canvas.width()).unwrap_or(i32::MAX);
        let height = i32::try_from(canvas.height()).unwrap_or(i32::MAX);
        let x = width - TEXT_INSET_RIGHT;

        let date = instant.display(&self.date_format);
        self.painter
            .draw(canvas, &date, x, height - DATE_OFFSET, self.date_style);

        let time_offset = DATE_OFFSET - self.date_style.size.round() as i32;
        let time = instant.display(&self.time_format);
        self.painter
            .draw(canvas, &time, x, height - time_offset, self.time_style);

        if let Some(logo) = &self.logo {
            imageops::overlay(canvas, logo, LOGO_INSET, LOGO_INSET);
        }
    }
}

fn decode(path: &Path) -> Result<RgbaImage, AnnotateError> {
    let decode_err = |source| AnnotateError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let image = ImageReader::open(path)
        .and_then(ImageReader::with_guessed_format)
        .map_err(|e| decode_err(image::ImageError::IoError(e)))?
        .decode()
        .map_err(decode_err)?;

    Ok(image.to_rgba8())
}

/// Encode `canvas` as JPEG at `target`, via a sibling `.part` file.
fn write_jpeg(canvas: &RgbaImage, target: &Path, quality: u8) -> Result<(), AnnotateError> {
    let part = target.with_extension("jpg.part");

    let result = encode_to(canvas, &part, quality).and_then(|()| {
        fs::rename(&part, target).map_err(|source| AnnotateError::Write {
            path: target.to_path_buf(),
            source,
        })
    });

    if result.is_err() {
        let _ = fs::remove_file(&part);
    }
    result
}

fn encode_to(canvas: &RgbaImage, path: &Path, quality: u8) -> Result<(), AnnotateError> {
    let write_err = |source| AnnotateError::Write {
        path: path.to_path_buf(),
        source,
    };

    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgba8(canvas.clone()).into_rgb8();

    let file = fs::File::create(path).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode_image(&rgb)
        .map_err(|source| AnnotateError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
    writer.flush().map_err(write_err)?;
    Ok(())
}
