//! Text painting: rasterise a line of text onto a frame.
//!
//! The annotator only needs "draw this string here in this style", so text
//! rendering sits behind [`TextPainter`]. [`FontPainter`] is the real thing,
//! shaping and rasterising with cosmic-text from a single font file. No
//! system fonts are consulted.

use std::fs;
use std::path::{Path, PathBuf};

use cosmic_text::{Attrs, Buffer, Color, Family, FontSystem, Metrics, Shaping, SwashCache, fontdb};
use image::{Rgba, RgbaImage};

use super::AnnotateError;

/// How a line of text is drawn. Positions are the top-left corner of the line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextStyle {
    /// Font size in pixels.
    pub size: f32,
    pub color: Rgba<u8>,
}

impl TextStyle {
    /// White at the given opacity (0.0–1.0).
    pub fn white(size: f32, opacity: f32) -> Self {
        Self {
            size,
            color: Rgba([255, 255, 255, (opacity.clamp(0.0, 1.0) * 255.0).round() as u8]),
        }
    }
}

/// Draws single lines of text onto a frame.
pub trait TextPainter {
    /// Draw `text` with its top-left corner at (`x`, `y`).
    ///
    /// Glyphs falling outside the canvas are clipped.
    fn draw(&mut self, canvas: &mut RgbaImage, text: &str, x: i32, y: i32, style: TextStyle);
}

/// cosmic-text painter backed by one font file.
pub struct FontPainter {
    font_system: FontSystem,
    swash_cache: SwashCache,
    family: String,
}

impl FontPainter {
    /// Load the font at `path`. Fails if the file can't be read or holds no
    /// usable face.
    pub fn load(path: &Path) -> Result<Self, AnnotateError> {
        let data = fs::read(path).map_err(|source| AnnotateError::Font {
            path: path.to_path_buf(),
            source,
        })?;

        let mut db = fontdb::Database::new();
        db.load_font_data(data);

        let family = db
            .faces()
            .find_map(|face| face.families.first().map(|(name, _)| name.clone()))
            .ok_or_else(|| AnnotateError::NoFontFace(PathBuf::from(path)))?;

        log::debug!("loaded font family {family:?} from {}", path.display());

        Ok(Self {
            font_system: FontSystem::new_with_locale_and_db("en-US".to_string(), db),
            swash_cache: SwashCache::new(),
            family,
        })
    }

    pub fn family(&self) -> &str {
        &self.family
    }
}

impl TextPainter for FontPainter {
    fn draw(&mut self, canvas: &mut RgbaImage, text: &str, x: i32, y: i32, style: TextStyle) {
        let metrics = Metrics::new(style.size, style.size);
        let mut buffer = Buffer::new(&mut self.font_system, metrics);
        buffer.set_size(&mut self.font_system, None, None);

        let attrs = Attrs::new().family(Family::Name(&self.family));
        buffer.set_text(&mut self.font_system, text, &attrs, Shaping::Advanced, None);
        buffer.shape_until_scroll(&mut self.font_system, false);

        let [red, green, blue, alpha] = style.color.0;
        let color = Color::rgba(red, green, blue, alpha);

        buffer.draw(
            &mut self.font_system,
            &mut self.swash_cache,
            color,
            |gx, gy, width, height, coverage| {
                let width = i32::try_from(width).unwrap_or(0);
                let height = i32::try_from(height).unwrap_or(0);
                for dy in 0..height {
                    for dx in 0..width {
                        blend(canvas, x + gx + dx, y + gy + dy, coverage);
                    }
                }
            },
        );
    }
}

/// Source-over blend of one pixel. Out-of-bounds coordinates are ignored.
fn blend(canvas: &mut RgbaImage, x: i32, y: i32, color: Color) {
    if x < 0 || y < 0 || x as u32 >= canvas.width() || y as u32 >= canvas.height() {
        return;
    }

    let alpha = f32::from(color.a()) / 255.0;
    if alpha <= 0.0 {
        return;
    }

    let px = canvas.get_pixel_mut(x as u32, y as u32);
    let mix = |src: u8, dst: u8| -> u8 {
        (f32::from(src) * alpha + f32::from(dst) * (1.0 - alpha)).round() as u8
    };
    px.0[0] = mix(color.r(), px.0[0]);
    px.0[1] = mix(color.g(), px.0[1]);
    px.0[2] = mix(color.b(), px.0[2]);
    px.0[3] = px.0[3].max(color.a());
}
