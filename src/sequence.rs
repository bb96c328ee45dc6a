//! Sequencing: renumber staged frames into the encoder's input pattern.
//!
//! ffmpeg reads `seq-%08d.jpg` starting at 1 and stops at the first gap, so
//! the sequence directory must hold a dense, fixed-width run:
//!
//! ```text
//! <sequence>/seq-00000001.jpg
//! <sequence>/seq-00000002.jpg
//! ...
//! ```
//!
//! Staged frames are named by canonical key, which sorts chronologically, so
//! ordering by file name is ordering by capture time. Frames are copied, not
//! moved: the staging directory may be kept after the run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::timestamp;

/// ffmpeg input pattern for the sequence directory.
pub const SEQUENCE_PATTERN: &str = "seq-%08d.jpg";

/// A frame renumbered for the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedFrame {
    /// 1-based position in the sequence.
    pub index: usize,
    /// The staged frame it was copied from.
    pub staged: PathBuf,
    pub path: PathBuf,
}

/// File name of the frame at `index`.
pub fn sequence_name(index: usize) -> String {
    format!("seq-{index:08}.jpg")
}

/// All `.jpg` files directly inside `dir`, sorted by file name.
///
/// A missing directory has no frames.
pub fn list_jpegs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut frames = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_jpg = path.extension().is_some_and(|ext| ext == "jpg");
        if is_jpg && path.is_file() {
            frames.push(path);
        }
    }

    // Sort for deterministic (and chronological) order.
    frames.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(frames)
}

/// True if `path` is named like a staged frame: `<canonical key>.jpg`.
pub fn is_frame(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "jpg")
        && path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(timestamp::is_canonical_key)
}

/// Staged frames directly inside `dir`, oldest first. Other `.jpg` files
/// are not frames and are skipped.
pub fn list_frames(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut frames = list_jpegs(dir)?;
    frames.retain(|path| is_frame(path));
    Ok(frames)
}

/// Delete every staged frame directly inside `dir`, leaving other files.
pub fn clear_frames(dir: &Path) -> io::Result<usize> {
    let frames = list_frames(dir)?;
    for frame in &frames {
        fs::remove_file(frame)?;
    }
    Ok(frames.len())
}

/// Delete every `.jpg` directly inside `dir`. Returns how many were removed.
pub fn clear_jpegs(dir: &Path) -> io::Result<usize> {
    let frames = list_jpegs(dir)?;
    for frame in &frames {
        fs::remove_file(frame)?;
    }
    Ok(frames.len())
}

/// Copy every staged frame into `sequence_dir` as `seq-00000001.jpg`, ...
///
/// Only `<canonical key>.jpg` files count as frames; any other `.jpg` is
/// logged and left out of the video.
///
/// Frames are numbered in ascending canonical-key order without gaps.
/// `sequence_dir` is expected to be clear of earlier `.jpg` files.
pub fn sequence(staging_dir: &Path, sequence_dir: &Path) -> io::Result<Vec<SequencedFrame>> {
    let (staged, strays): (Vec<_>, Vec<_>) = list_jpegs(staging_dir)?
        .into_iter()
        .partition(|path| is_frame(path));
    for stray in strays {
        log::warn!("{}: not a staged frame, leaving it out", stray.display());
    }
    let mut frames = Vec::with_capacity(staged.len());

    for (i, staged) in staged.into_iter().enumerate() {
        let index = i + 1;
        let path = sequence_dir.join(sequence_name(index));
        fs::copy(&staged, &path)?;
        log::debug!("{} -> {}", staged.display(), path.display());
        frames.push(SequencedFrame {
            index,
            staged,
            path,
        });
    }

    Ok(frames)
}
