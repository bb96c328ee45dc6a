//! The timelapse pipeline.
//!
//! Linear stages, never revisited:
//!
//! ```text
//! Init → Ingest → Sequence → Encode → Cleanup → Done
//! ```
//!
//! Ingest visits each source once, in file-name order: resolve its capture
//! instant, claim its canonical key, stamp it. A file that fails either step
//! is counted and skipped; only pre-flight and encoder failures end the run.
//! Processing is strictly sequential, and the dedup index and the logo are
//! owned by the single pipeline value.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use jiff::tz::TimeZone;
use serde::Serialize;

use crate::annotate::{AnnotateError, Annotator, Stamped, TextPainter};
use crate::config::{Config, ConfigError};
use crate::dedup::{Admission, Claim, DedupIndex};
use crate::encode::{EncodeError, EncodeJob, Encoder};
use crate::sequence::{self, SequencedFrame};
use crate::timestamp::{CaptureInstant, Resolver};

/// Extensions picked up from the source directory, compared case-insensitively.
pub const SOURCE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("there are no image files in {}", .0.display())]
    NoSourceImages(PathBuf),

    #[error("cannot read source directory {}: {source}", path.display())]
    SourceUnreadable { path: PathBuf, source: io::Error },

    #[error("cannot prepare annotation: {0}")]
    Annotator(#[from] AnnotateError),

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("no frames to encode")]
    NothingToEncode,

    #[error("encoding failed, frames left in {} and {}: {source}", staging.display(), sequence.display())]
    Encode {
        staging: PathBuf,
        sequence: PathBuf,
        source: EncodeError,
    },
}

impl RunError {
    fn io(context: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            context,
            path,
            source,
        }
    }
}

/// A photo found in the source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub path: PathBuf,
    /// 1-based position in enumeration order.
    pub index: usize,
}

/// Where the run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Ingest,
    Sequence,
    Encode,
    Cleanup,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "initialising",
            Self::Ingest => "processing files",
            Self::Sequence => "creating the image sequence",
            Self::Encode => "encoding video",
            Self::Cleanup => "cleaning up",
            Self::Done => "done",
        })
    }
}

/// What a run did.
///
/// `saved + duplicates + failures == seen` once ingest has finished.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub seen: usize,
    pub saved: usize,
    pub duplicates: usize,
    pub failures: usize,
    /// Newest capture instant among frames that made it into staging.
    pub latest: Option<CaptureInstant>,
    /// Frames handed to the encoder.
    pub frames: usize,
    pub output: Option<PathBuf>,
}

impl RunSummary {
    fn observe(&mut self, instant: &CaptureInstant) {
        if self.latest.as_ref().is_none_or(|latest| instant > latest) {
            self.latest = Some(instant.clone());
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {} files, saved {}, skipped {} duplicates, {} failed",
            self.seen, self.saved, self.duplicates, self.failures
        )
    }
}

/// List the images in `dir`, sorted by file name and numbered from 1.
pub fn discover(dir: &Path) -> Result<Vec<SourceImage>, RunError> {
    let unreadable = |source| RunError::SourceUnreadable {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if path.is_file() && has_image_extension(&path) {
            paths.push(path);
        }
    }

    if paths.is_empty() {
        return Err(RunError::NoSourceImages(dir.to_path_buf()));
    }

    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| SourceImage { path, index: i + 1 })
        .collect())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SOURCE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Everything that must hold before a single file is touched.
pub fn preflight(config: &Config) -> Result<Vec<SourceImage>, RunError> {
    config.validate()?;
    discover(&config.source_dir)
}

/// One timelapse run.
pub struct Pipeline<'a> {
    config: &'a Config,
    encoder: &'a dyn Encoder,
    resolver: Resolver,
    zone: TimeZone,
    annotator: Annotator,
    index: DedupIndex,
    sources: Vec<SourceImage>,
    summary: RunSummary,
}

impl<'a> Pipeline<'a> {
    /// Init stage: pre-flight checks, working directories, logo, dedup index.
    ///
    /// Fails without touching any source or staged file.
    pub fn new(
        config: &'a Config,
        painter: Box<dyn TextPainter>,
        encoder: &'a dyn Encoder,
    ) -> Result<Self, RunError> {
        log::info!("{}", Stage::Init);
        let sources = preflight(config)?;
        log::info!(
            "found {} images in {}",
            sources.len(),
            config.source_dir.display()
        );

        for dir in [&config.staging_dir, &config.sequence_dir, &config.output_dir] {
            fs::create_dir_all(dir).map_err(RunError::io("cannot create", dir))?;
        }

        let cleared = sequence::clear_jpegs(&config.sequence_dir)
            .map_err(RunError::io("cannot clear", &config.sequence_dir))?;
        if cleared > 0 {
            log::debug!("removed {cleared} frames from a previous sequence");
        }

        let zone = config.zone()?;
        let resolver = Resolver::new(
            config.timestamp_source,
            config.filename_format.clone(),
            zone.clone(),
        );
        let annotator = Annotator::new(config, painter)?;

        let mut index = DedupIndex::new();
        let staged = sequence::list_frames(&config.staging_dir)
            .map_err(RunError::io("cannot read", &config.staging_dir))?;
        for frame in staged {
            if let Some(key) = frame.file_stem().map(|s| s.to_string_lossy().into_owned()) {
                index.seed_staged(key, frame);
            }
        }
        if !index.is_empty() {
            log::info!("{} frames already staged from an earlier run", index.len());
        }

        Ok(Self {
            config,
            encoder,
            resolver,
            zone,
            annotator,
            index,
            sources,
            summary: RunSummary::default(),
        })
    }

    /// Run the remaining stages to completion.
    pub fn run(mut self) -> Result<RunSummary, RunError> {
        log::info!("{}", Stage::Ingest);
        for source in std::mem::take(&mut self.sources) {
            self.ingest(&source);
        }
        log::info!("{}", self.summary);

        log::info!("{}", Stage::Sequence);
        let frames = sequence::sequence(&self.config.staging_dir, &self.config.sequence_dir)
            .map_err(RunError::io("cannot sequence", &self.config.sequence_dir))?;
        self.summary.frames = frames.len();
        if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
            log::info!(
                "{} .. {} ({} frames)",
                first.path.display(),
                last.path.display(),
                last.index
            );
        }

        log::info!("{}", Stage::Encode);
        let latest = self.latest(&frames).ok_or(RunError::NothingToEncode)?;
        self.summary.latest = Some(latest.clone());
        let job = EncodeJob::new(self.config, &latest);
        log::info!(
            "{} frames at {} fps with {} -> {}",
            frames.len(),
            job.framerate,
            job.profile,
            job.output.display()
        );
        self.encoder
            .encode(&job)
            .map_err(|source| RunError::Encode {
                staging: self.config.staging_dir.clone(),
                sequence: self.config.sequence_dir.clone(),
                source,
            })?;
        self.summary.output = Some(job.output);

        log::info!("{}", Stage::Cleanup);
        self.cleanup()?;

        log::info!("{}", Stage::Done);
        Ok(self.summary)
    }

    /// Resolve, deduplicate and stamp one source. Never fails the run.
    fn ingest(&mut self, source: &SourceImage) {
        self.summary.seen += 1;
        let path = &source.path;

        let instant = match self.resolver.resolve(path) {
            Ok(instant) => instant,
            Err(e) => {
                log::warn!("{}: {e}", path.display());
                self.summary.failures += 1;
                return;
            }
        };

        let key = instant.canonical_key();
        match self.index.admit(&key, path) {
            Admission::Accepted => match self.annotator.stamp(source, &instant) {
                Ok(Stamped::Written(frame)) => {
                    log::info!("{} -> {}", path.display(), frame.display());
                    self.summary.saved += 1;
                    self.summary.observe(&instant);
                }
                Ok(Stamped::AlreadyPresent(frame)) => {
                    log::info!("{} -> already staged as {}", path.display(), frame.display());
                    self.summary.duplicates += 1;
                    self.summary.observe(&instant);
                }
                Err(e) => {
                    log::warn!("{}: {e}", path.display());
                    self.summary.failures += 1;
                    self.index.release(&key, path);
                }
            },
            Admission::Duplicate(claim) => {
                self.summary.duplicates += 1;
                self.summary.observe(&instant);
                self.discard(path, &claim);
            }
        }
    }

    /// Handle a duplicate source. In-run duplicates are deleted when
    /// configured to; sources matching a frame from an earlier run are kept.
    fn discard(&self, path: &Path, claim: &Claim) {
        match claim {
            Claim::Staged(frame) => {
                log::info!(
                    "{} -> duplicate of staged {}, skipping",
                    path.display(),
                    frame.display()
                );
            }
            Claim::Source(first) if self.config.discard_duplicates => {
                match fs::remove_file(path) {
                    Ok(()) => log::info!(
                        "{} -> duplicate of {}, deleted",
                        path.display(),
                        first.display()
                    ),
                    Err(e) => log::warn!("{}: cannot delete duplicate: {e}", path.display()),
                }
            }
            Claim::Source(first) => {
                log::info!(
                    "{} -> duplicate of {}, skipping",
                    path.display(),
                    first.display()
                );
            }
        }
    }

    /// Newest instant among the frames handed to the encoder, which may
    /// include frames staged by an earlier run.
    fn latest(&self, frames: &[SequencedFrame]) -> Option<CaptureInstant> {
        // Frames are in key order, so the last one is the newest staged.
        let newest_staged = frames.last().and_then(|frame| {
            let stem = frame.staged.file_stem()?.to_str()?;
            CaptureInstant::from_canonical_key(stem, &self.zone)
        });
        if frames.is_empty() {
            return None;
        }
        self.summary.latest.clone().into_iter().chain(newest_staged).max()
    }

    fn cleanup(&self) -> Result<(), RunError> {
        if !self.config.keep_staging {
            sequence::clear_frames(&self.config.staging_dir)
                .map_err(RunError::io("cannot clear", &self.config.staging_dir))?;
        }
        if !self.config.keep_sequence {
            sequence::clear_jpegs(&self.config.sequence_dir)
                .map_err(RunError::io("cannot clear", &self.config.sequence_dir))?;
        }
        Ok(())
    }
}

/// Build and run a pipeline.
pub fn run(
    config: &Config,
    painter: Box<dyn TextPainter>,
    encoder: &dyn Encoder,
) -> Result<RunSummary, RunError> {
    Pipeline::new(config, painter, encoder)?.run()
}
