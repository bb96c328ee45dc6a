//! CLI interface for timelapse.
//!
//! Non-interactive: configuration in, one video out.
//!
//! - `timelapse run`: build the timelapse from the source directory.
//! - `timelapse check`: pre-flight only; touches nothing.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::annotate::{Annotator, FontPainter};
use crate::config::Config;
use crate::encode::{EncodeJob, Ffmpeg};
use crate::pipeline;

/// Timelapse: turn a folder of timestamped photos into a video.
#[derive(Debug, Parser)]
#[command(name = "timelapse", version, after_long_help = CONFIG_HELP)]
pub struct Cli {
    /// Config file. Defaults to `./timelapse.toml`, then `~/.timelapse/config.toml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output. Repeat for trace.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

const CONFIG_HELP: &str = r#"Minimal timelapse.toml:
  font = "fonts/DejaVuSans.ttf"
  timestamp-source = "filename"     # exif | filename | filemod
  filename-format = "%Y-%m-%d_%H%M%S"
  codec = "hevc"                    # hevc | hevc_hardware | h264
  logo = false

Duplicate photos (same second) found in one run are deleted from the
source directory unless `discard-duplicates = false`."#;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the timelapse.
    ///
    /// Stamps every photo into the staging directory, renumbers the frames
    /// and runs ffmpeg. Prints a summary line on success.
    Run {
        /// Print the run summary as JSON instead.
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration, font, logo and source directory.
    ///
    /// Prints what a run would do without writing anything.
    Check,
}

/// Run the CLI, returning an error message on failure.
pub fn run(cli: &Cli) -> Result<(), String> {
    let config = Config::load(cli.config.as_deref()).map_err(|e| e.to_string())?;

    match cli.command {
        Command::Run { json } => cmd_run(&config, json),
        Command::Check => cmd_check(&config),
    }
}

fn load_painter(config: &Config) -> Result<FontPainter, String> {
    let font = config.font_path().map_err(|e| e.to_string())?;
    let painter = FontPainter::load(font).map_err(|e| e.to_string())?;
    log::info!("using font {} ({})", font.display(), painter.family());
    Ok(painter)
}

fn cmd_run(config: &Config, json: bool) -> Result<(), String> {
    let painter = load_painter(config)?;
    let encoder = Ffmpeg::new(&config.ffmpeg);

    let summary =
        pipeline::run(config, Box::new(painter), &encoder).map_err(|e| e.to_string())?;

    if json {
        let out = serde_json::to_string_pretty(&summary)
            .map_err(|e| format!("failed to serialize summary: {e}"))?;
        println!("{out}");
    } else {
        println!("{summary}");
        if let Some(output) = &summary.output {
            println!("{}", output.display());
        }
    }
    Ok(())
}

fn cmd_check(config: &Config) -> Result<(), String> {
    let painter = load_painter(config)?;
    let sources = pipeline::preflight(config).map_err(|e| e.to_string())?;
    // Builds (and discards) the logo.
    Annotator::new(config, Box::new(painter)).map_err(|e| e.to_string())?;

    let job = EncodeJob::with_date_suffix(config, "_YYYY-MM-DD");
    let encoder = Ffmpeg::new(&config.ffmpeg);

    println!(
        "{} images in {}",
        sources.len(),
        config.source_dir.display()
    );
    println!("timestamps from {}", config.timestamp_source);
    println!(
        "logo: {}",
        if config.logo {
            config.logo_file.display().to_string()
        } else {
            "off".to_string()
        }
    );
    println!("{}", encoder.command_line(&job));
    Ok(())
}
