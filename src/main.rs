mod annotate;
mod cli;
mod config;
mod dedup;
mod encode;
mod pipeline;
mod sequence;
mod timestamp;

use std::process;

use clap::Parser;

use cli::Cli;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if let Err(e) = cli::run(&cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `-q`/`-v` pick the level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}
