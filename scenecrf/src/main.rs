use std::{panic, path::PathBuf, process};

use anyhow::Context;
use clap::Parser;
use path_abs::PathAbs;
use scenecrf_core::{SceneCrfContext, SearchControl, Settings, Verbosity};
use tracing::{debug, info, level_filters::LevelFilter, warn};

use crate::logging::init_logging;

mod logging;

pub const DEFAULT_CONFIG_PATH: &str = "./scenecrf.json";
pub const DEFAULT_LOG_FILE: &str = "scenecrf.log";

/// Finds, scene by scene, the CRF whose encode lands closest to a target
/// VMAF score, then joins the scenes into one video.
#[derive(Parser, Debug)]
#[command(name = "scenecrf", version, about)]
struct Cli {
    /// JSON settings file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log file, defaults to scenecrf.log in the temporary directory
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Only print warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Print debug output on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Only compute CRFs and scores, without writing the output video
    #[arg(long)]
    no_render: bool,

    /// Number of scenes searched in parallel, 0 picks automatically
    #[arg(short, long)]
    workers: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let orig_hook = panic::take_hook();
    // Catch panics in child threads
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(1);
    }));
    run()
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = PathAbs::new(&cli.config)?.as_path().to_path_buf();
    let mut settings = Settings::from_file(&config_path)?;

    if cli.quiet {
        settings.run.verbosity = Verbosity::Quiet;
    } else if cli.verbose {
        settings.run.verbosity = Verbosity::Verbose;
    }
    if cli.no_render {
        settings.run.render = false;
    }
    if let Some(workers) = cli.workers {
        settings.run.workers = workers;
    }

    let stderr_level = match settings.run.verbosity {
        Verbosity::Quiet => LevelFilter::WARN,
        Verbosity::Normal => LevelFilter::INFO,
        Verbosity::Verbose => LevelFilter::DEBUG,
    };
    let log_file = cli.log_file.unwrap_or_else(|| settings.io.temp.join(DEFAULT_LOG_FILE));
    let _guard = init_logging(stderr_level, &log_file, LevelFilter::DEBUG)?;
    debug!("settings from {config_path:?}: {settings:?}");

    let control = SearchControl::new(settings.run.pause_file.clone());
    let handler_control = control.clone();
    ctrlc::set_handler(move || {
        if handler_control.is_cancelled() {
            process::exit(130);
        }
        warn!("cancelling, interrupted probes are discarded (press Ctrl-C again to exit now)");
        handler_control.cancel();
    })
    .context("Failed to install the Ctrl-C handler")?;

    let context = SceneCrfContext::new(settings, control)?;
    let summary = context.run()?;

    match &summary.output {
        Some(output) => info!("done, wrote {output:?}"),
        None => info!("done, report at {report:?}", report = summary.report_path),
    }
    Ok(())
}
