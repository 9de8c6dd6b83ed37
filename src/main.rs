//! cliprdr-x11-bridge - X11 clipboard bridge for the RDP clipboard channel
//!
//! Entry point for the bridge binary. Clipboard PDUs are exchanged over
//! stdin/stdout, so all logging goes to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use cliprdr_x11_bridge::config::Config;
use cliprdr_x11_bridge::rdp::run_stdio;

/// Command-line arguments for cliprdr-x11-bridge
#[derive(Parser, Debug)]
#[command(name = "cliprdr-x11-bridge")]
#[command(version, about = "X11 clipboard bridge for the RDP CLIPRDR channel", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CLIPRDR_X11_CONFIG")]
    pub config: Option<PathBuf>,

    /// X display to connect to (defaults to $DISPLAY)
    #[arg(short, long)]
    pub display: Option<String>,

    /// Selection to bridge
    #[arg(short, long, env = "CLIPRDR_X11_SELECTION")]
    pub selection: Option<String>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Write logs to file (in addition to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, load_error) = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default_config(), Some(e)),
        },
        None => (Config::default_config(), None),
    };
    let mut config = config.with_overrides(args.display.clone(), args.selection.clone());
    if let Some(format) = &args.log_format {
        config.logging.format = format.clone();
    }
    if args.log_file.is_some() {
        config.logging.log_file = args.log_file.clone();
    }

    let _log_guard = init_logging(&config, args.verbose)?;

    info!("════════════════════════════════════════════════════════");
    info!("  cliprdr-x11-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {}", env!("BUILD_DATE"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    if let Some(e) = load_error {
        warn!("Failed to load config: {:#}, using defaults", e);
    }
    config.validate().context("Invalid configuration")?;
    tracing::debug!("Config: {:?}", config);

    run_stdio(&config).await?;

    info!("cliprdr-x11-bridge shut down");
    Ok(())
}

type LogLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

fn format_layer<S, W>(format: &str, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    match format {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ => layer.pretty().boxed(),
    }
}

fn init_logging(config: &Config, verbose: u8) -> Result<Option<WorkerGuard>> {
    let log_level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cliprdr_x11_bridge={level},x11rb=info,warn",
            level = log_level
        ))
    });

    let format = config.logging.format.as_str();
    let mut layers: Vec<LogLayer> = vec![format_layer(format, std::io::stderr, true)];

    // If log file is specified, write to both stderr and file
    let guard = match &config.logging.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            layers.push(format_layer(format, writer, false));
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .init();

    if let Some(path) = &config.logging.log_file {
        info!("Logging to file: {}", path.display());
    }

    Ok(guard)
}
