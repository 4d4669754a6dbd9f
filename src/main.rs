use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use edgewatch::{EdgewatchConfig, EdgewatchOrchestrator, RunOutcome};

/// Pause between tearing a failed pipeline down and building the next one
const RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "edgewatch")]
#[command(about = "Edge video analytics: motion-driven detection, tracking and review segments")]
#[command(version)]
#[command(long_about = "Reads decoded frames from one or more cameras, runs object detection \
only where motion or tracked objects call for it, tracks objects across frames and groups \
activity into review segments. Intended to run as a long-lived systemd service.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "edgewatch.toml", help = "Path to TOML configuration file")]
    config: PathBuf,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the pipeline")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write daily rotated log files here
    #[arg(long, value_name = "DIR", help = "Directory for daily rotated log files")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&args)?;

    info!("Starting edgewatch v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config.display());

    if args.validate_config {
        let config = load_config(&args)?;
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    loop {
        // Every pass rereads the file so a restart picks up edits
        let config = load_config(&args)?;

        let mut orchestrator = EdgewatchOrchestrator::new(config, Some(args.config.clone()))
            .map_err(|e| {
                error!("Failed to create orchestrator: {}", e);
                e
            })?;

        if let Err(e) = orchestrator.start().await {
            error!("Failed to start pipeline: {}", e);
            let exit_code = orchestrator.shutdown().await.unwrap_or(1);
            warn!("Partially started pipeline stopped with code {}", exit_code);
            if !e.is_transient() {
                return Err(e.into());
            }
            tokio::time::sleep(RESTART_DELAY).await;
            continue;
        }

        let outcome = orchestrator.run().await.map_err(|e| {
            error!("Pipeline error during execution: {}", e);
            e
        })?;

        match outcome {
            RunOutcome::Exit(exit_code) => {
                info!("Edgewatch exited with code: {}", exit_code);
                // Exit with appropriate code for systemd
                std::process::exit(exit_code);
            }
            RunOutcome::Restart(reason) => {
                warn!("Restarting pipeline: {}", reason);
                tokio::time::sleep(RESTART_DELAY).await;
            }
        }
    }
}

fn load_config(args: &Args) -> Result<EdgewatchConfig> {
    match EdgewatchConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config.display());
            Ok(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            Err(e.into())
        }
    }
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("edgewatch={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "edgewatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .try_init()?;

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Edgewatch Configuration File");
    println!("# Default values for every option. Cameras are added as [cameras.<name>] tables:");
    println!("#");
    println!("# [cameras.front]");
    println!("# ffmpeg = {{ input = \"rtsp://10.0.0.2/stream\" }}");
    println!("# detect = {{ width = 1280, height = 720, fps = 5 }}");
    println!();
    println!("{}", EdgewatchConfig::default().to_toml()?);
    Ok(())
}
