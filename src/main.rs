use clap::Parser;
use ecgateway_metrics::config::AppConfig;
use ecgateway_metrics::driver::{self, FailurePolicy, OutputFormat, RunOptions};
use ecgateway_metrics::export::MetricNaming;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Count completed ECConnect jobs and their execution time in a gateway
/// log, reporting only what was appended since the previous run.
#[derive(Parser, Debug)]
#[command(name = "ecgateway-metrics", version, about)]
pub struct Cli {
    /// Gateway log file (overrides config)
    #[arg(value_name = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Config file path
    #[arg(short, long, default_value = "ecgateway.toml")]
    config: PathBuf,

    /// Offset state file (overrides config)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Metric name prefix (overrides config)
    #[arg(long)]
    prefix: Option<String>,

    /// Metric name suffix (overrides config)
    #[arg(long)]
    suffix: Option<String>,

    /// Output format (overrides config)
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Stop at the first undecodable line instead of skipping it
    #[arg(long)]
    abort_on_error: bool,

    /// Ignore the saved offset and read the whole log
    #[arg(long)]
    from_start: bool,

    /// Print readings but don't save the new offset
    #[arg(long)]
    dry_run: bool,

    /// Log every decoded event
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load(&cli.config)?;

    let log_file = cli
        .log_file
        .or(config.source.log_file)
        .ok_or("no log file given on the command line or in [source] log_file")?;

    let policy = if cli.abort_on_error {
        FailurePolicy::Abort
    } else {
        config.batch.on_error
    };

    let opts = RunOptions {
        log_file,
        state_file: cli.state_file.unwrap_or(config.source.state_file),
        policy,
        naming: MetricNaming::new(
            cli.prefix.or(Some(config.metrics.prefix)),
            cli.suffix.or(Some(config.metrics.suffix)),
        ),
        from_start: cli.from_start,
        dry_run: cli.dry_run,
    };

    let outcome = driver::run(&opts)?;
    let format = cli.format.unwrap_or(config.metrics.format);

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(driver::render(&outcome.readings, format).as_bytes())?;
    stdout.flush()?;

    if !outcome.summary.failures.is_empty() {
        tracing::warn!(
            failures = outcome.summary.failures.len(),
            "some lines could not be decoded"
        );
    }
    Ok(())
}
