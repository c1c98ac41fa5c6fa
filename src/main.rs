use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use fleetcc::config::{ClientConfig, EnvironmentConfig, ToolchainConfig};
use fleetcc::error::{BuildError, EXIT_DISTCC_FAILED};
use fleetcc::job::{CompileJob, Language};
use fleetcc::local::LocalCompiler;
use fleetcc::remote::{BuildReport, RedundancyCoordinator, StdStreams};
use fleetcc::transport::FramedChannel;

#[derive(Parser, Debug)]
#[command(name = "fleetcc")]
#[command(version)]
#[command(about = "Compile one translation unit on the build fleet, falling back to a local build")]
struct Args {
    /// Scheduler address (host:port)
    #[arg(long, env = "FLEETCC_SCHEDULER", default_value = "127.0.0.1:8765")]
    scheduler: String,

    /// Environment archive shipped to workers that lack it (name.tar.bz2)
    #[arg(long, env = "FLEETCC_VERSION")]
    env_archive: Option<PathBuf>,

    /// Number of copies of the job to run; only the first is visible
    #[arg(long, default_value = "1")]
    redundancy: u32,

    /// Source language (guessed from the input extension if omitted)
    #[arg(long)]
    language: Option<Language>,

    /// Chunk size for streamed payloads, in bytes
    #[arg(long, default_value = "100000")]
    chunk_size: usize,

    /// How to print the per-copy report
    #[arg(long, value_enum, default_value = "off")]
    report: ReportFormat,

    /// Object file to produce
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Source file to compile
    input: PathBuf,

    /// Compiler and flags, e.g. `-- gcc -O2 -Wall`
    #[arg(last = true)]
    compiler: Vec<String>,
}

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, ValueEnum)]
enum ReportFormat {
    Off,
    Text,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn client_config(args: &Args) -> ClientConfig {
    let toolchain = match args.compiler.split_first() {
        Some((program, flags)) => ToolchainConfig::new(program.clone(), flags.iter().cloned()),
        None => ToolchainConfig::default(),
    };
    let environment = match &args.env_archive {
        Some(archive) => EnvironmentConfig::from_archive(archive.clone()),
        None => EnvironmentConfig::default(),
    };

    ClientConfig::default()
        .with_scheduler(args.scheduler.clone())
        .with_environment(environment)
        .with_redundancy(args.redundancy)
        .with_chunk_size(args.chunk_size)
        .with_toolchain(toolchain)
}

fn print_report(report: &BuildReport, format: &ReportFormat) -> Result<(), serde_json::Error> {
    match format {
        ReportFormat::Off => {}
        ReportFormat::Json => eprintln!("{}", serde_json::to_string_pretty(report)?),
        ReportFormat::Text => {
            for copy in &report.copies {
                let status = copy
                    .status
                    .map_or_else(|| "unknown".to_string(), |s| s.to_string());
                eprintln!(
                    "file {} compiled with {} on {}{}",
                    copy.output.display(),
                    status,
                    copy.worker,
                    copy.fallback
                        .as_ref()
                        .map(|kind| format!(" (local fallback after {kind})"))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

/// Remote build with this binary's own fallback policy for the single-copy path.
async fn run(args: Args) -> Result<i32, Box<dyn std::error::Error>> {
    let config = client_config(&args);
    let language = match args.language.or_else(|| Language::from_path(&args.input)) {
        Some(language) => language,
        None => {
            eprintln!(
                "Error: cannot tell the language of {}; pass --language",
                args.input.display()
            );
            return Ok(2);
        }
    };

    let job = CompileJob::new(&args.input, &args.output, language)
        .with_remote_flags(config.toolchain.args.iter().cloned());
    let local = Arc::new(config.toolchain.local_compiler());

    let mut scheduler = match TcpStream::connect(&config.scheduler_addr).await {
        Ok(stream) => FramedChannel::new(stream),
        Err(e) => {
            tracing::warn!(scheduler = %config.scheduler_addr, error = %e, "Scheduler unreachable, compiling locally");
            return Ok(local.compile(&job, Some(&StdStreams)).await);
        }
    };

    let coordinator = RedundancyCoordinator::new(&config, local.clone());
    match coordinator.build_remote(&mut scheduler, job.clone()).await {
        Ok(report) => {
            print_report(&report, &args.report)?;
            Ok(report.status)
        }
        Err(e @ BuildError::OutputWriteFailed { .. }) => {
            tracing::error!(error = %e, "Could not install the compiled object");
            Ok(EXIT_DISTCC_FAILED)
        }
        Err(e) => {
            tracing::warn!(error = %e, kind = e.kind(), "Remote build failed, compiling locally");
            Ok(local.compile(&job, Some(&StdStreams)).await)
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so compiler output on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let status = run(args).await?;
    std::process::exit(status);
}
