use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kiln::config::Config;
use kiln::extension::{abi, CandidateOutcome, ExtensionLoader, ScanReport};
use kiln::host::{parse_request, register_builtin_routes, respond, spawn_line_reader};
use kiln::registry::ExtensionRegistry;

/// Kiln - API host that extends itself with dynamically loaded extensions
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Directory to load extensions from (overrides the configuration)
    #[arg(short, long)]
    plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Load extensions, then answer `<route> [key=value ...]` requests read from stdin
    Serve,
    /// Load extensions, print what was loaded and which routes exist, then exit
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::load_from_file(config_path)?
    } else {
        Config::load_default()?
    };

    // Logs go to stderr; stdout carries responses
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("Invalid log level '{}'", config.log_level))?
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    // Extensions look these up at runtime; keep them in the binary
    std::hint::black_box(abi::host_exports());

    let registry = Arc::new(ExtensionRegistry::new(config.extensions.duplicate_policy));
    register_builtin_routes(&registry).context("Failed to register built-in routes")?;

    let mut loader = ExtensionLoader::new(Arc::clone(&registry))
        .with_init_warning(config.extensions.init_warn_after());
    let plugin_dir = args
        .plugin_dir
        .clone()
        .unwrap_or_else(|| config.extensions.dir.clone());

    let result = match args.command.unwrap_or(Command::Serve) {
        Command::List => {
            let report = loader.scan_detailed(&plugin_dir);
            print_report(&report, &registry);
            Ok(())
        }
        Command::Serve => {
            loader.scan(&plugin_dir);
            serve(Arc::clone(&registry)).await
        }
    };

    loader.unload_all();
    result
}

/// Answer request lines from stdin until EOF or Ctrl-C
async fn serve(registry: Arc<ExtensionRegistry>) -> Result<()> {
    info!("Serving {} route(s), reading requests from stdin", registry.len());

    // Not tokio's stdin: its pending read keeps the runtime alive after Ctrl-C
    let mut lines = spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
        .context("Failed to start request reader")?;
    let mut stdout = tokio::io::stdout();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line.transpose().context("Failed to read request")? else {
                    info!("Input closed, shutting down");
                    break;
                };
                let Some(request) = parse_request(&line) else {
                    continue;
                };

                // Handlers may be foreign code that blocks
                let registry = Arc::clone(&registry);
                let val = tokio::task::spawn_blocking(move || respond(&registry, &request))
                    .await
                    .context("Request handler task failed")?;

                stdout.write_all(format!("{val}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                info!("Interrupt received, shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn print_report(report: &ScanReport, registry: &ExtensionRegistry) {
    println!("Extension directory: {}", report.dir.display());

    if report.candidates.is_empty() {
        println!("  (no extensions)");
    }
    for candidate in &report.candidates {
        match &candidate.outcome {
            CandidateOutcome::Loaded { routes } => {
                println!("  loaded   {} ({} route(s))", candidate.path.display(), routes.len());
            }
            CandidateOutcome::AlreadyLoaded => {
                println!("  skipped  {} (already loaded)", candidate.path.display());
            }
            CandidateOutcome::Failed(e) => {
                println!("  failed   {}: {}", candidate.path.display(), e);
            }
        }
    }

    println!("Routes:");
    for (name, origin) in registry.routes() {
        println!("  {name:<40} {origin}");
    }
}
