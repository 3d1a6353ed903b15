use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use runwarden::cli::{Cli, Commands};
use runwarden::config::{WardenConfig, WardenPaths};
use runwarden::error::Result;
use runwarden::exec::ExecOptions;
use runwarden::orchestrator::{Capabilities, Warden};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("runwarden=debug")
    } else {
        EnvFilter::new("runwarden=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let root = cli
        .state_dir
        .unwrap_or_else(|| std::path::PathBuf::from(".runwarden"));
    let paths = WardenPaths::new(root);
    let config = WardenConfig::load(&paths).await?;
    let warden = Warden::bootstrap(paths, config, Capabilities::default()).await?;

    let code = match cli.command {
        Commands::Run {
            command,
            args,
            timeout,
            idle_timeout,
            cache_key,
            no_wait,
            no_recovery,
        } => {
            let opts = ExecOptions {
                command_timeout: timeout.map(Duration::from_secs),
                idle_timeout: idle_timeout.map(Duration::from_secs),
                cache_key,
                wait_on_rate_limit: !no_wait,
                recovery: !no_recovery,
                ..ExecOptions::default()
            };
            match warden.run_command(&command, &args, &opts).await {
                Ok(outcome) => {
                    print!("{}", outcome.stdout);
                    eprint!("{}", outcome.stderr);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Batch {
            runner,
            files,
            show_order,
        } => {
            if show_order {
                for file in warden.planned_order(&files) {
                    println!("{}", file);
                }
                ExitCode::SUCCESS
            } else {
                let report = warden.run_batch(&runner, &files, &ExecOptions::default()).await;
                for item in &report.items {
                    let status = if item.success { "ok" } else { "FAILED" };
                    match &item.error {
                        Some(error) => println!("{:>6}  {}  ({})", status, item.file, error),
                        None => println!("{:>6}  {}  {}ms", status, item.file, item.duration_ms),
                    }
                }
                println!("{} passed, {} failed", report.passed, report.failed);
                if report.failed == 0 {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Stats => {
            let cache = warden.cache().stats();
            let counters = warden.history().counters();
            println!(
                "cache: {} entries, {} hits / {} misses ({} requests)",
                cache.size, cache.hits, cache.misses, cache.total_requests
            );
            println!(
                "history: {} files tracked, peak memory {} bytes",
                warden.history().tracked_files(),
                counters.peak_memory_bytes
            );
            ExitCode::SUCCESS
        }
    };

    warden.shutdown().await?;
    Ok(code)
}
