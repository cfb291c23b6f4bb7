// Host binary: validates experiment configs and ticks their steps
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use std::io::stderr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

use crucible_control::{
    HttpIsolationClient, HttpIsolationConfig, TokioProcessRunner, TracingDiagnosticsSink,
};
use crucible_core::{
    CancellationToken, ExecutionStatus, RedbStateStore, StateStore, StepContext, StepDependencies,
};

mod config;
use config::HostConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Crucible hardware experiment steps", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered step types
    Steps,
    /// Check a host config and every step definition in it
    Validate {
        config: PathBuf,
    },
    /// Tick every unfinished step of the experiment once
    Tick {
        config: PathBuf,

        /// Only tick this step
        #[arg(long)]
        step: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "crucible={level},crucible_core={level},crucible_steps={level},crucible_control={level},reqwest=warn,hyper=warn",
        level = level
    );
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    let steps = crucible_steps::create_registry();

    match cli.command {
        Commands::Steps => {
            for step_type in steps.step_types() {
                println!("{}", step_type);
            }
        }
        Commands::Validate { config } => {
            let host = HostConfig::from_file(&config)?;
            host.validate_steps(&steps)?;
            println!(
                "{}: experiment {} with {} step(s) is valid",
                config.display(),
                host.experiment.id,
                host.steps.len()
            );
        }
        Commands::Tick { config, step } => {
            let host = HostConfig::from_file(&config)?;
            host.validate_steps(&steps)?;
            tick(&host, &steps, step.as_deref()).await?;
        }
    }

    Ok(())
}

async fn tick(
    host: &HostConfig,
    steps: &crucible_core::StepRegistry,
    only: Option<&str>,
) -> Result<()> {
    let mut isolation = HttpIsolationConfig::new(host.control_plane.url.as_str()).with_call_timeout(
        std::time::Duration::from_secs(host.control_plane.call_timeout_secs),
    );
    if let Some(token) = &host.control_plane.token {
        isolation = isolation.with_token(token.as_str());
    }

    let deps = StepDependencies::new()
        .with_isolation(Arc::new(HttpIsolationClient::new(isolation)?))
        .with_process_runner(Arc::new(TokioProcessRunner::new()))
        .with_diagnostics(Arc::new(TracingDiagnosticsSink))
        .with_diagnostics_lookback(host.diagnostics.lookback());

    let store: Arc<dyn StateStore> = Arc::new(
        RedbStateStore::open(&host.state.path)
            .wrap_err_with(|| format!("failed to open {}", host.state.path.display()))?,
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, no further steps will be ticked");
            on_interrupt.cancel();
        }
    });

    let mut faults = 0;
    for definition in &host.steps {
        if only.is_some_and(|id| id != definition.id) {
            continue;
        }

        let step = steps.build_configured(definition, &deps)?;
        let mut ctx = StepContext::new(host.experiment.id.as_str(), definition.id.as_str(), store.clone())
            .with_diagnostics(host.diagnostics.enabled);
        if let Some(group) = &definition.group {
            ctx = ctx.with_group(group.as_str());
        }

        match step.execute(&ctx, &cancel).await {
            Ok(result) => {
                match &result.error {
                    Some(err) => println!("{}\t{}\t{}", definition.id, result.status, err),
                    None => println!("{}\t{}", definition.id, result.status),
                }
                if result.status == ExecutionStatus::Cancelled {
                    warn!("Tick interrupted");
                    break;
                }
            }
            Err(e) => {
                error!(step = %definition.id, error = %e, "Step fault");
                println!("{}\tfault\t{}", definition.id, e);
                faults += 1;
            }
        }
    }

    if faults > 0 {
        return Err(eyre!("{} step(s) hit a fault", faults));
    }
    Ok(())
}
