//! integration-hub - run declarative batch integration flows
//!
//! # Usage
//!
//! ```bash
//! # Run every enabled flow once
//! integration-hub -c integration.yaml run
//!
//! # Run a single flow
//! integration-hub -c integration.yaml run --flow nightly-claims
//!
//! # Validate configuration and flow wiring
//! integration-hub -c integration.yaml validate
//!
//! # Print the configuration JSON schema
//! integration-hub schema
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use integration_hub::{Bootstrap, FlowResult, IntegrationConfig, IntegrationEngine};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "integration-hub")]
#[command(version, about = "Declarative batch integration flows")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "integration.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run enabled flows once (default)
    Run {
        /// Run only this flow
        #[arg(long)]
        flow: Option<String>,
    },
    /// Validate configuration and flow wiring
    Validate,
    /// List configured flows
    Flows,
    /// Print the JSON schema of the configuration file
    Schema,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dispatch(cli)
}

/// Dispatch a subcommand; only the commands that need it load the config file
fn dispatch(cli: Cli) -> Result<()> {
    let load_config = || {
        IntegrationConfig::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))
    };

    match cli.command.unwrap_or(Commands::Run { flow: None }) {
        Commands::Schema => show_schema(),
        Commands::Run { flow } => {
            let config = load_config()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name(config.engine.thread_name_prefix.clone())
                .build()
                .context("Failed to start runtime")?;
            runtime.block_on(run(config, flow))
        }
        Commands::Validate => validate_config(load_config()?),
        Commands::Flows => list_flows(&load_config()?),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(config: IntegrationConfig, flow: Option<String>) -> Result<()> {
    let bootstrap = Bootstrap::from_config(&config).context("Failed to build engine")?;
    let engine = bootstrap.engine.clone();

    let results = tokio::select! {
        results = execute(&engine, flow) => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling running flows");
            engine.shutdown();
            return Err(anyhow::anyhow!("interrupted"));
        }
    };

    let stats = engine.statistics();
    info!(
        "Finished: {} execution(s), {} succeeded, {} failed, {} error(s) recorded",
        stats.total_executions, stats.successful_executions, stats.failed_executions, stats.total_errors
    );
    for breaker in bootstrap.breakers.all_metrics() {
        info!("Circuit breaker '{}' is {:?}", breaker.name, breaker.state);
    }
    engine.shutdown();

    let failed: Vec<&FlowResult> = results.iter().filter(|r| !r.success).collect();
    if !failed.is_empty() {
        anyhow::bail!(
            "{} flow(s) failed: {}",
            failed.len(),
            failed.iter().map(|r| r.flow_name.as_str()).collect::<Vec<_>>().join(", ")
        );
    }
    Ok(())
}

async fn execute(engine: &IntegrationEngine, flow: Option<String>) -> Vec<FlowResult> {
    let results = match flow {
        Some(name) => vec![engine.execute_flow(&name).await],
        None => engine.execute_all_flows().await,
    };
    for result in &results {
        if result.success {
            info!(
                "Flow '{}' {:?}: read {}, processed {}, failed {} in {:?}{}",
                result.flow_name,
                result.state,
                result.records_read,
                result.records_processed,
                result.records_failed,
                result.duration,
                if result.partial { " (partial)" } else { "" }
            );
        } else {
            error!("Flow '{}' {:?}: {}", result.flow_name, result.state, result.message);
        }
    }
    results
}

fn validate_config(config: IntegrationConfig) -> Result<()> {
    let bootstrap = Bootstrap::from_config(&config).context("Failed to build engine")?;
    let engine = &bootstrap.engine;

    println!("✓ Configuration valid!\n");
    println!("Engine:");
    println!("  Worker pool size: {}", config.engine.worker_pool_size);
    match config.engine.max_queue {
        Some(max) => println!("  Max queue: {}", max),
        None => println!("  Max queue: unbounded"),
    }
    println!();

    println!("Components:");
    println!("  Schemas: {}", config.schemas.len());
    println!("  Inputs: {}", engine.registry().input_names().join(", "));
    println!("  Transformers: {}", engine.registry().transformer_names().join(", "));
    println!("  Outputs: {}", engine.registry().output_names().join(", "));
    println!("  Credentials: {}", bootstrap.credentials.names().join(", "));
    println!();

    println!("Flows:");
    let mut invalid = 0;
    for name in engine.registry().flow_names() {
        let result = engine.validate_flow(&name);
        if result.is_valid() {
            println!("  ✓ {}", name);
        } else {
            invalid += 1;
            println!("  ✗ {}", name);
        }
        for e in &result.errors {
            println!("      error: {}", e);
        }
        for w in &result.warnings {
            println!("      warning: {}", w);
        }
    }

    if invalid > 0 {
        anyhow::bail!("{} flow(s) failed validation", invalid);
    }
    Ok(())
}

fn list_flows(config: &IntegrationConfig) -> Result<()> {
    if config.flows.is_empty() {
        println!("No flows configured");
        return Ok(());
    }
    println!("{:<30} {:<8} {:<10} PIPELINE", "NAME", "ENABLED", "CONCURRENT");
    for flow in &config.flows {
        let mut stages = vec![flow.inputs.join(",")];
        if !flow.transformers.is_empty() {
            stages.push(flow.transformers.join(","));
        }
        stages.push(flow.outputs.join(","));
        println!(
            "{:<30} {:<8} {:<10} {}",
            flow.name,
            if flow.enabled { "yes" } else { "no" },
            flow.max_concurrent,
            stages.join(" -> ")
        );
    }
    Ok(())
}

fn show_schema() -> Result<()> {
    let schema = schemars::schema_for!(IntegrationConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_needs_no_config_file() {
        let cli = Cli::try_parse_from(["integration-hub", "--config", "/nonexistent/hub.yaml", "schema"]).unwrap();
        dispatch(cli).unwrap();
    }

    #[test]
    fn test_flows_reports_missing_config_file() {
        let cli = Cli::try_parse_from(["integration-hub", "--config", "/nonexistent/hub.yaml", "flows"]).unwrap();
        let err = dispatch(cli).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }
}
