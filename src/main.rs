//! relayguard - local proxy relay manager
//!
//! Monitors each configured endpoint's upstream and fails over to a
//! fresh one from its provider when the upstream goes dead.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tracing::{error, info, warn};

use relayguard::{
    cli::{Cli, Command, ConfigCommand},
    config::Config,
    engine::SingBoxEngine,
    history::{FanoutHistory, HistorySink, JsonlHistory, MemoryHistory},
    monitor::{HttpProbe, MonitorRegistry},
    provider::ProviderRegistry,
    setup_tracing,
    upstream::Upstream,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Config(cmd)) => run_config_command(cmd, cli.config.as_deref()),
        Some(Command::ImportVless { uri, port }) => {
            run_import_vless(&uri, port, cli.config.as_deref())
        }
        Some(Command::Completions { shell }) => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "relayguard",
                &mut std::io::stdout(),
            );
            Ok(())
        }
        Some(Command::Serve) | None => run_server(cli.config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the monitoring daemon until ctrl-c
async fn run_server(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    info!(
        endpoints = config.endpoints.len(),
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let memory = Arc::new(MemoryHistory::new(config.history.memory_capacity));
    let history: Arc<dyn HistorySink> = match &config.history.file {
        Some(file) => {
            let jsonl = JsonlHistory::open(Path::new(file)).context("opening history file")?;
            Arc::new(FanoutHistory::new(vec![memory, Arc::new(jsonl)]))
        }
        None => memory,
    };

    let providers = ProviderRegistry::from_config(&config).context("building providers")?;
    let engine = Arc::new(SingBoxEngine::new(config.engine.clone()));

    let registry = MonitorRegistry::new(
        config,
        config_path,
        providers,
        engine,
        history,
        Arc::new(HttpProbe),
    );

    // A failed initial apply is not fatal: monitoring still runs and the
    // operator sees the failure in the log and in failed switch events.
    if let Err(e) = registry.apply_engine().await {
        error!(error = %e, "Initial engine apply failed; endpoints may not be listening");
    }

    registry.start_all();
    info!("relayguard running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    registry.stop_all().await;

    Ok(())
}

/// Configuration management commands
fn run_config_command(cmd: ConfigCommand, config_path: Option<&Path>) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Check => {
            let config = Config::load(config_path).context("loading configuration")?;
            println!(
                "Configuration OK: {} endpoint(s), {} provider(s)",
                config.endpoints.len(),
                config.providers.len()
            );
        }
        ConfigCommand::Show => {
            let config = Config::load(config_path).context("loading configuration")?;
            print!("{}", serde_yaml::to_string(&config)?);
        }
        ConfigCommand::Render => {
            let config = Config::load(config_path).context("loading configuration")?;
            let rendered = SingBoxEngine::render(&config.endpoints);
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        }
    }
    Ok(())
}

/// Import a vless:// link as an endpoint's upstream and persist it
fn run_import_vless(uri: &str, port: u16, config_path: Option<&Path>) -> anyhow::Result<()> {
    let path = config_path.context("--config is required for import-vless")?;
    let mut config = Config::load(Some(path)).context("loading configuration")?;

    let upstream = Upstream::from_vless_uri(uri).context("parsing vless uri")?;
    let addr = upstream.addr();
    config
        .set_upstream(port, Some(upstream))
        .with_context(|| format!("no endpoint listens on port {port}"))?;
    config.save(path).context("saving configuration")?;

    println!("Endpoint {port} now targets {addr}");
    warn!("Engine configuration not reloaded; restart the daemon or run serve to apply");
    Ok(())
}
