use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;
use service_orchestrator::{Orchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "service-orchestrator")]
#[command(about = "Provision, start and invoke locally hosted services")]
struct Cli {
    /// Path to orchestrator.json (otherwise ORCHESTRATOR_CONFIG, XDG config, ./orchestrator.json)
    #[arg(long, global = true, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST server
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
    /// List discovered services
    List,
    /// Report whether a service's environment is ready
    Check { name: String },
    /// Create the service's isolated runtime
    Provision { name: String },
    /// Install and verify the service's dependencies
    Install { name: String },
    /// Start a service, invoke it once, then stop it
    Run {
        name: String,
        /// JSON params object for the service's first route
        #[arg(long, default_value = "{}")]
        params: String,
        /// JSON object of environment overrides
        #[arg(long)]
        env: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("service_orchestrator=info".parse()?)
                .add_directive("hyper=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(path)?,
        None => OrchestratorConfig::load()?,
    };
    info!("Services directory: {}", config.services_dir.display());
    let orchestrator = Orchestrator::from_config(config)?;

    match cli.command {
        Commands::Serve { bind } => {
            let shared = Arc::new(orchestrator);
            let app = service_orchestrator::api::create_router(shared.clone());

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("REST server listening on http://{}", bind);

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutdown requested");
                })
                .await?;

            shared.stop_all().await;
        }
        Commands::List => {
            let services = orchestrator.list_services();
            println!("Found {} services:", services.len());
            for service in services {
                let name = service.name.as_str();
                println!(
                    "  {} {} [{}]",
                    name,
                    service.version.as_deref().unwrap_or("-"),
                    if orchestrator.validate_service(name) { "ok" } else { "incomplete" }
                );
                for route in &service.api_routes {
                    println!("    {} {}", route.method, route.path);
                }
            }
        }
        Commands::Check { name } => {
            let status = orchestrator.check_environment(&name).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Provision { name } => {
            let handle = orchestrator.provision(&name).await?;
            println!("Runtime ready at {}", handle.root.display());
        }
        Commands::Install { name } => {
            if !orchestrator.install_dependencies(&name).await {
                bail!("dependency installation for `{}` failed", name);
            }
            println!("Dependencies for {} installed and verified", name);
        }
        Commands::Run { name, params, env } => {
            let params: Value = serde_json::from_str(&params).context("--params must be JSON")?;
            let overrides: Map<String, Value> = match env {
                Some(raw) => serde_json::from_str(&raw).context("--env must be a JSON object")?,
                None => Map::new(),
            };

            let report = orchestrator.start(&name, &overrides).await?;
            info!("{}", report.message);

            let result = orchestrator.execute(&name, &params).await;
            if !orchestrator.stop(&name).await {
                warn!("Service {} was not registered at shutdown", name);
            }
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
    }

    Ok(())
}
