//! Binary entry point for the Veridex registry server.
#![forbid(unsafe_code)]

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use veridex::api::{ApiRequest, Method, Registry};
use veridex::config::ServerConfig;
use veridex::http;

#[derive(Parser, Debug)]
#[command(
    name = "veridex",
    version,
    about = "Hierarchical, versioned metadata registry",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create (or open) a registry store and optionally seed its model.
    Init {
        #[arg(value_name = "DB", help = "SQLite database file")]
        db_path: Option<PathBuf>,

        #[arg(long, help = "Registry id for a freshly created store")]
        registry_id: Option<String>,

        #[arg(long, value_name = "FILE", help = "JSON model source to install")]
        model: Option<PathBuf>,
    },
    /// Serve the registry over HTTP.
    Serve {
        #[arg(value_name = "DB", help = "SQLite database file")]
        db_path: Option<PathBuf>,

        #[arg(long, help = "Socket address to listen on")]
        listen: Option<String>,

        #[arg(long, help = "Registry id for a freshly created store")]
        registry_id: Option<String>,

        #[arg(long, help = "Absolute URL prefix emitted in responses")]
        base_url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    match cli.command {
        Command::Init {
            db_path,
            registry_id,
            model,
        } => {
            apply_overrides(&mut config, db_path, None, registry_id, None);
            let registry = Registry::open(&config.db_path, &config.registry_id)?;
            if let Some(model_path) = model {
                let source: serde_json::Value =
                    serde_json::from_str(&std::fs::read_to_string(&model_path)?)?;
                let response = registry.process(
                    ApiRequest::new(Method::Put, "modelsource").with_body(source),
                );
                if response.status >= 400 {
                    return Err(format!(
                        "model install failed: {}",
                        response
                            .body
                            .as_ref()
                            .and_then(|b| b.get("title"))
                            .and_then(|t| t.as_str())
                            .unwrap_or("unknown error")
                    )
                    .into());
                }
            }
            println!("registry ready at {}", config.db_path.display());
        }
        Command::Serve {
            db_path,
            listen,
            registry_id,
            base_url,
        } => {
            apply_overrides(&mut config, db_path, listen, registry_id, base_url);
            let addr: SocketAddr = config.listen.parse()?;
            let registry = Registry::open(&config.db_path, &config.registry_id)?
                .with_base_url(&config.base_url);
            http::serve(Arc::new(registry), addr).await?;
        }
    }
    Ok(())
}

fn apply_overrides(
    config: &mut ServerConfig,
    db_path: Option<PathBuf>,
    listen: Option<String>,
    registry_id: Option<String>,
    base_url: Option<String>,
) {
    if let Some(db_path) = db_path {
        config.db_path = db_path;
    }
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if let Some(registry_id) = registry_id {
        config.registry_id = registry_id;
    }
    if let Some(base_url) = base_url {
        config.base_url = base_url;
    }
}
