use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// A3S FaaS — function-as-a-service gate
#[derive(Parser)]
#[command(name = "a3s-faas", version, about)]
struct Cli {
    /// Path to configuration file (.hcl)
    #[arg(short, long, default_value = "gate.hcl")]
    config: String,

    /// Override listen address (e.g., 0.0.0.0:8686)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without starting the gate
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long, default_value = "gate.hcl")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> a3s_faas::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Validate { config: config_path }) = &cli.command {
        return validate_config(config_path).await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("A3S FaaS v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "Loading configuration");
        a3s_faas::config::GateConfig::from_file(&cli.config).await?
    } else {
        tracing::warn!("Config file not found, using defaults");
        a3s_faas::config::GateConfig::default()
    };

    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }

    let gate = Arc::new(a3s_faas::Gate::new(config.clone())?);
    gate.start().await?;

    tracing::info!("Gate ready — press Ctrl+C to stop");

    if config.watch {
        let watcher = a3s_faas::config::FileWatcher::new(&cli.config);
        match watcher.watch() {
            Ok(mut rx) => {
                let gate = gate.clone();
                let listen = cli.listen.clone();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        match event.config {
                            Ok(mut new_config) => {
                                if let Some(listen) = &listen {
                                    new_config.listen = listen.clone();
                                }
                                tracing::info!(
                                    path = %event.trigger_path.display(),
                                    "Config change detected, reloading"
                                );
                                if let Err(e) = gate.reload(new_config).await {
                                    tracing::error!(error = %e, "Hot reload failed");
                                }
                            }
                            Err(e) => {
                                tracing::error!(
                                    error = %e,
                                    path = %event.trigger_path.display(),
                                    "Config reload failed, keeping current config"
                                );
                            }
                        }
                    }
                });
                tracing::info!("Hot reload enabled");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to start file watcher, hot reload disabled");
            }
        }
    }

    gate.wait_for_shutdown().await;

    Ok(())
}

/// Validate a configuration file and print a summary
async fn validate_config(path: &str) -> a3s_faas::Result<()> {
    if !std::path::Path::new(path).exists() {
        eprintln!("✗ Config file not found: {}", path);
        std::process::exit(1);
    }

    let config = match a3s_faas::config::GateConfig::from_file(path).await {
        Ok(c) => {
            println!("✓ Config parsed successfully ({})", path);
            c
        }
        Err(e) => {
            eprintln!("✗ Parse error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        std::process::exit(1);
    }

    println!("✓ Configuration is valid");
    println!();
    println!("  Listen:       {}", config.listen);
    println!(
        "  Orchestrator: {} ({})",
        config.scaling.executor, config.scaling.url
    );
    println!("  Max replicas: {}", config.runtime.max_replicas);
    let catalog = a3s_faas::config::RuntimeCatalog::from_config(&config.runtime);
    println!("  Languages:    {}", catalog.len());
    for (name, info) in catalog.iter() {
        if info.build {
            println!("    - {} (build: {})", name, info.build_cmd.join(" "));
        } else {
            println!("    - {}", name);
        }
    }
    println!("  Auth contexts: {}", config.auth.contexts.len());
    if config.watch {
        println!("  Hot reload:   enabled");
    }

    Ok(())
}
