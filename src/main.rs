//! costroute - cost-aware LLM routing
//!
//! Serves the router over HTTP and inspects configuration files.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use costroute::config::{Config, KeySource};
use costroute::registry::{Capability, ModelRegistry};

#[derive(Parser)]
#[command(name = "costroute")]
#[command(about = "Cost-aware routing across LLM providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured models, cheapest first
    Models {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Only models with this capability
        #[arg(long)]
        capability: Option<Capability>,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("costroute={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut cfg, key_sources) = Config::from_file_with_env(&config)?;
            init_tracing(&cfg.logging.level);
            tracing::info!(config = %config, "Loaded configuration");

            for (provider, source) in &key_sources {
                if *source == KeySource::None {
                    tracing::warn!(provider = %provider, "No API key configured");
                }
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            costroute::server::run_server(cfg).await
        }

        Commands::Check { config } => {
            init_tracing("warn");
            let (cfg, key_sources) = Config::from_file_with_env(&config)?;

            println!("Configuration OK: {}", config);
            println!("  listen:    {}", cfg.server.listen);
            println!("  providers: {}", cfg.providers.len());
            for (provider, source) in &key_sources {
                println!("    {:<20} key: {}", provider, source);
            }
            println!("  models:    {}", cfg.models.len());
            match cfg.budget.limit_usd {
                Some(limit) => println!(
                    "  budget:    ${:.2} {} ({})",
                    limit, cfg.budget.period, cfg.budget.mode
                ),
                None => println!("  budget:    none"),
            }
            Ok(())
        }

        Commands::Models { config, capability } => {
            init_tracing("warn");
            let (cfg, _) = Config::from_file_with_env(&config)?;
            let registry = ModelRegistry::from_models(cfg.model_descriptors())?;

            println!(
                "{:<28} {:<14} {:>12} {:>12} {:>10}  capabilities",
                "model", "provider", "in $/1k", "out $/1k", "context"
            );
            for model in registry.ranked(capability) {
                let caps: Vec<&str> = model.capabilities.iter().map(Capability::as_str).collect();
                println!(
                    "{:<28} {:<14} {:>12.6} {:>12.6} {:>10}  {}",
                    model.id,
                    model.provider,
                    model.price_per_1k_input,
                    model.price_per_1k_output,
                    model.max_context_tokens,
                    caps.join(",")
                );
            }
            Ok(())
        }
    }
}
