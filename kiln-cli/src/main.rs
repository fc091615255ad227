use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_core::Config;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Ordered, cacheable container image builder", long_about = None)]
struct Cli {
    /// Log filter (overrides the configured level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a Dockerfile or a preset
    Build {
        /// Build context directory
        #[arg(default_value = ".")]
        context: String,

        /// Image name and optional tag (name:tag)
        #[arg(short, long)]
        tag: Option<String>,

        /// Dockerfile path, relative to the context
        #[arg(short = 'f', long, default_value = "Dockerfile", conflicts_with = "preset")]
        file: String,

        /// Use a built-in plan instead of a Dockerfile
        #[arg(long)]
        preset: Option<String>,

        /// Build arguments (KEY=VALUE)
        #[arg(long = "build-arg")]
        build_arg: Vec<String>,

        /// Do not reuse cached layers
        #[arg(long)]
        no_cache: bool,
    },

    /// Validate a build plan and print it
    Plan {
        /// Build context directory
        #[arg(default_value = ".")]
        context: String,

        /// Dockerfile path, relative to the context
        #[arg(short = 'f', long, default_value = "Dockerfile", conflicts_with = "preset")]
        file: String,

        /// Use a built-in plan instead of a Dockerfile
        #[arg(long)]
        preset: Option<String>,

        /// Build arguments (KEY=VALUE)
        #[arg(long = "build-arg")]
        build_arg: Vec<String>,
    },

    /// Show an image's config, history and launch spec
    Inspect {
        /// Image name[:tag] or id prefix
        image: String,
    },

    /// List images
    Images,

    /// Remove an image tag
    Rmi {
        /// Image name[:tag] or id prefix
        image: String,
    },

    /// Manage the layer cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache usage
    Stats,

    /// Remove every cached layer
    Clear,
}

/// Parses `KEY=VALUE` pairs.
fn parse_build_args(args: &[String]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| {
            let parts: Vec<&str> = arg.splitn(2, '=').collect();
            if parts.len() != 2 || parts[0].is_empty() {
                return Err(anyhow::anyhow!("Invalid build arg format: {}", arg));
            }
            Ok((parts[0].to_string(), parts[1].to_string()))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    kiln_core::init_observability(&config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    tracing::debug!(data_dir = %config.data_dir, "Configuration loaded");

    match cli.command {
        Commands::Build { context, tag, file, preset, build_arg, no_cache } => {
            let build_args = parse_build_args(&build_arg)?;
            commands::build::build(
                &config,
                &context,
                tag.as_deref(),
                &file,
                preset.as_deref(),
                build_args,
                no_cache,
            )
            .await?;
        }

        Commands::Plan { context, file, preset, build_arg } => {
            let build_args = parse_build_args(&build_arg)?;
            commands::plan::plan(&context, &file, preset.as_deref(), build_args)?;
        }

        Commands::Inspect { image } => {
            commands::inspect::inspect(&config, &image)?;
        }

        Commands::Images => {
            commands::images::images(&config)?;
        }

        Commands::Rmi { image } => {
            commands::images::remove(&config, &image)?;
        }

        Commands::Cache(CacheCommands::Stats) => {
            commands::cache::stats(&config)?;
        }

        Commands::Cache(CacheCommands::Clear) => {
            commands::cache::clear(&config)?;
        }
    }

    Ok(())
}
