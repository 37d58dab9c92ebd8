mod cli;
mod cmd;
mod config_gen;
mod progress;
mod signal;

use std::sync::Arc;

use clap::Parser;

use sluice_core::api::rest::RestEndpoint;
use sluice_core::api::UploadEndpoint;
use sluice_core::config::{load_config, ServerConfig, SluiceConfig};
use sluice_core::error::{Result, SluiceError};

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    // Initialize logging from -v count.
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // `config` needs no configuration file.
    if let Commands::Config { dest } = &cli.command {
        if let Err(e) = config_gen::run(dest.as_deref()) {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        return;
    }

    if let Err(e) = dispatch(&cli) {
        if e.is_cancelled() {
            eprintln!("Interrupted.");
            std::process::exit(130);
        }
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn dispatch(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Upload {
            server,
            token,
            chunk_size_mib,
            concurrency,
            no_resume_cache,
            paths,
        } => {
            let config = resolve_config(cli, server.as_deref(), token.as_deref())?;
            cmd::upload::run(
                config,
                paths,
                *chunk_size_mib,
                concurrency.map(|n| n as usize),
                *no_resume_cache,
            )
        }
        Commands::Hash {
            chunk_size_mib,
            paths,
        } => cmd::hash::run(paths, *chunk_size_mib),
        Commands::Tasks { server, clear } => {
            let endpoint = endpoint_for(cli, server.as_deref())?;
            cmd::tasks::run(endpoint.as_ref(), *clear)
        }
        Commands::Stats { server } => {
            let endpoint = endpoint_for(cli, server.as_deref())?;
            cmd::stats::run(endpoint.as_ref())
        }
        Commands::Cancel {
            server,
            file_hash,
            file_name,
        } => {
            let endpoint = endpoint_for(cli, server.as_deref())?;
            cmd::cancel::run(endpoint.as_ref(), file_hash, file_name)
        }
        Commands::Chunks {
            server,
            file_hash,
            file_name,
        } => {
            let endpoint = endpoint_for(cli, server.as_deref())?;
            cmd::tasks::run_chunks(endpoint.as_ref(), file_hash, file_name)
        }
        Commands::Config { .. } => unreachable!("handled in main"),
    }
}

/// Resolve configuration: explicit file, environment, working directory,
/// or a minimal config built from --server.
fn resolve_config(cli: &Cli, server: Option<&str>, token: Option<&str>) -> Result<SluiceConfig> {
    let explicit = cli
        .config
        .clone()
        .or_else(|| std::env::var("SLUICE_CONFIG").ok());

    let mut config = if let Some(path) = explicit {
        load_config(std::path::Path::new(&path))?
    } else if std::path::Path::new("sluice.yaml").exists() {
        load_config(std::path::Path::new("sluice.yaml"))?
    } else if let Some(url) = server {
        SluiceConfig {
            server: ServerConfig::new(url),
            transfer: Default::default(),
            pool: Default::default(),
            cache_dir: None,
        }
    } else {
        return Err(SluiceError::Config(
            "no configuration found; pass --server <url>, --config <path>, \
             or run `sluice config` to generate one"
                .into(),
        ));
    };

    if let Some(url) = server {
        config.server.base_url = url.to_string();
    }
    if let Some(token) = token.map(str::to_string).or_else(|| std::env::var("SLUICE_TOKEN").ok()) {
        config.server.access_token = Some(token);
    }
    config.validate()?;
    Ok(config)
}

fn endpoint_for(cli: &Cli, server: Option<&str>) -> Result<Arc<dyn UploadEndpoint>> {
    let config = resolve_config(cli, server, None)?;
    Ok(Arc::new(RestEndpoint::new(&config.server)?))
}
