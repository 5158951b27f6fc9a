//! mocap_chords: listen for capture data, play chords on beats.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use mocap_chords::app::{build_output, App};
use mocap_chords::config::{AppConfig, OutputBackend};

#[derive(Parser, Debug)]
#[command(name = "mocap_chords", version, about = "Motion-capture beats to microtonal chords")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(short, long)]
    verbose: bool,

    /// Override [transport] listen address
    #[arg(long)]
    listen: Option<String>,

    /// Override [output] send address
    #[arg(long)]
    send: Option<String>,

    /// Override [output] backend (osc, null, midi)
    #[arg(long)]
    backend: Option<OutputBackend>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut cfg = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(listen) = &cli.listen {
        cfg.transport.listen = listen.clone();
    }
    if let Some(send) = &cli.send {
        cfg.output.send = send.clone();
    }
    if let Some(backend) = cli.backend {
        cfg.output.backend = backend;
    }
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = load_config(&cli)?;
    if cli.print_config {
        print!("{}", cfg.to_toml().context("serialising configuration")?);
        return Ok(());
    }

    let output = build_output(&cfg).context("opening output backend")?;
    let app = App::new(&cfg, output).context("building pipeline")?;
    app.run().await.context("receive loop")?;
    Ok(())
}
