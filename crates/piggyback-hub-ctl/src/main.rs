//! piggyback-hub-ctl: inspect and distribute piggyback hub routing configs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use hub_core::paths::routing_config_path;
use hub_core::{store, HubSettings};
use hub_services::{AmqpConnector, Connector};
use piggyback_hubd::distribute::{distribute, read_site_configs};

#[derive(Parser)]
#[command(name = "piggyback-hub-ctl", version, about = "Piggyback hub routing configuration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the routing config persisted on this site.
    Show {
        omd_root: PathBuf,
    },
    /// Send routing configs to sites.
    Distribute {
        omd_root: PathBuf,
        omd_site: String,
        /// JSON file: {"<site>": {"locations": {"<host>": "<site>"}}}
        file: PathBuf,
        /// Send current piggyback data once instead of replacing the stored config.
        #[arg(long)]
        oneshot: bool,
    },
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

fn cmd_show(omd_root: &Path) -> Result<()> {
    let path = routing_config_path(omd_root);
    let config = store::load(&path)?;

    println!("═══════════════════════════════════════");
    println!("  Piggyback Hub Routing");
    println!("═══════════════════════════════════════");
    println!("  File  : {}", path.display());
    println!("  Hosts : {}", config.locations.len());
    if config.locations.is_empty() {
        println!("\n  All piggybacked hosts stay local.");
        return Ok(());
    }
    println!();
    for (host, site) in &config.locations {
        println!("  {host} → {site}");
    }
    Ok(())
}

async fn cmd_distribute(omd_root: &Path, omd_site: &str, file: &Path, oneshot: bool) -> Result<()> {
    let configs = read_site_configs(file)?;
    let settings = HubSettings::load(omd_root)?;
    let connector = AmqpConnector::new(omd_root, omd_site, &settings.broker);
    let channel = connector.connect().await.context("cannot reach the site broker")?;

    let sent = distribute(channel.as_ref(), omd_site, &configs, oneshot).await?;
    let kind = if oneshot { "one-shot" } else { "persisted" };
    for site in &sent {
        let hosts = configs.get(site).map_or(0, |c| c.locations.len());
        println!("  {site}: {kind} config with {hosts} hosts sent");
    }
    println!("Sent {} routing configs.", sent.len());
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Show { omd_root } => cmd_show(&omd_root),
        Command::Distribute {
            omd_root,
            omd_site,
            file,
            oneshot,
        } => cmd_distribute(&omd_root, &omd_site, &file, oneshot).await,
    }
}
