use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use guild_audio::cache_index::CacheIndex;
use guild_audio::config::{self, AudioConfig};
use guild_audio::resolver::{YtDlpResolver, resolve_request};

#[derive(Parser, Debug)]
#[command(name = "guild-audio", about = "Maintenance tool for the guild audio cache")]
struct Args {
    /// Optional config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or maintain the artifact cache
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Look up a track by URL or search text and print it as JSON
    Resolve {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Load the index, drop invalid entries and report
    Verify,
    /// Print all entries as JSON
    List,
    /// Print entry count and total size
    Stats,
    /// Delete every cached artifact
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,guild_audio=info")),
        )
        .init();

    let cfg = load_config(args.config.as_ref())?;
    match args.command {
        Command::Cache(command) => run_cache(&cfg, command).await,
        Command::Resolve { text } => run_resolve(&cfg, &text.join(" ")).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AudioConfig> {
    if let Some(path) = path {
        return AudioConfig::load(path);
    }
    let auto_path = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("config.toml")));
    match auto_path {
        Some(path) if path.exists() => AudioConfig::load(&path),
        _ => Ok(AudioConfig::default()),
    }
}

async fn run_cache(cfg: &AudioConfig, command: CacheCommand) -> Result<()> {
    let settings = config::cache_settings_from_config(cfg)?;
    let index = CacheIndex::new(settings);
    let report = index
        .initialize()
        .await
        .with_context(|| format!("initialize cache in {:?}", index.dir()))?;

    match command {
        CacheCommand::Verify => {
            println!(
                "loaded {} dropped {} migrated {} stale temps {}{}",
                report.loaded,
                report.dropped,
                report.migrated,
                report.temps_removed,
                if report.rebuilt { " (index rebuilt)" } else { "" }
            );
        }
        CacheCommand::List => {
            let entries: std::collections::BTreeMap<_, _> = index.entries().into_iter().collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        CacheCommand::Stats => {
            let stats = index.stats();
            println!("entries: {}", stats.entries);
            println!("bytes: {}", stats.total_bytes);
        }
        CacheCommand::Purge => {
            let removed = index
                .purge_all()
                .await
                .with_context(|| format!("purge cache in {:?}", index.dir()))?;
            println!("removed {removed} files");
        }
    }
    Ok(())
}

async fn run_resolve(cfg: &AudioConfig, text: &str) -> Result<()> {
    let pipeline = config::pipeline_settings_from_config(cfg)?;
    let resolver = YtDlpResolver::new(pipeline.yt_dlp_path);
    match resolve_request(&resolver, text).await? {
        Some(track) => println!("{}", serde_json::to_string_pretty(&track)?),
        None => println!("no match for {text:?}"),
    }
    Ok(())
}
