use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use epaper_frame::config::Configuration;
use epaper_frame::platform::display_sink::{self, DisplaySink};
use epaper_frame::storage::FsImageStore;
use epaper_frame::store::Store;
use epaper_frame::{FrameOptions, PhotoFrame, maintenance, web};

#[derive(Debug, Parser)]
#[command(name = "epaper-frame", version, about = "Rotating photo frame for e-paper panels")]
struct Args {
    /// Path to YAML config
    #[arg(short, long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the slideshow and the HTTP API (default)
    Serve,
    /// Print what is stored in the database and on disk
    Status,
    /// Delete every image record and stored file
    Purge {
        /// Required; there is no undo
        #[arg(long)]
        yes: bool,
    },
    /// Recompute crops for images still shown full-frame
    RecalculateCrops,
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("info,epaper_frame=debug"),
        _ => EnvFilter::new("debug,epaper_frame=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        verbose,
        command,
    } = Args::parse();
    init_tracing(verbose);

    let cfg = Configuration::load_or_default(&config)?
        .validated()
        .context("invalid configuration values")?;
    tracing::debug!("configuration from {}:\n{:#?}", config.display(), cfg);

    match command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::Status => status(&cfg),
        Command::Purge { yes } => purge(&cfg, yes),
        Command::RecalculateCrops => recalculate_crops(&cfg),
    }
}

async fn serve(cfg: Configuration) -> Result<()> {
    let store = Arc::new(Store::open(&cfg.database_path).with_context(|| {
        format!("failed to open database {}", cfg.database_path.display())
    })?);
    let sink = display_sink::from_config(&cfg.display)?;
    let options = FrameOptions::from_config(&cfg, sink.resolution());
    let frame = Arc::new(
        PhotoFrame::start(store, Arc::new(FsImageStore), sink, options)
            .context("failed to start photo frame")?,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let served = web::serve(Arc::clone(&frame), cfg.socket_addr()?, cancel.clone()).await;
    cancel.cancel();

    // joining the loops blocks
    tokio::task::spawn_blocking(move || frame.shutdown())
        .await
        .context("shutdown task failed")?;
    served
}

fn open_store(cfg: &Configuration) -> Result<Store> {
    let store = Store::open(&cfg.database_path)
        .with_context(|| format!("failed to open database {}", cfg.database_path.display()))?;
    store.ensure_settings(&cfg.defaults.to_settings(cfg.display.resolution()))?;
    Ok(store)
}

fn status(cfg: &Configuration) -> Result<()> {
    let store = open_store(cfg)?;
    let settings = store.settings()?;
    let inventory = maintenance::inventory(&store, &FsImageStore, &cfg.output_path)?;
    println!("database:        {}", cfg.database_path.display());
    println!(
        "images:          {} ({} enabled)",
        inventory.images, inventory.enabled_images
    );
    println!(
        "originals:       {} files in {}",
        inventory.original_files,
        settings.image_root.display()
    );
    println!(
        "thumbnails:      {} files in {}",
        inventory.thumbnail_files,
        settings.thumb_root.display()
    );
    println!(
        "current frame:   {}",
        if inventory.current_frame_present { "present" } else { "none" }
    );
    println!(
        "slideshow:       {} every {} ms, order {}, resolution {}",
        if settings.slideshow_enabled { "on" } else { "off" },
        settings.interval_ms,
        settings.order_mode,
        settings.resolution
    );
    for name in &inventory.missing_originals {
        println!("missing original: {name}");
    }
    Ok(())
}

fn purge(cfg: &Configuration, yes: bool) -> Result<()> {
    let store = open_store(cfg)?;
    let inventory = maintenance::inventory(&store, &FsImageStore, &cfg.output_path)?;
    if inventory.is_empty() {
        println!("nothing to purge");
        return Ok(());
    }
    if !yes {
        bail!(
            "refusing to delete {} records and {} files without --yes",
            inventory.images,
            inventory.original_files + inventory.thumbnail_files
        );
    }
    let report = maintenance::purge(&store, &FsImageStore, &cfg.output_path)?;
    println!("removed {} records and {} files", report.records, report.files);
    Ok(())
}

fn recalculate_crops(cfg: &Configuration) -> Result<()> {
    let store = open_store(cfg)?;
    let updated = maintenance::recalculate_crops(&store)?;
    println!("updated {updated} crops");
    Ok(())
}
