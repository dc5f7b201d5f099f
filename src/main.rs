mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use ivehub::backup::{export_backup, import_backup, read_backup, write_backup};
use ivehub::config::HubConfig;
use ivehub::provider::LocalProvider;
use ivehub::store::Snapshot;
use ivehub::types::SearchOptions;
use ivehub::LocalHub;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ivehub=info")))
        .init();

    let cli = Cli::parse();
    let mut config = HubConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Probe { provider_version, offline } => {
            let version = provider_version.unwrap_or_else(|| config.required_version.clone());
            let provider = LocalProvider::new(version);
            provider.set_responding(!offline);
            let hub = LocalHub::start(&config, provider)?;
            let liveness = hub.store.probe().await;
            let s = hub.store.snapshot();
            println!("liveness: {:?}", liveness);
            println!("available: {}  version: {}  compatible: {}", s.available, s.version.as_deref().unwrap_or("-"), s.version_compatible);
        }
        Commands::List { seed, title, favorites, page_size, all } => {
            if let Some(n) = page_size {
                config.page_size = n;
                config.validate()?;
            }
            let hub = LocalHub::start(&config, LocalProvider::new(config.required_version.clone()))?;
            hub.store.connect().await.context("connecting to extension")?;
            if let Some(path) = seed {
                let backup = read_backup(&path)?;
                import_backup(&hub.store, &backup).await?;
            }
            hub.store.set_filters(SearchOptions { title, favorites, ..SearchOptions::default() }).await?;
            while all && hub.store.snapshot().has_more {
                hub.store.load_more_entries().await?;
            }
            print_entries(&hub.store.snapshot());
        }
        Commands::Export { seed, out } => {
            let hub = LocalHub::start(&config, LocalProvider::new(config.required_version.clone()))?;
            hub.store.connect().await.context("connecting to extension")?;
            import_backup(&hub.store, &read_backup(&seed)?).await?;
            while hub.store.snapshot().has_more {
                hub.store.load_more_entries().await?;
            }
            let backup = export_backup(&hub.store).await;
            let path = write_backup(&backup, &out)?;
            println!("exported {} entries to {}", backup.total_entries, path.display());
        }
        Commands::Import { file } => {
            let hub = LocalHub::start(&config, LocalProvider::new(config.required_version.clone()))?;
            hub.store.connect().await.context("connecting to extension")?;
            let report = import_backup(&hub.store, &read_backup(&file)?).await?;
            println!(
                "imported {} entries, {} failed, {} favorites restored",
                report.imported, report.failed, report.favorites_restored
            );
        }
        Commands::AddScript { seed, title, file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading script: {}", file.display()))?;
            let content: serde_json::Value = serde_json::from_str(&text).context("script is not valid JSON")?;
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "script".into());

            let hub = LocalHub::start(&config, LocalProvider::new(config.required_version.clone()))?;
            hub.store.connect().await.context("connecting to extension")?;
            import_backup(&hub.store, &read_backup(&seed)?).await?;
            hub.store.set_filters(SearchOptions { title: Some(title.clone()), ..SearchOptions::default() }).await?;
            let entry_id = hub.store.snapshot().entries.first().map(|e| e.id().to_string())
                .with_context(|| format!("no entry titled {title:?}"))?;
            let url = hub.store.attach_local_script(&entry_id, &name, &content).await?;
            println!("attached {} as {}", name, url);
            print_entries(&hub.store.snapshot());
        }
    }
    Ok(())
}

fn print_entries(s: &Snapshot) {
    for e in &s.entries {
        let star = if s.is_favorite(e.id()) { "*" } else { " " };
        println!("{} {}  {}  ({} sources, {} scripts)", star, e.id(), e.entry.title, e.video_sources.len(), e.scripts.len());
    }
    println!("{} entries, page {}, more: {}", s.entries.len(), s.page, s.has_more);
}
