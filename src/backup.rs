use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::mapping::create_data_from_details;
use crate::store::EntryStore;
use crate::types::EntryWithDetails;

/// Portable dump of the cached entries and favorites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub version: String,
    pub export_date: DateTime<Utc>,
    pub total_entries: usize,
    #[serde(default)]
    pub favorites: Vec<String>,
    pub entries: Vec<EntryWithDetails>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub failed: usize,
    pub favorites_restored: usize,
}

pub fn backup_file_name(date: NaiveDate) -> String {
    format!("ive-backup-{}.json", date.format("%Y-%m-%d"))
}

/// Snapshot every cached entry with freshly fetched children. An entry whose refresh
/// fails is exported as cached.
pub async fn export_backup(store: &EntryStore) -> BackupFile {
    let snapshot = store.snapshot();
    let bridge = store.bridge();
    let refreshed = snapshot.entries.iter().map(|cached| async move {
        match bridge.get_entry_with_details(cached.id()).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => cached.clone(),
            Err(e) => {
                warn!(entry = %cached.id(), error = %e, "exporting cached copy");
                cached.clone()
            }
        }
    });
    let entries: Vec<EntryWithDetails> = join_all(refreshed).await;

    let mut favorites: Vec<String> = snapshot.favorite_ids.into_iter().collect();
    favorites.sort();
    BackupFile {
        version: snapshot.version.unwrap_or_else(|| store.required_version().to_string()),
        export_date: Utc::now(),
        total_entries: entries.len(),
        favorites,
        entries,
    }
}

/// Recreate every entry in `backup` under new ids, restore favorites for the ones that
/// made it, then reload the store. Per-entry failures are counted, not fatal.
pub async fn import_backup(store: &EntryStore, backup: &BackupFile) -> Result<ImportReport> {
    let bridge = store.bridge();
    let mut report = ImportReport::default();
    let mut new_ids: HashMap<&str, String> = HashMap::new();

    // Oldest first, so the newest-first listing comes back in the exported order.
    for details in backup.entries.iter().rev() {
        match bridge.create_entry(&create_data_from_details(details)).await {
            Ok(id) => {
                new_ids.insert(details.id(), id);
                report.imported += 1;
            }
            Err(e) => {
                warn!(title = %details.entry.title, error = %e, "failed to import entry");
                report.failed += 1;
            }
        }
    }

    for old_id in &backup.favorites {
        let Some(new_id) = new_ids.get(old_id.as_str()) else { continue };
        match bridge.add_favorite(new_id).await {
            Ok(()) => report.favorites_restored += 1,
            Err(e) => warn!(entry = %old_id, error = %e, "failed to restore favorite"),
        }
    }

    store.load_entries(true).await?;
    store.load_favorites().await?;
    info!(imported = report.imported, failed = report.failed, "import finished");
    Ok(report)
}

/// Write `backup` into `dir` under its dated file name.
pub fn write_backup(backup: &BackupFile, dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join(backup_file_name(backup.export_date.date_naive()));
    let json = serde_json::to_string_pretty(backup).context("serializing backup")?;
    std::fs::write(&path, json).with_context(|| format!("writing backup: {}", path.display()))?;
    Ok(path)
}

pub fn read_backup(path: &Path) -> anyhow::Result<BackupFile> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading backup: {}", path.display()))?;
    serde_json::from_str(&text).context("invalid backup file format")
}
