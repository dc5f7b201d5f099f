//! Client-side cache of the extension's entries.
//!
//! The store owns one [`Snapshot`] published through a `watch` channel. Every operation
//! is a handful of bridge round trips followed by a single snapshot mutation. Reset loads
//! bump a generation counter; a load applies its result only if no reset started after
//! it, so the most recent reset is always the one the UI ends up showing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bridge::protocol::request;
use crate::bridge::Bridge;
use crate::config::HubConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::mapping::{create_data_from_details, local_script_id, local_script_url, placeholder};
use crate::types::{
    CreateEntryData, Entry, EntryWithDetails, LocalScript, NewScript, PingResponse, SaveAndPlayResult, SearchOptions,
};

/// Where the provider stands for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unknown,
    Probing,
    AvailableCompatible,
    /// Reachable, but running a different version: show upgrade guidance.
    AvailableIncompatible,
    /// Never answered within the probe ceiling: show install guidance.
    Unavailable,
}

impl Liveness {
    pub fn is_terminal(self) -> bool {
        matches!(self, Liveness::AvailableCompatible | Liveness::AvailableIncompatible | Liveness::Unavailable)
    }

    pub fn is_usable(self) -> bool { self == Liveness::AvailableCompatible }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Arrival order. New entries found by the background check go on top.
    pub entries: Vec<EntryWithDetails>,
    pub favorite_ids: HashSet<String>,
    pub filters: SearchOptions,
    /// Pages loaded so far.
    pub page: usize,
    pub per_page: usize,
    /// Last page came back full. Not an authoritative total.
    pub has_more: bool,
    pub loading: bool,
    pub is_loading_more: bool,
    pub error: Option<String>,
    pub available: bool,
    pub version: Option<String>,
    pub version_compatible: bool,
    pub liveness: Liveness,
}

impl Snapshot {
    fn new(per_page: usize) -> Self {
        Self {
            entries: Vec::new(),
            favorite_ids: HashSet::new(),
            filters: SearchOptions::default(),
            page: 0,
            per_page,
            has_more: true,
            loading: false,
            is_loading_more: false,
            error: None,
            available: false,
            version: None,
            version_compatible: false,
            liveness: Liveness::Unknown,
        }
    }

    pub fn contains(&self, entry_id: &str) -> bool { self.entries.iter().any(|e| e.id() == entry_id) }

    pub fn is_favorite(&self, entry_id: &str) -> bool { self.favorite_ids.contains(entry_id) }
}

pub struct EntryStore {
    bridge: Arc<Bridge>,
    required_version: String,
    probe_interval: Duration,
    probe_ceiling: Duration,
    new_entries_interval: Duration,
    state: watch::Sender<Snapshot>,
    generation: AtomicU64,
    active_loads: AtomicUsize,
    paging: AtomicBool,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl EntryStore {
    /// Rejects a config with a zero page size or a zero timeout or interval.
    pub fn new(bridge: Arc<Bridge>, config: &HubConfig) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let (state, _) = watch::channel(Snapshot::new(config.page_size));
        Ok(Self {
            bridge,
            required_version: config.required_version.clone(),
            probe_interval: config.probe_interval(),
            probe_ceiling: config.probe_ceiling(),
            new_entries_interval: config.new_entries_interval(),
            state,
            generation: AtomicU64::new(0),
            active_loads: AtomicUsize::new(0),
            paging: AtomicBool::new(false),
            pollers: Mutex::new(Vec::new()),
        })
    }

    pub fn bridge(&self) -> &Arc<Bridge> { &self.bridge }

    pub fn required_version(&self) -> &str { &self.required_version }

    pub fn snapshot(&self) -> Snapshot { self.state.borrow().clone() }

    /// Receiver that is notified after every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> { self.state.subscribe() }

    pub fn liveness(&self) -> Liveness { self.state.borrow().liveness }

    /// Stop every background poller. The store itself stays usable.
    pub fn dispose(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.pollers).drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        if !handles.is_empty() {
            debug!(count = handles.len(), "stopped pollers");
        }
    }

    // --- liveness ---

    /// One ping. Records availability and version; true only if usable.
    pub async fn check_availability(&self) -> bool {
        match self.ping_once().await {
            Some(ping) => ping.available && ping.version == self.required_version,
            None => false,
        }
    }

    async fn ping_once(&self) -> Option<PingResponse> {
        match self.bridge.ping().await {
            Ok(ping) => {
                let compatible = ping.version == self.required_version;
                self.state.send_modify(|s| {
                    s.available = ping.available;
                    s.version = Some(ping.version.clone());
                    s.version_compatible = compatible;
                });
                Some(ping)
            }
            Err(e) => {
                debug!(error = %e, "ping failed");
                self.state.send_modify(|s| {
                    s.available = false;
                    s.version = None;
                    s.version_compatible = false;
                });
                None
            }
        }
    }

    /// Ping on the probe interval until the provider answers as available or the ceiling
    /// passes. Settles in a terminal state and never re-probes on its own.
    pub async fn probe(&self) -> Liveness {
        self.state.send_modify(|s| s.liveness = Liveness::Probing);
        let deadline = Instant::now() + self.probe_ceiling;
        let mut ticker = interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            ticker.tick().await;
            let now = Instant::now();
            if now >= deadline {
                break Liveness::Unavailable;
            }
            match tokio::time::timeout(deadline - now, self.ping_once()).await {
                Ok(Some(ping)) if ping.available => {
                    break if ping.version == self.required_version {
                        Liveness::AvailableCompatible
                    } else {
                        Liveness::AvailableIncompatible
                    };
                }
                Ok(_) => continue,
                Err(_) => break Liveness::Unavailable,
            }
        };

        self.state.send_modify(|s| {
            s.liveness = outcome;
            if outcome == Liveness::Unavailable {
                s.available = false;
                s.version_compatible = false;
            }
        });
        info!(liveness = ?outcome, "extension probe finished");
        outcome
    }

    /// Probe, then load the first page and the favorites side by side.
    pub async fn connect(&self) -> Result<()> {
        match self.probe().await {
            Liveness::AvailableCompatible => {
                let (entries, favorites) = tokio::join!(self.load_entries(true), self.load_favorites());
                entries.and(favorites)
            }
            Liveness::AvailableIncompatible => Err(Error::VersionMismatch {
                found: self.snapshot().version.unwrap_or_default(),
                required: self.required_version.clone(),
            }),
            _ if !self.bridge.has_channel() => Err(Error::ChannelUnavailable),
            _ => Err(Error::NotResponding { request: request::PING.to_string(), after: self.probe_ceiling }),
        }
    }

    // --- listing ---

    /// Fetch one page with the current filters. `reset` starts over at offset zero and
    /// replaces the list; otherwise the next page is appended.
    pub async fn load_entries(&self, reset: bool) -> Result<()> {
        let _busy = self.busy();
        let generation = if reset {
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.generation.load(Ordering::SeqCst)
        };
        let mut cursor = (0, 0, SearchOptions::default());
        self.state.send_modify(|s| {
            s.error = None;
            if reset {
                s.page = 0;
                s.has_more = true;
            }
            cursor = (s.page * s.per_page, s.per_page, s.filters.clone());
        });
        let (offset, per_page, filters) = cursor;

        let fetched = match self.bridge.get_entries_paginated(offset, per_page, &filters).await {
            Ok(entries) => entries,
            Err(e) => {
                if self.is_current(generation) {
                    let unreachable = e.kind() == ErrorKind::Unavailable;
                    self.state.send_modify(|s| {
                        s.error = Some(e.to_string());
                        if unreachable {
                            s.available = false;
                        }
                    });
                }
                warn!(offset, error = %e, "failed to load entries");
                return Err(e);
            }
        };
        let count = fetched.len();
        let details = self.with_details(fetched).await;

        let applied = self.state.send_if_modified(|s| {
            if !self.is_current(generation) {
                return false;
            }
            if reset {
                s.entries = details;
                s.page = 1;
            } else {
                let known: HashSet<String> = s.entries.iter().map(|e| e.id().to_string()).collect();
                s.entries.extend(details.into_iter().filter(|d| !known.contains(d.id())));
                s.page += 1;
            }
            s.has_more = count == per_page;
            s.available = true;
            true
        });
        if !applied {
            debug!(reset, offset, "discarding superseded load");
        }
        Ok(())
    }

    /// Next page, unless there is none or a load is already running.
    pub async fn load_more_entries(&self) -> Result<()> {
        {
            let s = self.state.borrow();
            if !s.has_more || s.loading {
                return Ok(());
            }
        }
        if self.paging.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Ok(());
        }
        self.state.send_modify(|s| s.is_loading_more = true);
        let result = self.load_entries(false).await;
        self.state.send_modify(|s| s.is_loading_more = false);
        self.paging.store(false, Ordering::SeqCst);
        result
    }

    pub async fn set_filters(&self, filters: SearchOptions) -> Result<()> {
        self.state.send_modify(|s| s.filters = filters);
        self.load_entries(true).await
    }

    pub async fn load_favorites(&self) -> Result<()> {
        match self.bridge.get_favorites().await {
            Ok(favorites) => {
                let ids: HashSet<String> = favorites.into_iter().map(|e| e.id).collect();
                self.state.send_modify(|s| s.favorite_ids = ids);
                Ok(())
            }
            Err(e) => Err(self.record("load favorites", e)),
        }
    }

    // --- mutations ---

    /// Create, then reload from the top so ids and order come from the extension.
    pub async fn create_entry(&self, data: &CreateEntryData) -> Result<String> {
        let _busy = self.busy();
        self.state.send_modify(|s| s.error = None);
        let id = self.bridge.create_entry(data).await.map_err(|e| self.record("create entry", e))?;
        self.load_entries(true).await?;
        Ok(id)
    }

    pub async fn update_entry(&self, entry_id: &str, data: &CreateEntryData) -> Result<()> {
        let _busy = self.busy();
        self.state.send_modify(|s| s.error = None);
        self.bridge.update_entry(entry_id, data).await.map_err(|e| self.record("update entry", e))?;
        self.load_entries(true).await
    }

    /// Once the extension confirms, drop the entry locally without a reload.
    pub async fn delete_entry(&self, entry_id: &str) -> Result<()> {
        let _busy = self.busy();
        self.state.send_modify(|s| s.error = None);
        self.bridge.delete_entry(entry_id).await.map_err(|e| self.record("delete entry", e))?;
        self.state.send_modify(|s| {
            s.entries.retain(|e| e.id() != entry_id);
            s.favorite_ids.remove(entry_id);
        });
        Ok(())
    }

    /// Flip favorite membership after the extension confirms. Returns the new membership.
    pub async fn toggle_favorite(&self, entry_id: &str) -> Result<bool> {
        let favorited = self.state.borrow().favorite_ids.contains(entry_id);
        let outcome = if favorited {
            self.bridge.remove_favorite(entry_id).await
        } else {
            self.bridge.add_favorite(entry_id).await
        };
        outcome.map_err(|e| self.record("toggle favorite", e))?;
        self.state.send_modify(|s| {
            if favorited {
                s.favorite_ids.remove(entry_id);
            } else {
                s.favorite_ids.insert(entry_id.to_string());
            }
        });
        Ok(!favorited)
    }

    // --- background freshness ---

    /// Prepend entries that appeared on the first page since the last load. Best effort:
    /// errors are logged and swallowed. Returns how many entries were added.
    pub async fn check_for_new_entries(&self) -> usize {
        let generation = self.generation.load(Ordering::SeqCst);
        let (known, per_page, filters) = {
            let s = self.state.borrow();
            let known: HashSet<String> = s.entries.iter().map(|e| e.id().to_string()).collect();
            (known, s.per_page, s.filters.clone())
        };
        let first_page = match self.bridge.get_entries_paginated(0, per_page, &filters).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "new entries check failed");
                return 0;
            }
        };
        let fresh: Vec<Entry> = first_page.into_iter().filter(|e| !known.contains(&e.id)).collect();
        if fresh.is_empty() {
            return 0;
        }
        let details = self.with_details(fresh).await;

        let mut added = 0;
        self.state.send_if_modified(|s| {
            if !self.is_current(generation) {
                return false;
            }
            let present: HashSet<String> = s.entries.iter().map(|e| e.id().to_string()).collect();
            let mut top: Vec<EntryWithDetails> = details.into_iter().filter(|d| !present.contains(d.id())).collect();
            added = top.len();
            if added == 0 {
                return false;
            }
            top.append(&mut s.entries);
            s.entries = top;
            true
        });
        if added > 0 {
            info!(added, "new entries found");
        }
        added
    }

    /// Run [`check_for_new_entries`](Self::check_for_new_entries) on the configured interval
    /// while the extension is available and nothing else is loading.
    pub fn spawn_new_entries_poller(self: &Arc<Self>) {
        let store: Weak<Self> = Arc::downgrade(self);
        let period = self.new_entries_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                let idle = {
                    let s = store.state.borrow();
                    s.available && !s.loading
                };
                if idle {
                    store.check_for_new_entries().await;
                }
            }
        });
        lock(&self.pollers).push(handle);
    }

    // --- playback ---

    pub async fn select_script(&self, script_id: &str) -> Result<()> {
        self.state.send_modify(|s| s.error = None);
        let now = chrono::Utc::now().timestamp_millis();
        self.bridge.select_script(script_id, now).await.map_err(|e| self.record("select script", e))
    }

    /// Create an entry and queue one of its scripts for playback, then reload from the top.
    pub async fn save_and_play(&self, data: &CreateEntryData, script_url: &str) -> Result<SaveAndPlayResult> {
        let _busy = self.busy();
        let result = self.bridge.save_and_play(data, script_url).await.map_err(|e| self.record("save and play", e))?;
        self.load_entries(true).await?;
        Ok(result)
    }

    // --- local scripts ---

    /// Store a script blob in the extension. Returns the url entries reference it by.
    pub async fn save_local_script(&self, name: &str, content: &Value) -> Result<String> {
        let size = serde_json::to_vec(content)?.len() as u64;
        let id = self.bridge.save_local_script(name, content, size).await.map_err(|e| self.record("save local script", e))?;
        debug!(script = %id, size, "saved local script");
        Ok(local_script_url(&id))
    }

    /// Save `content` as a local script and add it to the entry's scripts, then reload.
    /// The blob is removed again if the entry cannot be updated.
    pub async fn attach_local_script(&self, entry_id: &str, name: &str, content: &Value) -> Result<String> {
        let _busy = self.busy();
        self.state.send_modify(|s| s.error = None);
        let details = self
            .bridge
            .get_entry_with_details(entry_id)
            .await
            .and_then(|found| found.ok_or_else(|| Error::Provider("Entry not found".into())))
            .map_err(|e| self.record("attach local script", e))?;

        let url = self.save_local_script(name, content).await?;
        let mut data = create_data_from_details(&details);
        data.scripts.push(NewScript { url: url.clone(), name: Some(name.to_string()), ..NewScript::default() });
        if let Err(e) = self.update_entry(entry_id, &data).await {
            if let Some(id) = local_script_id(&url) {
                if let Err(cleanup) = self.bridge.delete_local_script(id).await {
                    warn!(script = %id, error = %cleanup, "orphaned local script");
                }
            }
            return Err(e);
        }
        Ok(url)
    }

    /// Resolve a `file://` script url to its stored blob. Other urls resolve to `None`.
    pub async fn local_script(&self, url: &str) -> Result<Option<LocalScript>> {
        let Some(id) = local_script_id(url) else { return Ok(None) };
        self.bridge.get_local_script(id).await
    }

    pub async fn remove_local_script(&self, url: &str) -> Result<()> {
        let Some(id) = local_script_id(url) else {
            return Err(Error::InvalidPayload(format!("not a local script url: {url}")));
        };
        self.bridge.delete_local_script(id).await.map_err(|e| self.record("delete local script", e))
    }

    // --- helpers ---

    /// Resolve children for every entry concurrently. A failed or empty lookup degrades
    /// that entry to a placeholder instead of failing the page.
    async fn with_details(&self, entries: Vec<Entry>) -> Vec<EntryWithDetails> {
        let lookups = entries.into_iter().map(|entry| async move {
            match self.bridge.get_entry_with_details(&entry.id).await {
                Ok(Some(details)) => details,
                Ok(None) => placeholder(entry),
                Err(e) => {
                    warn!(entry = %entry.id, error = %e, "detail lookup failed, using placeholder");
                    placeholder(entry)
                }
            }
        });
        join_all(lookups).await
    }

    fn is_current(&self, generation: u64) -> bool { self.generation.load(Ordering::SeqCst) == generation }

    fn record(&self, action: &str, e: Error) -> Error {
        warn!(action, error = %e, "operation failed");
        let message = e.to_string();
        self.state.send_modify(|s| s.error = Some(message));
        e
    }

    fn busy(&self) -> Busy<'_> {
        self.state.send_modify(|s| {
            self.active_loads.fetch_add(1, Ordering::SeqCst);
            s.loading = true;
        });
        Busy { store: self }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Drop for EntryStore {
    fn drop(&mut self) { self.dispose(); }
}

// Keeps `loading` raised while any foreground operation is running.
struct Busy<'a> {
    store: &'a EntryStore,
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        let active = &self.store.active_loads;
        self.store.state.send_modify(|s| {
            s.loading = active.fetch_sub(1, Ordering::SeqCst) > 1;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOptions;

    fn detached_store() -> EntryStore {
        EntryStore::new(Arc::new(Bridge::detached(BridgeOptions::default())), &HubConfig::default()).unwrap()
    }

    fn store_with(config: HubConfig) -> Result<EntryStore> {
        EntryStore::new(Arc::new(Bridge::detached(BridgeOptions::default())), &config)
    }

    #[test]
    fn zero_probe_interval_is_rejected() {
        let err = store_with(HubConfig { probe_interval_ms: 0, ..HubConfig::default() }).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn zero_new_entries_interval_is_rejected() {
        let err = store_with(HubConfig { new_entries_interval_ms: 0, ..HubConfig::default() }).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = store_with(HubConfig { page_size: 0, ..HubConfig::default() }).err().unwrap();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn fresh_snapshot_defaults() {
        let store = detached_store();
        let s = store.snapshot();
        assert!(s.entries.is_empty());
        assert!(s.has_more);
        assert!(!s.available);
        assert_eq!(s.per_page, 20);
        assert_eq!(s.liveness, Liveness::Unknown);
    }

    #[test]
    fn terminal_states() {
        assert!(!Liveness::Unknown.is_terminal());
        assert!(!Liveness::Probing.is_terminal());
        assert!(Liveness::AvailableIncompatible.is_terminal());
        assert!(!Liveness::AvailableIncompatible.is_usable());
        assert!(Liveness::AvailableCompatible.is_usable());
    }

    #[tokio::test]
    async fn detached_store_fails_fast_and_records_error() {
        let store = detached_store();
        let err = store.load_entries(true).await.unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable));
        let s = store.snapshot();
        assert!(!s.loading);
        assert!(s.error.is_some());
        assert!(!store.check_availability().await);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_probe_gives_up_at_ceiling() {
        let store = detached_store();
        let start = Instant::now();
        assert_eq!(store.probe().await, Liveness::Unavailable);
        assert!(start.elapsed() <= Duration::from_secs(10));
        assert!(matches!(store.connect().await, Err(Error::ChannelUnavailable)));
    }
}
