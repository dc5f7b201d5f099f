use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use ivehub::backup::{export_backup, import_backup};
use ivehub::bridge::protocol::request;
use ivehub::config::HubConfig;
use ivehub::provider::{entry_data, LocalProvider};
use ivehub::store::Liveness;
use ivehub::types::SearchOptions;
use ivehub::{Error, LocalHub};

fn seeded(n: usize) -> LocalProvider {
    let p = LocalProvider::new("1.0.0");
    for i in 0..n {
        let data = entry_data(
            &format!("Entry {i:02}"),
            &format!("https://videos.example/{i}"),
            &format!("https://scripts.example/{i}.funscript"),
            if i % 2 == 0 { "ann" } else { "bob" },
        );
        p.insert(&data).unwrap();
    }
    p
}

fn hub(provider: LocalProvider) -> LocalHub {
    LocalHub::start(&HubConfig::default(), provider).unwrap()
}

fn titles(hub: &LocalHub) -> Vec<String> {
    hub.store.snapshot().entries.iter().map(|e| e.entry.title.clone()).collect()
}

#[tokio::test]
async fn full_page_means_more() {
    let h = hub(seeded(20));
    h.store.load_entries(true).await.unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.entries.len(), 20);
    assert!(s.has_more);
    assert_eq!(s.page, 1);
    assert!(s.available);
    assert!(!s.loading);
    // Every entry came back with its children resolved.
    assert!(s.entries.iter().all(|e| e.video_sources.len() == 1 && e.scripts.len() == 1));
}

#[tokio::test]
async fn short_page_means_no_more() {
    let h = hub(seeded(13));
    h.store.load_entries(true).await.unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.entries.len(), 13);
    assert!(!s.has_more);
}

#[tokio::test]
async fn exact_multiple_costs_one_empty_fetch() {
    let h = hub(seeded(20));
    h.store.load_entries(true).await.unwrap();
    h.store.load_more_entries().await.unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.entries.len(), 20);
    assert!(!s.has_more);
    assert_eq!(h.provider.request_count(request::GET_ENTRIES_PAGINATED), 2);

    // Nothing left to load: no further request goes out.
    h.store.load_more_entries().await.unwrap();
    assert_eq!(h.provider.request_count(request::GET_ENTRIES_PAGINATED), 2);
}

#[tokio::test]
async fn load_more_appends_next_page() {
    let h = hub(seeded(25));
    h.store.load_entries(true).await.unwrap();
    h.store.load_more_entries().await.unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.entries.len(), 25);
    assert_eq!(s.page, 2);
    assert!(!s.has_more);
    assert_eq!(s.entries[0].entry.title, "Entry 24");
    assert_eq!(s.entries[24].entry.title, "Entry 00");
    assert!(!s.is_loading_more);
}

#[tokio::test(start_paused = true)]
async fn back_to_back_load_more_sends_one_request() {
    let h = hub(seeded(30).with_latency(Duration::from_millis(500)));
    let (a, b) = tokio::join!(h.store.load_more_entries(), h.store.load_more_entries());
    a.unwrap();
    b.unwrap();
    assert_eq!(h.provider.request_count(request::GET_ENTRIES_PAGINATED), 1);
    assert_eq!(h.store.snapshot().entries.len(), 20);
}

#[tokio::test(start_paused = true)]
async fn last_reset_wins_over_pending_page() {
    let h = hub(seeded(25));
    h.store.load_entries(true).await.unwrap();

    h.provider.set_latency(Some(Duration::from_secs(3)));
    let more = h.store.load_more_entries();
    let reset = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.provider.set_latency(Some(Duration::from_secs(1)));
        h.store.load_entries(true).await
    };
    let (more, reset) = tokio::join!(more, reset);
    more.unwrap();
    reset.unwrap();

    let s = h.store.snapshot();
    assert_eq!(s.entries.len(), 20);
    assert_eq!(s.page, 1);
    assert_eq!(s.entries[0].entry.title, "Entry 24");
    assert!(!titles(&h).contains(&"Entry 04".to_string()));
    assert!(!s.loading);
}

#[tokio::test(start_paused = true)]
async fn slow_reset_loses_to_later_filter_change() {
    let h = hub(seeded(25).with_latency(Duration::from_secs(3)));
    let slow = h.store.load_entries(true);
    let filtered = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.provider.set_latency(Some(Duration::from_millis(10)));
        h.store.set_filters(SearchOptions { creator: Some("bob".into()), ..SearchOptions::default() }).await
    };
    let (slow, filtered) = tokio::join!(slow, filtered);
    slow.unwrap();
    filtered.unwrap();

    let s = h.store.snapshot();
    assert_eq!(s.entries.len(), 12);
    assert!(s.entries.iter().all(|e| e.scripts[0].creator == "bob"));
    assert_eq!(s.page, 1);
    assert!(!s.loading);
}

#[tokio::test]
async fn failed_detail_lookup_degrades_to_placeholder() {
    let h = hub(seeded(3));
    h.provider.fail_requests(request::GET_ENTRY_WITH_DETAILS, "disk error");
    h.store.load_entries(true).await.unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.entries.len(), 3);
    assert!(s.entries.iter().all(|e| e.video_sources.is_empty() && e.scripts.is_empty()));
    assert!(s.error.is_none());
}

#[tokio::test]
async fn failed_page_load_records_error() {
    let h = hub(seeded(3));
    h.provider.fail_requests(request::GET_ENTRIES_PAGINATED, "database locked");
    let err = h.store.load_entries(true).await.unwrap_err();
    assert!(matches!(err, Error::Provider(ref m) if m == "database locked"));
    let s = h.store.snapshot();
    assert_eq!(s.error.as_deref(), Some("extension error: database locked"));
    assert!(!s.loading);
}

#[tokio::test]
async fn filters_reset_pagination() {
    let h = hub(seeded(25));
    h.store.load_entries(true).await.unwrap();
    h.store.load_more_entries().await.unwrap();
    h.store
        .set_filters(SearchOptions { creator: Some("BOB".into()), ..SearchOptions::default() })
        .await
        .unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.page, 1);
    assert_eq!(s.entries.len(), 12);
    assert!(!s.has_more);
    assert_eq!(s.filters.creator.as_deref(), Some("BOB"));
    assert!(s.entries.iter().all(|e| e.scripts[0].creator == "bob"));
}

#[tokio::test]
async fn failed_toggle_leaves_favorites_untouched() {
    let h = hub(seeded(3));
    h.store.load_entries(true).await.unwrap();
    let id = h.store.snapshot().entries[0].id().to_string();

    h.provider.fail_requests(request::ADD_FAVORITE, "quota exceeded");
    let err = h.store.toggle_favorite(&id).await.unwrap_err();
    assert!(matches!(err, Error::Provider(_)));
    let s = h.store.snapshot();
    assert!(s.favorite_ids.is_empty());
    assert!(s.error.is_some());

    h.provider.clear_failures();
    assert!(h.store.toggle_favorite(&id).await.unwrap());
    assert!(h.store.snapshot().is_favorite(&id));
    assert_eq!(h.provider.favorite_ids(), vec![id.clone()]);

    h.provider.fail_requests(request::REMOVE_FAVORITE, "quota exceeded");
    assert!(h.store.toggle_favorite(&id).await.is_err());
    assert!(h.store.snapshot().is_favorite(&id));

    h.provider.clear_failures();
    assert!(!h.store.toggle_favorite(&id).await.unwrap());
    assert!(h.store.snapshot().favorite_ids.is_empty());
}

#[tokio::test]
async fn delete_drops_entry_and_favorite_without_reload() {
    let h = hub(seeded(3));
    h.store.load_entries(true).await.unwrap();
    let id = h.store.snapshot().entries[1].id().to_string();
    h.store.toggle_favorite(&id).await.unwrap();
    let loads = h.provider.request_count(request::GET_ENTRIES_PAGINATED);

    h.store.delete_entry(&id).await.unwrap();
    let s = h.store.snapshot();
    assert!(!s.contains(&id));
    assert!(!s.is_favorite(&id));
    assert_eq!(s.entries.len(), 2);
    assert_eq!(h.provider.request_count(request::GET_ENTRIES_PAGINATED), loads);
    assert_eq!(h.provider.entry_count(), 2);
}

#[tokio::test]
async fn refused_delete_keeps_entry() {
    let h = hub(seeded(2));
    h.store.load_entries(true).await.unwrap();
    let before = h.store.snapshot().entries;
    let err = h.store.delete_entry("missing").await.unwrap_err();
    assert!(matches!(err, Error::Provider(ref m) if m == "Entry not found"));
    assert_eq!(h.store.snapshot().entries, before);
}

#[tokio::test]
async fn create_and_update_reload_from_the_top() {
    let h = hub(seeded(3));
    h.store.load_entries(true).await.unwrap();

    let id = h.store
        .create_entry(&entry_data("Fresh", "https://videos.example/new", "https://scripts.example/new.funscript", "cat"))
        .await
        .unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.entries.len(), 4);
    assert_eq!(s.entries[0].id(), id);
    assert_eq!(s.entries[0].entry.default_script_id.as_ref(), Some(&s.entries[0].scripts[0].id));

    let mut data = entry_data("Renamed", "https://videos.example/new", "https://scripts.example/new.funscript", "cat");
    data.tags = vec!["edited".into()];
    h.store.update_entry(&id, &data).await.unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.entries[0].entry.title, "Renamed");
    assert_eq!(s.entries[0].entry.tags, vec!["edited".to_string()]);
    assert_eq!(h.provider.request_count(request::GET_ENTRIES_PAGINATED), 3);
}

#[tokio::test]
async fn new_entries_are_prepended_once() {
    let h = hub(seeded(3));
    h.store.load_entries(true).await.unwrap();
    h.provider.insert(&entry_data("Late A", "https://v/a", "https://s/a", "ann")).unwrap();
    h.provider.insert(&entry_data("Late B", "https://v/b", "https://s/b", "ann")).unwrap();

    assert_eq!(h.store.check_for_new_entries().await, 2);
    assert_eq!(titles(&h), vec!["Late B", "Late A", "Entry 02", "Entry 01", "Entry 00"]);
    assert_eq!(h.store.check_for_new_entries().await, 0);

    let s = h.store.snapshot();
    let unique: HashSet<&str> = s.entries.iter().map(|e| e.id()).collect();
    assert_eq!(unique.len(), s.entries.len());
    assert_eq!(s.page, 1);
}

#[tokio::test(start_paused = true)]
async fn new_entries_check_fails_silently() {
    let h = hub(seeded(3));
    h.store.load_entries(true).await.unwrap();
    h.provider.set_responding(false);
    assert_eq!(h.store.check_for_new_entries().await, 0);
    let s = h.store.snapshot();
    assert!(s.error.is_none());
    assert_eq!(s.entries.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn probe_gives_up_within_ceiling() {
    let config = HubConfig { probe_ceiling_ms: 5_000, ..HubConfig::default() };
    let provider = seeded(0);
    provider.set_responding(false);
    let h = LocalHub::start(&config, provider).unwrap();

    let start = Instant::now();
    assert_eq!(h.store.probe().await, Liveness::Unavailable);
    assert!(start.elapsed() <= Duration::from_secs(5));
    let s = h.store.snapshot();
    assert!(!s.available);
    assert_eq!(s.liveness, Liveness::Unavailable);
    assert!(matches!(h.store.connect().await, Err(Error::NotResponding { .. })));
}

#[tokio::test(start_paused = true)]
async fn probe_keeps_polling_until_available() {
    let h = hub(seeded(0));
    h.provider.set_available(false);
    let flip = async {
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        h.provider.set_available(true);
    };
    let (liveness, ()) = tokio::join!(h.store.probe(), flip);
    assert_eq!(liveness, Liveness::AvailableCompatible);
    assert!(h.provider.request_count(request::PING) >= 5);
}

#[tokio::test]
async fn outdated_extension_is_distinct_from_missing() {
    let provider = seeded(2);
    let h = LocalHub::start(&HubConfig { required_version: "2.0.0".into(), ..HubConfig::default() }, provider).unwrap();
    assert!(!h.store.check_availability().await);
    let err = h.store.connect().await.unwrap_err();
    assert!(matches!(err, Error::VersionMismatch { ref found, .. } if found == "1.0.0"));
    let s = h.store.snapshot();
    assert!(s.available);
    assert!(!s.version_compatible);
    assert_eq!(s.liveness, Liveness::AvailableIncompatible);
    assert!(s.entries.is_empty());
}

#[tokio::test]
async fn connect_loads_entries_and_favorites() {
    let provider = seeded(4);
    let h = hub(provider);
    let favorite = h.provider.insert(&entry_data("Starred", "https://v/s", "https://s/s", "ann")).unwrap();
    h.provider.favorite(&favorite).unwrap();

    h.store.connect().await.unwrap();
    let s = h.store.snapshot();
    assert_eq!(s.liveness, Liveness::AvailableCompatible);
    assert_eq!(s.version.as_deref(), Some("1.0.0"));
    assert_eq!(s.entries.len(), 5);
    assert!(s.is_favorite(&favorite));
}

#[tokio::test(start_paused = true)]
async fn poller_picks_up_new_entries_until_disposed() {
    let config = HubConfig { new_entries_interval_ms: 1_000, ..HubConfig::default() };
    let h = LocalHub::start(&config, seeded(2)).unwrap();
    h.store.connect().await.unwrap();
    h.store.spawn_new_entries_poller();

    h.provider.insert(&entry_data("Polled", "https://v/p", "https://s/p", "ann")).unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(titles(&h)[0], "Polled");

    h.store.dispose();
    h.provider.insert(&entry_data("Unseen", "https://v/u", "https://s/u", "ann")).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!titles(&h).contains(&"Unseen".to_string()));
}

#[tokio::test]
async fn save_and_play_selects_script_and_reloads() {
    let h = hub(seeded(1));
    h.store.load_entries(true).await.unwrap();
    let data = entry_data("Play me", "https://v/p", "file://local-1", "");
    let result = h.store.save_and_play(&data, "file://local-1").await.unwrap();
    assert_eq!(h.provider.selected_script().map(|(id, _)| id), Some(result.script_id.clone()));
    assert_eq!(h.store.snapshot().entries[0].id(), result.entry_id);

    h.store.select_script("other").await.unwrap();
    assert_eq!(h.provider.selected_script().map(|(id, _)| id).as_deref(), Some("other"));
}

#[tokio::test]
async fn successful_select_clears_earlier_error() {
    let h = hub(seeded(1));
    h.provider.fail_requests(request::SELECT_SCRIPT, "no device connected");
    assert!(h.store.select_script("s1").await.is_err());
    assert!(h.store.snapshot().error.is_some());

    h.provider.clear_failures();
    h.store.select_script("s1").await.unwrap();
    assert!(h.store.snapshot().error.is_none());
}

#[tokio::test]
async fn local_script_attaches_and_resolves() {
    let h = hub(seeded(2));
    h.store.load_entries(true).await.unwrap();
    let target = h.store.snapshot().entries[1].id().to_string();
    let content = json!({ "actions": [{ "at": 0, "pos": 0 }, { "at": 250, "pos": 100 }] });

    let url = h.store.attach_local_script(&target, "mine.funscript", &content).await.unwrap();
    assert!(url.starts_with("file://"));

    let s = h.store.snapshot();
    let entry = s.entries.iter().find(|e| e.id() == target).unwrap();
    assert_eq!(entry.scripts.len(), 2);
    assert!(entry.scripts.iter().any(|sc| sc.url == url && sc.name.as_deref() == Some("mine.funscript")));

    let stored = h.store.local_script(&url).await.unwrap().unwrap();
    assert_eq!(stored.content, content);
    assert_eq!(stored.info.name, "mine.funscript");
    assert_eq!(stored.info.size, serde_json::to_vec(&content).unwrap().len() as u64);
    let remote = entry.scripts.iter().find(|sc| sc.url != url).unwrap();
    assert!(h.store.local_script(&remote.url).await.unwrap().is_none());

    h.store.remove_local_script(&url).await.unwrap();
    assert!(h.store.local_script(&url).await.unwrap().is_none());
}

#[tokio::test]
async fn saved_local_script_can_be_referenced_on_create() {
    let h = hub(seeded(0));
    let url = h.store.save_local_script("new.funscript", &json!({ "actions": [] })).await.unwrap();
    let id = h.store.create_entry(&entry_data("Local", "https://v/local", &url, "me")).await.unwrap();

    let created = h.store.snapshot().entries.into_iter().find(|e| e.id() == id).unwrap();
    assert_eq!(created.scripts[0].url, url);
    assert!(h.store.local_script(&created.scripts[0].url).await.unwrap().is_some());
    assert!(h.store.local_script("https://scripts.example/0.funscript").await.unwrap().is_none());
}

#[tokio::test]
async fn attaching_to_missing_entry_stores_nothing() {
    let h = hub(seeded(1));
    let err = h.store.attach_local_script("missing", "x.funscript", &json!({})).await.unwrap_err();
    assert!(matches!(err, Error::Provider(_)));
    assert!(h.store.bridge().list_local_scripts().await.unwrap().is_empty());
    assert!(h.store.snapshot().error.is_some());
}

#[tokio::test]
async fn hub_refuses_zero_intervals_and_page_size() {
    let zeroed = [
        HubConfig { probe_interval_ms: 0, ..HubConfig::default() },
        HubConfig { new_entries_interval_ms: 0, ..HubConfig::default() },
        HubConfig { page_size: 0, ..HubConfig::default() },
    ];
    for config in zeroed {
        let started = LocalHub::start(&config, LocalProvider::new("1.0.0"));
        assert!(matches!(started, Err(Error::InvalidConfig(_))));
    }
}

#[tokio::test]
async fn subscribers_see_changes() {
    let h = hub(seeded(2));
    let mut rx = h.store.subscribe();
    h.store.load_entries(true).await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().entries.len(), 2);
}

#[tokio::test]
async fn backup_round_trips_between_extensions() {
    let source = hub(seeded(3));
    source.store.connect().await.unwrap();
    let starred = source.store.snapshot().entries[1].id().to_string();
    source.store.toggle_favorite(&starred).await.unwrap();
    let backup = export_backup(&source.store).await;
    assert_eq!(backup.total_entries, 3);
    assert_eq!(backup.favorites, vec![starred]);
    assert_eq!(backup.version, "1.0.0");

    let target = hub(seeded(0));
    target.store.connect().await.unwrap();
    let report = import_backup(&target.store, &backup).await.unwrap();
    assert_eq!(report.imported, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.favorites_restored, 1);

    assert_eq!(titles(&target), titles(&source));
    let s = target.store.snapshot();
    assert_eq!(s.favorite_ids.len(), 1);
    assert!(s.is_favorite(s.entries[1].id()));
    assert!(!s.contains(&backup.favorites[0]));
}
