//! Provider side of the bus.
//!
//! [`serve`] answers page-tagged requests with whatever a [`Responder`] returns.
//! [`LocalProvider`] is an in-memory entry database speaking the full request
//! vocabulary; the CLI drives it and the integration tests fake the extension with it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::bridge::protocol::{self, request};
use crate::channel::MessageChannel;
use crate::error::{Error, Result};
use crate::mapping::{script_from, video_source_from};
use crate::types::{
    CreateEntryData, Entry, EntryWithDetails, LocalScript, LocalScriptInfo, NewScript, NewVideoSource,
    PingResponse, SaveAndPlayResult, ScriptMetadata, SearchOptions, VideoSource,
};

/// Outcome of one request. `None` drops the request without any reply.
pub type Answer = Option<std::result::Result<Value, String>>;

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, kind: &str, payload: &Map<String, Value>) -> Answer;
}

/// Subscribe `responder` to `channel`. Each request is answered on its own task, so
/// replies may go out in a different order than the requests came in.
pub fn serve(channel: Arc<dyn MessageChannel>, responder: Arc<dyn Responder>) -> Result<()> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::Channel(format!("provider needs an async runtime: {e}")))?;
    let bus = channel.clone();
    channel.on_message(Arc::new(move |message| {
        let Some(req) = protocol::parse_request(message) else { return };
        let bus = bus.clone();
        let responder = responder.clone();
        runtime.spawn(async move {
            let reply = match responder.respond(&req.kind, &req.payload).await {
                Some(Ok(data)) => protocol::reply_ok(req.id, data),
                Some(Err(error)) => protocol::reply_err(req.id, &error),
                None => {
                    debug!(id = req.id, request = %req.kind, "dropping request unanswered");
                    return;
                }
            };
            if let Err(e) = bus.post(reply) {
                warn!(id = req.id, error = %e, "failed to post reply");
            }
        });
    }));
    Ok(())
}

#[derive(Default)]
struct Db {
    // Entry ids, newest first.
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    video_sources: HashMap<String, VideoSource>,
    scripts: HashMap<String, ScriptMetadata>,
    // Favorite entry ids in the order they were added.
    favorites: Vec<String>,
    local_scripts: HashMap<String, LocalScript>,
    selected_script: Option<(String, i64)>,
}

/// In-memory extension. Knobs let tests make it slow, silent, outdated, or failing.
pub struct LocalProvider {
    version: String,
    available: AtomicBool,
    responding: AtomicBool,
    latency: Mutex<Option<Duration>>,
    failures: Mutex<HashMap<String, String>>,
    requests: Mutex<HashMap<String, usize>>,
    db: Mutex<Db>,
}

impl LocalProvider {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            available: AtomicBool::new(true),
            responding: AtomicBool::new(true),
            latency: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            db: Mutex::new(Db::default()),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = Some(latency);
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) { *lock(&self.latency) = latency; }

    pub fn version(&self) -> &str { &self.version }

    /// Value reported in the `available` field of ping replies.
    pub fn set_available(&self, available: bool) { self.available.store(available, Ordering::SeqCst); }

    /// A provider that is not responding swallows every request.
    pub fn set_responding(&self, responding: bool) { self.responding.store(responding, Ordering::SeqCst); }

    /// Reject every `kind` request with `message` until cleared.
    pub fn fail_requests(&self, kind: &str, message: &str) {
        lock(&self.failures).insert(kind.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) { lock(&self.failures).clear(); }

    /// Requests of `kind` received so far, answered or not.
    pub fn request_count(&self, kind: &str) -> usize {
        lock(&self.requests).get(kind).copied().unwrap_or(0)
    }

    /// Insert directly, bypassing the bus.
    pub fn insert(&self, data: &CreateEntryData) -> std::result::Result<String, String> {
        create(&mut lock(&self.db), data)
    }

    pub fn favorite(&self, entry_id: &str) -> std::result::Result<(), String> {
        add_favorite(&mut lock(&self.db), entry_id)
    }

    pub fn entry_count(&self) -> usize { lock(&self.db).order.len() }

    pub fn favorite_ids(&self) -> Vec<String> { lock(&self.db).favorites.clone() }

    /// Script most recently selected for playback, with its timestamp.
    pub fn selected_script(&self) -> Option<(String, i64)> { lock(&self.db).selected_script.clone() }

    fn handle(&self, kind: &str, payload: &Map<String, Value>) -> std::result::Result<Value, String> {
        if let Some(message) = lock(&self.failures).get(kind) {
            return Err(message.clone());
        }
        if kind == request::PING {
            let ping = PingResponse { available: self.available.load(Ordering::SeqCst), version: self.version.clone() };
            return to_value(&ping);
        }
        let mut db = lock(&self.db);
        let db = &mut *db;
        match kind {
            request::GET_ALL_ENTRIES => to_value(&db.order.iter().filter_map(|id| db.entries.get(id)).collect::<Vec<_>>()),
            request::GET_ENTRY => {
                let id: String = field(payload, "entryId")?;
                to_value(&db.entries.get(&id))
            }
            request::CREATE_ENTRY => {
                let data: CreateEntryData = field(payload, "data")?;
                Ok(Value::from(create(db, &data)?))
            }
            request::UPDATE_ENTRY => {
                let id: String = field(payload, "entryId")?;
                let updates: CreateEntryData = field(payload, "updates")?;
                update(db, &id, &updates)?;
                Ok(Value::Null)
            }
            request::DELETE_ENTRY => {
                let id: String = field(payload, "entryId")?;
                delete(db, &id)?;
                Ok(Value::Null)
            }
            request::GET_ENTRY_WITH_DETAILS => {
                let id: String = field(payload, "entryId")?;
                to_value(&details(db, &id))
            }
            request::GET_ENTRIES_PAGINATED => {
                let offset: usize = field(payload, "offset")?;
                let limit: usize = field(payload, "limit")?;
                let options: SearchOptions = optional_field(payload, "options")?.unwrap_or_default();
                let page: Vec<&Entry> = search(db, &options).into_iter().skip(offset).take(limit).collect();
                to_value(&page)
            }
            request::SEARCH_ENTRIES => {
                let options: SearchOptions = optional_field(payload, "options")?.unwrap_or_default();
                to_value(&search(db, &options))
            }
            request::ADD_FAVORITE => {
                let id: String = field(payload, "entryId")?;
                add_favorite(db, &id)?;
                Ok(Value::Null)
            }
            request::REMOVE_FAVORITE => {
                let id: String = field(payload, "entryId")?;
                db.favorites.retain(|f| f != &id);
                Ok(Value::Null)
            }
            request::GET_FAVORITES => {
                to_value(&db.favorites.iter().filter_map(|id| db.entries.get(id)).collect::<Vec<_>>())
            }
            request::IS_FAVORITED => {
                let id: String = field(payload, "entryId")?;
                Ok(Value::Bool(db.favorites.contains(&id)))
            }
            request::SELECT_SCRIPT => {
                let script_id: String = field(payload, "scriptId")?;
                let timestamp: i64 = field(payload, "timestamp")?;
                db.selected_script = Some((script_id, timestamp));
                Ok(Value::Null)
            }
            request::SAVE_AND_PLAY => {
                let data: CreateEntryData = field(payload, "data")?;
                let script_url: String = field(payload, "scriptUrl")?;
                if !data.scripts.iter().any(|s| s.url == script_url) {
                    return Err("Script not found in entry".to_string());
                }
                let entry_id = create(db, &data)?;
                let script_id = db.entries.get(&entry_id)
                    .and_then(|e| e.script_ids.iter().find(|sid| db.scripts.get(*sid).is_some_and(|s| s.url == script_url)))
                    .cloned()
                    .ok_or_else(|| "Script not found in entry".to_string())?;
                db.selected_script = Some((script_id.clone(), now()));
                to_value(&SaveAndPlayResult { entry_id, script_id })
            }
            request::SAVE_LOCAL_SCRIPT => {
                let name: String = field(payload, "name")?;
                let content: Value = optional_field(payload, "content")?.unwrap_or(Value::Null);
                let size: u64 = optional_field(payload, "size")?.unwrap_or(0);
                let id = new_id();
                let info = LocalScriptInfo { id: id.clone(), name, size, created_at: now() };
                db.local_scripts.insert(id.clone(), LocalScript { info, content });
                Ok(Value::from(id))
            }
            request::GET_LOCAL_SCRIPT => {
                let id: String = field(payload, "scriptId")?;
                to_value(&db.local_scripts.get(&id))
            }
            request::DELETE_LOCAL_SCRIPT => {
                let id: String = field(payload, "scriptId")?;
                db.local_scripts.remove(&id);
                Ok(Value::Null)
            }
            request::LIST_LOCAL_SCRIPTS => {
                let mut infos: Vec<&LocalScriptInfo> = db.local_scripts.values().map(|s| &s.info).collect();
                infos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.name.cmp(&b.name)));
                to_value(&infos)
            }
            request::GET_LOCAL_SCRIPT_INFO => {
                let id: String = field(payload, "scriptId")?;
                to_value(&db.local_scripts.get(&id).map(|s| &s.info))
            }
            other => Err(format!("Unknown message type: {other}")),
        }
    }
}

#[async_trait]
impl Responder for LocalProvider {
    async fn respond(&self, kind: &str, payload: &Map<String, Value>) -> Answer {
        *lock(&self.requests).entry(kind.to_string()).or_default() += 1;
        if !self.responding.load(Ordering::SeqCst) {
            return None;
        }
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let answer = self.handle(kind, payload);
        if let Err(e) = &answer {
            debug!(request = kind, error = %e, "request refused");
        }
        Some(answer)
    }
}

fn create(db: &mut Db, data: &CreateEntryData) -> std::result::Result<String, String> {
    check_default_url(data)?;
    let at = now();
    let id = new_id();
    let mut entry = Entry {
        id: id.clone(),
        title: data.title.clone(),
        duration: data.duration,
        thumbnail: data.thumbnail.clone(),
        tags: data.tags.clone(),
        video_source_ids: Vec::new(),
        script_ids: Vec::new(),
        default_script_id: None,
        source: data.source.clone(),
        created_at: at,
        updated_at: at,
    };
    attach_children(db, &mut entry, data, at)?;
    db.order.insert(0, id.clone());
    db.entries.insert(id.clone(), entry);
    Ok(id)
}

fn update(db: &mut Db, id: &str, updates: &CreateEntryData) -> std::result::Result<(), String> {
    let mut entry = db.entries.get(id).cloned().ok_or_else(not_found)?;
    check_default_url(updates)?;
    let at = now();
    entry.title = updates.title.clone();
    entry.duration = updates.duration;
    entry.thumbnail = updates.thumbnail.clone();
    entry.tags = updates.tags.clone();
    entry.source = updates.source.clone();
    entry.updated_at = at;

    // Children whose url survives keep their id; the rest are replaced.
    let old_sources: HashMap<String, (String, i64)> = entry.video_source_ids.drain(..)
        .filter_map(|vid| db.video_sources.remove(&vid).map(|v| (v.url, (vid, v.created_at))))
        .collect();
    let old_scripts: HashMap<String, (String, i64)> = entry.script_ids.drain(..)
        .filter_map(|sid| db.scripts.remove(&sid).map(|s| (s.url, (sid, s.created_at))))
        .collect();
    entry.default_script_id = None;

    for v in &updates.video_sources {
        if entry.video_source_ids.iter().any(|vid| db.video_sources.get(vid).is_some_and(|x| x.url == v.url)) {
            continue;
        }
        let (vid, created_at) = old_sources.get(&v.url).cloned().unwrap_or_else(|| (new_id(), at));
        let mut source = video_source_from(vid.clone(), v, at);
        source.created_at = created_at;
        db.video_sources.insert(vid.clone(), source);
        entry.video_source_ids.push(vid);
    }
    for s in &updates.scripts {
        if entry.script_ids.iter().any(|sid| db.scripts.get(sid).is_some_and(|x| x.url == s.url)) {
            continue;
        }
        let (sid, created_at) = old_scripts.get(&s.url).cloned().unwrap_or_else(|| (new_id(), at));
        let mut script = script_from(sid.clone(), s, at);
        script.created_at = created_at;
        db.scripts.insert(sid.clone(), script);
        entry.script_ids.push(sid);
    }
    entry.default_script_id = default_script(db, &entry, updates)?;
    entry.check_invariants()?;
    db.entries.insert(id.to_string(), entry);
    Ok(())
}

fn attach_children(db: &mut Db, entry: &mut Entry, data: &CreateEntryData, at: i64) -> std::result::Result<(), String> {
    let mut seen = HashSet::new();
    for v in data.video_sources.iter().filter(|v| seen.insert(v.url.clone())) {
        let vid = new_id();
        db.video_sources.insert(vid.clone(), video_source_from(vid.clone(), v, at));
        entry.video_source_ids.push(vid);
    }
    let mut seen = HashSet::new();
    for s in data.scripts.iter().filter(|s| seen.insert(s.url.clone())) {
        let sid = new_id();
        db.scripts.insert(sid.clone(), script_from(sid.clone(), s, at));
        entry.script_ids.push(sid);
    }
    entry.default_script_id = default_script(db, entry, data)?;
    entry.check_invariants()
}

// Checked before any child record is written.
fn check_default_url(data: &CreateEntryData) -> std::result::Result<(), String> {
    match &data.default_script_url {
        Some(url) if !data.scripts.iter().any(|s| &s.url == url) => {
            Err(format!("Default script {url} is not one of the entry's scripts"))
        }
        _ => Ok(()),
    }
}

fn default_script(db: &Db, entry: &Entry, data: &CreateEntryData) -> std::result::Result<Option<String>, String> {
    let Some(url) = &data.default_script_url else { return Ok(None) };
    entry.script_ids.iter()
        .find(|sid| db.scripts.get(*sid).is_some_and(|s| &s.url == url))
        .cloned()
        .map(Some)
        .ok_or_else(|| format!("Default script {url} is not one of the entry's scripts"))
}

fn delete(db: &mut Db, id: &str) -> std::result::Result<(), String> {
    let entry = db.entries.remove(id).ok_or_else(not_found)?;
    for vid in &entry.video_source_ids { db.video_sources.remove(vid); }
    for sid in &entry.script_ids { db.scripts.remove(sid); }
    db.order.retain(|e| e != id);
    db.favorites.retain(|f| f != id);
    Ok(())
}

fn add_favorite(db: &mut Db, id: &str) -> std::result::Result<(), String> {
    if !db.entries.contains_key(id) {
        return Err(not_found());
    }
    if !db.favorites.iter().any(|f| f == id) {
        db.favorites.push(id.to_string());
    }
    Ok(())
}

fn details(db: &Db, id: &str) -> Option<EntryWithDetails> {
    let entry = db.entries.get(id)?.clone();
    let video_sources = entry.video_source_ids.iter().filter_map(|v| db.video_sources.get(v).cloned()).collect();
    let scripts = entry.script_ids.iter().filter_map(|s| db.scripts.get(s).cloned()).collect();
    Some(EntryWithDetails { entry, video_sources, scripts })
}

fn search<'a>(db: &'a Db, options: &SearchOptions) -> Vec<&'a Entry> {
    db.order.iter()
        .filter_map(|id| db.entries.get(id))
        .filter(|e| matches(db, e, options))
        .collect()
}

fn matches(db: &Db, entry: &Entry, options: &SearchOptions) -> bool {
    if let Some(title) = options.title.as_deref().filter(|t| !t.trim().is_empty()) {
        if !entry.title.to_lowercase().contains(&title.trim().to_lowercase()) {
            return false;
        }
    }
    if !options.sources.is_empty() && !entry.source.as_ref().is_some_and(|s| options.sources.contains(s)) {
        return false;
    }
    if !options.tags.is_empty() && !entry.tags.iter().any(|t| options.tags.contains(t)) {
        return false;
    }
    if let Some(creator) = options.creator.as_deref().filter(|c| !c.trim().is_empty()) {
        let creator = creator.trim().to_lowercase();
        let found = entry.script_ids.iter()
            .filter_map(|sid| db.scripts.get(sid))
            .any(|s| s.creator.to_lowercase().contains(&creator));
        if !found {
            return false;
        }
    }
    if let Some(domain) = options.domain.as_deref().filter(|d| !d.trim().is_empty()) {
        let domain = domain.trim().to_lowercase();
        let found = entry.video_source_ids.iter()
            .filter_map(|vid| db.video_sources.get(vid))
            .filter_map(|v| Url::parse(&v.url).ok())
            .any(|u| u.host_str().is_some_and(|h| h.to_lowercase().contains(&domain)));
        if !found {
            return false;
        }
    }
    if options.favorites && !db.favorites.iter().any(|f| f == &entry.id) {
        return false;
    }
    true
}

fn field<T: DeserializeOwned>(payload: &Map<String, Value>, key: &str) -> std::result::Result<T, String> {
    optional_field(payload, key)?.ok_or_else(|| format!("Missing field: {key}"))
}

fn optional_field<T: DeserializeOwned>(payload: &Map<String, Value>, key: &str) -> std::result::Result<Option<T>, String> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| format!("Invalid field {key}: {e}")),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> std::result::Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn not_found() -> String { "Entry not found".to_string() }

fn new_id() -> String { uuid::Uuid::new_v4().to_string() }

fn now() -> i64 { chrono::Utc::now().timestamp_millis() }

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One video, one script, the script as default.
pub fn entry_data(title: &str, video_url: &str, script_url: &str, creator: &str) -> CreateEntryData {
    CreateEntryData {
        title: title.to_string(),
        video_sources: vec![NewVideoSource { url: video_url.to_string(), status: None }],
        scripts: vec![NewScript {
            url: script_url.to_string(),
            name: None,
            creator: creator.to_string(),
            support_url: None,
            avg_speed: None,
            max_speed: None,
            action_count: None,
        }],
        default_script_url: Some(script_url.to_string()),
        ..CreateEntryData::default()
    }
}
