use serde_json::json;

use super::protocol::request;
use super::Bridge;
use crate::error::Result;
use crate::types::{
    CreateEntryData, Entry, EntryWithDetails, LocalScript, LocalScriptInfo, PingResponse,
    SaveAndPlayResult, SearchOptions,
};

// Typed wrappers, one per request name. All of them go through `Bridge::call`.
impl Bridge {
    /// Liveness probe: a full round trip, nothing presumed.
    pub async fn ping(&self) -> Result<PingResponse> { self.call(request::PING, ()).await }

    pub async fn get_all_entries(&self) -> Result<Vec<Entry>> {
        self.call(request::GET_ALL_ENTRIES, ()).await
    }

    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<Entry>> {
        self.call(request::GET_ENTRY, json!({ "entryId": entry_id })).await
    }

    /// Returns the id the extension assigned.
    pub async fn create_entry(&self, data: &CreateEntryData) -> Result<String> {
        self.call(request::CREATE_ENTRY, json!({ "data": data })).await
    }

    pub async fn update_entry(&self, entry_id: &str, updates: &CreateEntryData) -> Result<()> {
        self.call(request::UPDATE_ENTRY, json!({ "entryId": entry_id, "updates": updates })).await
    }

    pub async fn delete_entry(&self, entry_id: &str) -> Result<()> {
        self.call(request::DELETE_ENTRY, json!({ "entryId": entry_id })).await
    }

    pub async fn get_entry_with_details(&self, entry_id: &str) -> Result<Option<EntryWithDetails>> {
        self.call(request::GET_ENTRY_WITH_DETAILS, json!({ "entryId": entry_id })).await
    }

    pub async fn get_entries_paginated(&self, offset: usize, limit: usize, options: &SearchOptions) -> Result<Vec<Entry>> {
        self.call(request::GET_ENTRIES_PAGINATED, json!({ "offset": offset, "limit": limit, "options": options })).await
    }

    pub async fn search_entries(&self, options: &SearchOptions) -> Result<Vec<Entry>> {
        self.call(request::SEARCH_ENTRIES, json!({ "options": options })).await
    }

    pub async fn add_favorite(&self, entry_id: &str) -> Result<()> {
        self.call(request::ADD_FAVORITE, json!({ "entryId": entry_id })).await
    }

    pub async fn remove_favorite(&self, entry_id: &str) -> Result<()> {
        self.call(request::REMOVE_FAVORITE, json!({ "entryId": entry_id })).await
    }

    pub async fn get_favorites(&self) -> Result<Vec<Entry>> { self.call(request::GET_FAVORITES, ()).await }

    pub async fn is_favorited(&self, entry_id: &str) -> Result<bool> {
        self.call(request::IS_FAVORITED, json!({ "entryId": entry_id })).await
    }

    /// Tell the extension which script to load for the next playback.
    pub async fn select_script(&self, script_id: &str, timestamp_ms: i64) -> Result<()> {
        self.call(request::SELECT_SCRIPT, json!({ "scriptId": script_id, "timestamp": timestamp_ms })).await
    }

    /// Create an entry and select one of its scripts in a single round trip.
    pub async fn save_and_play(&self, data: &CreateEntryData, script_url: &str) -> Result<SaveAndPlayResult> {
        self.call(request::SAVE_AND_PLAY, json!({ "data": data, "scriptUrl": script_url })).await
    }

    /// Store an opaque script blob; returns its generated id.
    pub async fn save_local_script(&self, name: &str, content: &serde_json::Value, size: u64) -> Result<String> {
        self.call(request::SAVE_LOCAL_SCRIPT, json!({ "name": name, "content": content, "size": size })).await
    }

    pub async fn get_local_script(&self, script_id: &str) -> Result<Option<LocalScript>> {
        self.call(request::GET_LOCAL_SCRIPT, json!({ "scriptId": script_id })).await
    }

    pub async fn delete_local_script(&self, script_id: &str) -> Result<()> {
        self.call(request::DELETE_LOCAL_SCRIPT, json!({ "scriptId": script_id })).await
    }

    pub async fn list_local_scripts(&self) -> Result<Vec<LocalScriptInfo>> {
        self.call(request::LIST_LOCAL_SCRIPTS, ()).await
    }

    pub async fn get_local_script_info(&self, script_id: &str) -> Result<Option<LocalScriptInfo>> {
        self.call(request::GET_LOCAL_SCRIPT_INFO, json!({ "scriptId": script_id })).await
    }
}
