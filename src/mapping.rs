use crate::types::{
    CreateEntryData, Entry, EntryWithDetails, NewScript, NewVideoSource, ScriptMetadata, VideoSource,
};

const LOCAL_SCRIPT_SCHEME: &str = "file://";

/// Stand-in used when an entry's detail lookup fails: the entry itself, no children.
pub fn placeholder(entry: Entry) -> EntryWithDetails {
    EntryWithDetails { entry, video_sources: Vec::new(), scripts: Vec::new() }
}

/// Url under which a locally stored script blob is referenced from an entry.
pub fn local_script_url(script_id: &str) -> String {
    format!("{}{}", LOCAL_SCRIPT_SCHEME, script_id)
}

/// Inverse of [`local_script_url`].
pub fn local_script_id(url: &str) -> Option<&str> {
    url.strip_prefix(LOCAL_SCRIPT_SCHEME).filter(|id| !id.is_empty())
}

/// Rebuild a create payload from a cached entry. Ids and timestamps are left for the
/// extension to assign again.
pub fn create_data_from_details(details: &EntryWithDetails) -> CreateEntryData {
    let default_script_url = details.entry.default_script_id.as_ref().and_then(|default| {
        details.scripts.iter().find(|s| &s.id == default).map(|s| s.url.clone())
    });
    CreateEntryData {
        title: details.entry.title.clone(),
        duration: details.entry.duration,
        thumbnail: details.entry.thumbnail.clone(),
        tags: details.entry.tags.clone(),
        video_sources: details
            .video_sources
            .iter()
            .map(|v| NewVideoSource { url: v.url.clone(), status: v.status })
            .collect(),
        scripts: details.scripts.iter().map(new_script_from).collect(),
        default_script_url,
        source: details.entry.source.clone(),
    }
}

fn new_script_from(s: &ScriptMetadata) -> NewScript {
    NewScript {
        url: s.url.clone(),
        name: s.name.clone(),
        creator: s.creator.clone(),
        support_url: s.support_url.clone(),
        avg_speed: s.avg_speed,
        max_speed: s.max_speed,
        action_count: s.action_count,
    }
}

pub fn video_source_from(id: String, v: &NewVideoSource, now: i64) -> VideoSource {
    VideoSource { id, url: v.url.clone(), status: v.status, created_at: now, updated_at: now }
}

pub fn script_from(id: String, s: &NewScript, now: i64) -> ScriptMetadata {
    ScriptMetadata {
        id,
        url: s.url.clone(),
        name: s.name.clone(),
        creator: s.creator.clone(),
        support_url: s.support_url.clone(),
        avg_speed: s.avg_speed,
        max_speed: s.max_speed,
        action_count: s.action_count,
        created_at: now,
        updated_at: now,
    }
}
