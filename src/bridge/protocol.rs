//! Envelope format spoken over the page/extension bus.
//!
//! Outbound (page -> extension): the request payload object with `from`, `id` and `type`
//! added on top. Inbound (extension -> page): `from`, the echoed `id`, and either `data`
//! or a non-empty `error` string.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Sender tag stamped on everything the page posts.
pub const PAGE_SENDER: &str = "iveplay-page";
/// Sender tag the extension stamps on its replies.
pub const EXTENSION_SENDER: &str = "ive-extension";

/// Request names understood by the extension.
pub mod request {
    pub const PING: &str = "IVEDB_PING";
    pub const GET_ALL_ENTRIES: &str = "IVEDB_GET_ALL_ENTRIES";
    pub const GET_ENTRY: &str = "IVEDB_GET_ENTRY";
    pub const CREATE_ENTRY: &str = "IVEDB_CREATE_ENTRY";
    pub const UPDATE_ENTRY: &str = "IVEDB_UPDATE_ENTRY";
    pub const DELETE_ENTRY: &str = "IVEDB_DELETE_ENTRY";
    pub const GET_ENTRY_WITH_DETAILS: &str = "IVEDB_GET_ENTRY_WITH_DETAILS";
    pub const GET_ENTRIES_PAGINATED: &str = "IVEDB_GET_ENTRIES_PAGINATED";
    pub const SEARCH_ENTRIES: &str = "IVEDB_SEARCH_ENTRIES";
    pub const ADD_FAVORITE: &str = "IVEDB_ADD_FAVORITE";
    pub const REMOVE_FAVORITE: &str = "IVEDB_REMOVE_FAVORITE";
    pub const GET_FAVORITES: &str = "IVEDB_GET_FAVORITES";
    pub const IS_FAVORITED: &str = "IVEDB_IS_FAVORITED";
    pub const SELECT_SCRIPT: &str = "IVEDB_SELECT_SCRIPT";
    pub const SAVE_AND_PLAY: &str = "IVEDB_SAVE_AND_PLAY";
    pub const SAVE_LOCAL_SCRIPT: &str = "IVEDB_SAVE_LOCAL_SCRIPT";
    pub const GET_LOCAL_SCRIPT: &str = "IVEDB_GET_LOCAL_SCRIPT";
    pub const DELETE_LOCAL_SCRIPT: &str = "IVEDB_DELETE_LOCAL_SCRIPT";
    pub const LIST_LOCAL_SCRIPTS: &str = "IVEDB_LIST_LOCAL_SCRIPTS";
    pub const GET_LOCAL_SCRIPT_INFO: &str = "IVEDB_GET_LOCAL_SCRIPT_INFO";
}

/// A request as the extension sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub kind: String,
    pub payload: Map<String, Value>,
}

/// A reply as the page sees it. `Err` carries the extension's error string.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u64,
    pub outcome: std::result::Result<Value, String>,
}

pub(crate) fn payload_object<P: Serialize>(kind: &str, payload: P) -> Result<Map<String, Value>> {
    match serde_json::to_value(payload)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(Error::InvalidPayload(kind.to_string())),
    }
}

pub fn outbound(id: u64, kind: &str, mut payload: Map<String, Value>) -> Value {
    payload.insert("from".into(), Value::from(PAGE_SENDER));
    payload.insert("id".into(), Value::from(id));
    payload.insert("type".into(), Value::from(kind));
    Value::Object(payload)
}

/// Anything not tagged by the page, or missing an integer id and a type, is not a request.
pub fn parse_request(message: &Value) -> Option<Request> {
    let obj = message.as_object()?;
    if obj.get("from")?.as_str()? != PAGE_SENDER { return None; }
    let id = obj.get("id")?.as_u64()?;
    let kind = obj.get("type")?.as_str()?.to_string();
    let mut payload = obj.clone();
    for key in ["from", "id", "type"] { payload.remove(key); }
    Some(Request { id, kind, payload })
}

/// Anything not tagged by the extension, or missing an integer id, is not a reply.
pub fn parse_reply(message: &Value) -> Option<Reply> {
    let obj = message.as_object()?;
    if obj.get("from")?.as_str()? != EXTENSION_SENDER { return None; }
    let id = obj.get("id")?.as_u64()?;
    let error = obj.get("error").and_then(Value::as_str).filter(|e| !e.is_empty());
    let outcome = match error {
        Some(e) => Err(e.to_string()),
        None => Ok(obj.get("data").cloned().unwrap_or(Value::Null)),
    };
    Some(Reply { id, outcome })
}

pub fn reply_ok(id: u64, data: Value) -> Value {
    serde_json::json!({ "from": EXTENSION_SENDER, "id": id, "data": data })
}

pub fn reply_err(id: u64, error: &str) -> Value {
    serde_json::json!({ "from": EXTENSION_SENDER, "id": id, "error": error })
}
