pub mod backup;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod mapping;
pub mod provider;
pub mod store;
pub mod types;

// --- Library API for embedding ---

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::bridge::{Bridge, BridgeOptions};
    pub use crate::channel::{MemoryChannel, MessageChannel};
    pub use crate::config::HubConfig;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::provider::{serve, LocalProvider, Responder};
    pub use crate::store::{EntryStore, Liveness, Snapshot};
    pub use crate::types::{
        CreateEntryData, Entry, EntryWithDetails, LocalScript, LocalScriptInfo, NewScript, NewVideoSource,
        ScriptMetadata, SearchOptions, VideoSource,
    };
}

pub use error::{Error, ErrorKind, Result};

use std::sync::Arc;

use crate::bridge::{Bridge, BridgeOptions};
use crate::channel::MemoryChannel;
use crate::config::HubConfig;
use crate::provider::{serve, LocalProvider};
use crate::store::EntryStore;

/// A store wired to an in-process provider over a fresh in-memory bus.
pub struct LocalHub {
    pub channel: Arc<MemoryChannel>,
    pub provider: Arc<LocalProvider>,
    pub store: Arc<EntryStore>,
}

impl LocalHub {
    /// Must be called inside a tokio runtime: the provider answers on spawned tasks.
    pub fn start(config: &HubConfig, provider: LocalProvider) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let channel = Arc::new(MemoryChannel::new());
        let provider = Arc::new(provider);
        serve(channel.clone(), provider.clone())?;
        let bridge = Arc::new(Bridge::new(channel.clone(), BridgeOptions::from(config)));
        let store = Arc::new(EntryStore::new(bridge, config)?);
        Ok(Self { channel, provider, store })
    }
}
