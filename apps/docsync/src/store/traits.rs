//! Store collaborator traits
//!
//! Store-agnostic interfaces the engine calls to read and write each side.
//! The engine never implements these for real stores; callers inject them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{CanonicalDocument, StoreId};
use crate::error::{ConversionError, StoreError};

/// An item in its store-native shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeItem {
    /// Page id, file path, ...; empty when not yet created
    #[serde(rename = "nativeId")]
    pub native_id: String,
    #[serde(rename = "modifiedAt")]
    pub modified_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl NativeItem {
    pub fn new(native_id: impl Into<String>, modified_at: DateTime<Utc>, data: serde_json::Value) -> Self {
        Self {
            native_id: native_id.into(),
            modified_at,
            data,
        }
    }
}

/// Client for one content store
///
/// Implementations must be safe to call concurrently for different items.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Which side this client talks to
    fn store(&self) -> StoreId;

    /// Fetch one item; `Ok(None)` when it does not exist
    async fn fetch_item(&self, native_id: &str) -> Result<Option<NativeItem>, StoreError>;

    /// Native ids of items modified after `since`
    async fn list_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Create (`native_id = None`) or overwrite an item; returns its native id
    async fn write_item(
        &self,
        native_id: Option<&str>,
        item: NativeItem,
    ) -> Result<String, StoreError>;
}

/// Translates between one store's native shape and the canonical model
#[async_trait]
pub trait Converter: Send + Sync {
    async fn to_canonical(&self, item: &NativeItem) -> Result<CanonicalDocument, ConversionError>;

    async fn from_canonical(&self, doc: &CanonicalDocument) -> Result<NativeItem, ConversionError>;
}

/// Client and converter for one side
#[derive(Clone)]
pub struct StoreEndpoint {
    pub client: Arc<dyn StoreClient>,
    pub converter: Arc<dyn Converter>,
}

impl StoreEndpoint {
    pub fn new(client: Arc<dyn StoreClient>, converter: Arc<dyn Converter>) -> Self {
        Self { client, converter }
    }

    pub fn store(&self) -> StoreId {
        self.client.store()
    }
}

/// Both sides of the sync
#[derive(Clone)]
pub struct StorePair {
    pub remote: StoreEndpoint,
    pub local: StoreEndpoint,
}

impl StorePair {
    pub fn new(remote: StoreEndpoint, local: StoreEndpoint) -> Self {
        Self { remote, local }
    }

    pub fn get(&self, store: StoreId) -> &StoreEndpoint {
        match store {
            StoreId::Remote => &self.remote,
            StoreId::Local => &self.local,
        }
    }
}
