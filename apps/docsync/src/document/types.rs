//! Canonical document types

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the two synchronized stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreId {
    /// Remote structured document store
    Remote,
    /// Local plain-file store
    Local,
}

impl StoreId {
    pub const ALL: [StoreId; 2] = [StoreId::Remote, StoreId::Local];

    /// The opposite side
    pub fn other(self) -> StoreId {
        match self {
            StoreId::Remote => StoreId::Local,
            StoreId::Local => StoreId::Remote,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoreId::Remote => "remote",
            StoreId::Local => "local",
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block type within a document body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading { level: u8 },
    ListItem { ordered: bool },
    Quote,
    Code {
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
}

/// A typed block of body content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub kind: BlockKind,
    pub text: String,
}

impl Block {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Paragraph,
            text: text.into(),
        }
    }

    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Heading { level },
            text: text.into(),
        }
    }

    pub fn list_item(ordered: bool, text: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::ListItem { ordered },
            text: text.into(),
        }
    }

    pub fn quote(text: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Quote,
            text: text.into(),
        }
    }

    pub fn code(language: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Code {
                language: language.map(str::to_string),
            },
            text: text.into(),
        }
    }
}

/// Store-agnostic representation of one content item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDocument {
    /// Logical identity, stable across stores
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: Vec<Block>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Last known modification instant per store
    #[serde(default, rename = "sourceTimestamps")]
    pub source_timestamps: BTreeMap<StoreId, DateTime<Utc>>,
    /// Native identifier per store (page id, file path)
    #[serde(default, rename = "storeRefs")]
    pub store_refs: BTreeMap<StoreId, String>,
}

impl CanonicalDocument {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: Vec::new(),
            tags: BTreeSet::new(),
            source_timestamps: BTreeMap::new(),
            store_refs: BTreeMap::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<Block>) -> Self {
        self.body = body;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ref(mut self, store: StoreId, native_id: impl Into<String>) -> Self {
        self.store_refs.insert(store, native_id.into());
        self
    }

    pub fn with_timestamp(mut self, store: StoreId, at: DateTime<Utc>) -> Self {
        self.source_timestamps.insert(store, at);
        self
    }

    /// Deterministic serialization of the body used for equality checks
    pub fn body_fingerprint(&self) -> String {
        fingerprint_blocks(&self.body)
    }

    /// Whether title, body and tags match (identity and bookkeeping ignored)
    pub fn content_eq(&self, other: &CanonicalDocument) -> bool {
        self.title == other.title
            && self.tags == other.tags
            && self.body_fingerprint() == other.body_fingerprint()
    }

    /// Add references from `other` without reassigning existing ones
    pub fn absorb_refs(&mut self, refs: &BTreeMap<StoreId, String>) {
        for (store, native_id) in refs {
            self.store_refs
                .entry(*store)
                .or_insert_with(|| native_id.clone());
        }
    }
}

/// Serialize blocks in order; serde_json output is stable for these types
pub(crate) fn fingerprint_blocks(blocks: &[Block]) -> String {
    serde_json::to_string(blocks).unwrap_or_else(|_| {
        blocks
            .iter()
            .map(|b| format!("{:?}", b))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

/// Identifies the item an event refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKey {
    /// Logical id shared across stores
    Logical { id: String },
    /// Native id inside one store
    Native { store: StoreId, native_id: String },
}

impl ItemKey {
    pub fn logical(id: impl Into<String>) -> Self {
        ItemKey::Logical { id: id.into() }
    }

    pub fn native(store: StoreId, native_id: impl Into<String>) -> Self {
        ItemKey::Native {
            store,
            native_id: native_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Logical { id } => f.write_str(id),
            ItemKey::Native { store, native_id } => write!(f, "{}:{}", store, native_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_compare_as_sets() {
        let a = CanonicalDocument::new("doc-1", "Foo").with_tags(["b", "a", "a"]);
        let b = CanonicalDocument::new("doc-1", "Foo").with_tags(["a", "b"]);
        assert!(a.content_eq(&b));
        assert_eq!(a.tags.len(), 2);
    }

    #[test]
    fn test_body_fingerprint_is_order_sensitive() {
        let a = CanonicalDocument::new("doc-1", "Foo")
            .with_body(vec![Block::heading(1, "Intro"), Block::paragraph("text")]);
        let b = CanonicalDocument::new("doc-1", "Foo")
            .with_body(vec![Block::paragraph("text"), Block::heading(1, "Intro")]);
        assert_ne!(a.body_fingerprint(), b.body_fingerprint());
        assert_eq!(a.body_fingerprint(), a.clone().body_fingerprint());
    }

    #[test]
    fn test_absorb_refs_never_reassigns() {
        let mut doc = CanonicalDocument::new("doc-1", "Foo").with_ref(StoreId::Remote, "page-1");
        let mut other = BTreeMap::new();
        other.insert(StoreId::Remote, "page-2".to_string());
        other.insert(StoreId::Local, "notes/foo.md".to_string());

        doc.absorb_refs(&other);

        assert_eq!(doc.store_refs[&StoreId::Remote], "page-1");
        assert_eq!(doc.store_refs[&StoreId::Local], "notes/foo.md");
    }

    #[test]
    fn test_block_serialization_shape() {
        let json = serde_json::to_value(Block::code(Some("rust"), "fn main() {}")).unwrap();
        assert_eq!(json["type"], "code");
        assert_eq!(json["language"], "rust");
        assert_eq!(json["text"], "fn main() {}");

        let key = ItemKey::native(StoreId::Local, "notes/foo.md");
        assert_eq!(key.to_string(), "local:notes/foo.md");
    }
}
