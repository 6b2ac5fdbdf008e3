//! Field-level conflict detection

use chrono::{DateTime, Utc};

use super::types::{Conflict, ConflictValues};
use crate::document::{CanonicalDocument, StoreId};

/// Compare two snapshots of the same logical item.
///
/// Title is compared as a string, body by its deterministic serialization,
/// tags as sets. Equal fields produce nothing. Results are ordered by
/// descending severity.
pub fn detect_conflicts(remote: &CanonicalDocument, local: &CanonicalDocument) -> Vec<Conflict> {
    let remote_timestamp = snapshot_time(remote, StoreId::Remote);
    let local_timestamp = snapshot_time(local, StoreId::Local);
    let item_id = remote.id.clone();

    let mut conflicts = Vec::new();
    let mut push = |values: ConflictValues| {
        conflicts.push(Conflict {
            item_id: item_id.clone(),
            values,
            remote_timestamp,
            local_timestamp,
        })
    };

    if remote.body_fingerprint() != local.body_fingerprint() {
        push(ConflictValues::Body {
            remote: remote.body.clone(),
            local: local.body.clone(),
        });
    }

    if remote.title != local.title {
        push(ConflictValues::Title {
            remote: remote.title.clone(),
            local: local.title.clone(),
        });
    }

    if remote.tags != local.tags {
        push(ConflictValues::Tags {
            remote: remote.tags.clone(),
            local: local.tags.clone(),
        });
    }

    tracing::debug!(item = %remote.id, count = conflicts.len(), "Detected conflicts");
    conflicts
}

/// The modification instant a snapshot carries for its own store
fn snapshot_time(doc: &CanonicalDocument, store: StoreId) -> DateTime<Utc> {
    doc.source_timestamps
        .get(&store)
        .copied()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::types::{ConflictField, Severity};
    use crate::document::Block;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_identical_snapshots_have_no_conflicts() {
        let remote = CanonicalDocument::new("doc-1", "Foo")
            .with_body(vec![Block::paragraph("hello")])
            .with_tags(["a", "b"])
            .with_timestamp(StoreId::Remote, at(100));
        let local = CanonicalDocument::new("doc-1", "Foo")
            .with_body(vec![Block::paragraph("hello")])
            .with_tags(["b", "a"])
            .with_timestamp(StoreId::Local, at(200));

        assert!(detect_conflicts(&remote, &local).is_empty());
    }

    #[test]
    fn test_title_conflict_is_medium() {
        let remote = CanonicalDocument::new("doc-1", "Foo").with_timestamp(StoreId::Remote, at(100));
        let local = CanonicalDocument::new("doc-1", "Bar").with_timestamp(StoreId::Local, at(100));

        let conflicts = detect_conflicts(&remote, &local);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field(), ConflictField::Title);
        assert_eq!(conflicts[0].severity(), Severity::Medium);
        assert_eq!(conflicts[0].remote_timestamp, at(100));
        assert_eq!(conflicts[0].local_timestamp, at(100));
    }

    #[test]
    fn test_all_fields_ordered_by_severity() {
        let remote = CanonicalDocument::new("doc-1", "Foo")
            .with_body(vec![Block::paragraph("one")])
            .with_tags(["x"]);
        let local = CanonicalDocument::new("doc-1", "Bar")
            .with_body(vec![Block::quote("one")])
            .with_tags(["y"]);

        let fields: Vec<ConflictField> = detect_conflicts(&remote, &local)
            .iter()
            .map(Conflict::field)
            .collect();

        assert_eq!(
            fields,
            vec![ConflictField::Body, ConflictField::Title, ConflictField::Tags]
        );
    }

    #[test]
    fn test_missing_timestamp_is_oldest() {
        let remote = CanonicalDocument::new("doc-1", "Foo");
        let local = CanonicalDocument::new("doc-1", "Bar").with_timestamp(StoreId::Local, at(1));

        let conflicts = detect_conflicts(&remote, &local);
        assert!(conflicts[0].remote_timestamp < conflicts[0].local_timestamp);
    }
}
