//! Mergeable text document backed by a Yrs `Doc`.
//!
//! Every room on the server and every client replica owns one
//! [`MergeableDocument`]. Local edits return the binary delta produced by
//! their transaction; remote deltas are merged with [`MergeableDocument::apply`].
//! Merging is commutative, associative and idempotent, so replicas that
//! have seen the same set of updates read the same text regardless of
//! delivery order or duplicates.
//!
//! Offsets are UTF-16 code units, the unit browser editors report.

use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update,
};

use crate::error::CollabError;

/// Name of the root text shared by all replicas of a document.
pub const CONTENT_FIELD: &str = "content";

pub struct MergeableDocument {
    doc: Doc,
    text: TextRef,
}

impl MergeableDocument {
    /// Create an empty document with a fresh Yrs client id.
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(CONTENT_FIELD);
        Self { doc, text }
    }

    /// Create a replica seeded from a full-state snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CollabError> {
        let document = Self::new();
        document.apply(snapshot)?;
        Ok(document)
    }

    /// Merge a remote update (or snapshot) into this replica.
    ///
    /// Applying an update that was already merged is a no-op. Bytes that do
    /// not decode as a v1 update are rejected without touching the state.
    pub fn apply(&self, update: &[u8]) -> Result<(), CollabError> {
        let update = Update::decode_v1(update)
            .map_err(|e| CollabError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::MalformedUpdate(e.to_string()))
    }

    /// Encode the full document state.
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Current merged text.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length of the text in UTF-16 code units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `chunk` at `index` (clamped to the end) and return the delta.
    pub fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let index = index.min(self.text.len(&txn));
        self.text.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    /// Remove up to `len` units starting at `index` and return the delta.
    pub fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let total = self.text.len(&txn);
        let index = index.min(total);
        let len = len.min(total - index);
        if len > 0 {
            self.text.remove_range(&mut txn, index, len);
        }
        txn.encode_update_v1()
    }

    /// Replace the whole text in one transaction.
    ///
    /// The replacement is an ordinary delete + insert, so it merges with
    /// concurrent incremental edits like any other update.
    pub fn set_content(&self, content: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let total = self.text.len(&txn);
        if total > 0 {
            self.text.remove_range(&mut txn, 0, total);
        }
        if !content.is_empty() {
            self.text.insert(&mut txn, 0, content);
        }
        txn.encode_update_v1()
    }

    /// Size in bytes of the encoded full state.
    pub fn byte_size(&self) -> usize {
        self.snapshot().len()
    }

    /// Yrs client id of this replica.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }
}

impl Default for MergeableDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MergeableDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeableDocument")
            .field("client_id", &self.client_id())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_is_empty() {
        let doc = MergeableDocument::new();
        assert_eq!(doc.text(), "");
        assert!(doc.is_empty());
    }

    #[test]
    fn test_insert_and_remove() {
        let doc = MergeableDocument::new();
        doc.insert(0, "hello world");
        doc.remove(5, 6);
        assert_eq!(doc.text(), "hello");
    }

    #[test]
    fn test_insert_past_end_is_clamped() {
        let doc = MergeableDocument::new();
        doc.insert(0, "abc");
        doc.insert(100, "d");
        assert_eq!(doc.text(), "abcd");
    }

    #[test]
    fn test_remove_past_end_is_clamped() {
        let doc = MergeableDocument::new();
        doc.insert(0, "abc");
        doc.remove(1, 100);
        assert_eq!(doc.text(), "a");
        doc.remove(10, 1);
        assert_eq!(doc.text(), "a");
    }

    #[test]
    fn test_commutativity() {
        let a = MergeableDocument::new();
        let b = MergeableDocument::new();
        let u1 = a.insert(0, "Hello");
        let u2 = b.insert(0, "World");

        let left = MergeableDocument::new();
        left.apply(&u1).unwrap();
        left.apply(&u2).unwrap();

        let right = MergeableDocument::new();
        right.apply(&u2).unwrap();
        right.apply(&u1).unwrap();

        assert_eq!(left.text(), right.text());
        assert_eq!(left.text().len(), 10);
    }

    #[test]
    fn test_idempotence() {
        let source = MergeableDocument::new();
        let update = source.insert(0, "Hello");

        let replica = MergeableDocument::new();
        replica.apply(&update).unwrap();
        let once = replica.text();
        replica.apply(&update).unwrap();
        replica.apply(&update).unwrap();

        assert_eq!(once, "Hello");
        assert_eq!(replica.text(), once);
    }

    #[test]
    fn test_convergence_with_duplicates_and_reordering() {
        let base = MergeableDocument::new();
        let seed = base.insert(0, "The quick brown fox");

        let a = MergeableDocument::from_snapshot(&seed).unwrap();
        let b = MergeableDocument::from_snapshot(&seed).unwrap();
        let c = MergeableDocument::from_snapshot(&seed).unwrap();

        let d1 = a.remove(4, 6);
        let d2 = a.insert(4, "slow ");
        let d3 = b.remove(16, 3);
        let d4 = b.insert(16, "dog");
        let d5 = c.insert(0, ">> ");

        let updates = [&seed, &d1, &d2, &d3, &d4, &d5];

        let forward = MergeableDocument::new();
        for u in updates.iter() {
            forward.apply(u).unwrap();
        }

        let backward = MergeableDocument::new();
        for u in updates.iter().rev() {
            backward.apply(u).unwrap();
        }
        // Duplicates change nothing.
        backward.apply(&d2).unwrap();
        backward.apply(&seed).unwrap();

        assert_eq!(forward.text(), backward.text());
        assert_eq!(forward.text(), ">> The slow brown dog");
    }

    #[test]
    fn test_associativity_via_snapshots() {
        let u1 = MergeableDocument::new().insert(0, "a");
        let u2 = MergeableDocument::new().insert(0, "b");
        let u3 = MergeableDocument::new().insert(0, "c");

        // (u1 + u2) + u3
        let grouped_left = MergeableDocument::new();
        grouped_left.apply(&u1).unwrap();
        grouped_left.apply(&u2).unwrap();
        let left_snapshot = grouped_left.snapshot();
        let left = MergeableDocument::from_snapshot(&left_snapshot).unwrap();
        left.apply(&u3).unwrap();

        // u1 + (u2 + u3)
        let grouped_right = MergeableDocument::new();
        grouped_right.apply(&u2).unwrap();
        grouped_right.apply(&u3).unwrap();
        let right = MergeableDocument::new();
        right.apply(&u1).unwrap();
        right.apply(&grouped_right.snapshot()).unwrap();

        assert_eq!(left.text(), right.text());
        assert_eq!(left.len(), 3);
    }

    #[test]
    fn test_snapshot_seeds_replica() {
        let doc = MergeableDocument::new();
        doc.insert(0, "hello");
        let replica = MergeableDocument::from_snapshot(&doc.snapshot()).unwrap();
        assert_eq!(replica.text(), "hello");
        assert_ne!(replica.client_id(), doc.client_id());
    }

    #[test]
    fn test_set_content_replaces_text() {
        let doc = MergeableDocument::new();
        doc.insert(0, "draft one");
        let update = doc.set_content("draft two");
        assert_eq!(doc.text(), "draft two");

        // A replica that saw the original text follows the replacement.
        let replica = MergeableDocument::new();
        replica.apply(&doc.snapshot()).unwrap();
        replica.apply(&update).unwrap();
        assert_eq!(replica.text(), "draft two");
    }

    #[test]
    fn test_set_content_then_incremental_edit_merges() {
        let server = MergeableDocument::new();
        let seed = server.set_content("prompt");

        let client = MergeableDocument::from_snapshot(&seed).unwrap();
        let edit = client.insert(6, " v2");
        server.apply(&edit).unwrap();

        assert_eq!(server.text(), "prompt v2");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = MergeableDocument::new();
        doc.insert(0, "keep me");
        let result = doc.apply(&[0xFF, 0xFE, 0xFD, 0xFC]);
        assert!(matches!(result, Err(CollabError::MalformedUpdate(_))));
        assert_eq!(doc.text(), "keep me");
    }

    #[test]
    fn test_utf16_offsets() {
        let doc = MergeableDocument::new();
        doc.insert(0, "héllo");
        doc.insert(5, "!");
        assert_eq!(doc.text(), "héllo!");
        assert_eq!(doc.len(), 6);
    }

    #[test]
    fn test_byte_size_grows_with_content() {
        let doc = MergeableDocument::new();
        let empty = doc.byte_size();
        doc.insert(0, "some prompt text");
        assert!(doc.byte_size() > empty);
    }
}
