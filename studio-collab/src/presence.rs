//! Ephemeral cursor & selection presence.
//!
//! Presence never touches the document: it is stored per room with
//! last-write-wins semantics, relayed to the other participants, and
//! dropped as soon as a user's last connection leaves.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! SyncMessage::Cursor ──▶ server PresenceStore::set_cursor()
//!                               │  (relay, excluding origin)
//!                               ▼
//!                         remote RemotePresence::apply_cursor()
//! ```
//!
//! Positions are `{line, column}` pairs as reported by the editor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Zero-based line/column position in the editor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub user_id: String,
    pub position: Position,
}

impl CursorPosition {
    pub fn new(user_id: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            user_id: user_id.into(),
            position: Position::new(line, column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub user_id: String,
    pub start: Position,
    pub end: Position,
}

impl SelectionRange {
    pub fn new(user_id: impl Into<String>, start: Position, end: Position) -> Self {
        Self {
            user_id: user_id.into(),
            start,
            end,
        }
    }

    /// True when start and end coincide.
    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

/// Latest known presence of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
}

impl PresenceEntry {
    fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            cursor: None,
            selection: None,
        }
    }
}

// ─── Server side ────────────────────────────────────────────────

/// Per-room presence map, keyed by user id.
#[derive(Debug, Default)]
pub struct PresenceStore {
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cursor of `cursor.user_id`.
    pub fn set_cursor(&mut self, cursor: CursorPosition) {
        let entry = self
            .entries
            .entry(cursor.user_id.clone())
            .or_insert_with(|| PresenceEntry::empty(&cursor.user_id));
        entry.cursor = Some(cursor);
    }

    /// Overwrite the selection of `selection.user_id`.
    pub fn set_selection(&mut self, selection: SelectionRange) {
        let entry = self
            .entries
            .entry(selection.user_id.clone())
            .or_insert_with(|| PresenceEntry::empty(&selection.user_id));
        entry.selection = Some(selection);
    }

    /// Forget everything about `user_id`. Returns whether an entry existed.
    pub fn clear_user(&mut self, user_id: &str) -> bool {
        self.entries.remove(user_id).is_some()
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    /// All entries, ordered by user id.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    /// All entries except the given user's, ordered by user id.
    pub fn entries_except(&self, user_id: &str) -> Vec<PresenceEntry> {
        let mut entries = self.entries();
        entries.retain(|e| e.user_id != user_id);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Client side ────────────────────────────────────────────────

/// What a client knows about other participants' cursors and selections,
/// plus the local values it last emitted.
#[derive(Debug)]
pub struct RemotePresence {
    /// Our local user identity.
    local_user_id: String,
    cursors: HashMap<String, CursorPosition>,
    selections: HashMap<String, SelectionRange>,
    local_cursor: Option<Position>,
    local_selection: Option<(Position, Position)>,
}

impl RemotePresence {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            cursors: HashMap::new(),
            selections: HashMap::new(),
            local_cursor: None,
            local_selection: None,
        }
    }

    /// Record a remote cursor. Returns false for our own echo.
    pub fn apply_cursor(&mut self, cursor: CursorPosition) -> bool {
        if cursor.user_id == self.local_user_id {
            return false;
        }
        self.cursors.insert(cursor.user_id.clone(), cursor);
        true
    }

    /// Record a remote selection. Returns false for our own echo.
    pub fn apply_selection(&mut self, selection: SelectionRange) -> bool {
        if selection.user_id == self.local_user_id {
            return false;
        }
        self.selections.insert(selection.user_id.clone(), selection);
        true
    }

    /// Drop a departed user's cursor and selection.
    pub fn remove_user(&mut self, user_id: &str) -> bool {
        let had_cursor = self.cursors.remove(user_id).is_some();
        let had_selection = self.selections.remove(user_id).is_some();
        had_cursor || had_selection
    }

    /// Replace remote state with the presence list received on sync.
    pub fn replace_all(&mut self, entries: Vec<PresenceEntry>) {
        self.cursors.clear();
        self.selections.clear();
        for entry in entries {
            if let Some(cursor) = entry.cursor {
                self.apply_cursor(cursor);
            }
            if let Some(selection) = entry.selection {
                self.apply_selection(selection);
            }
        }
    }

    /// Forget all remote presence. Local values are kept.
    pub fn clear(&mut self) {
        self.cursors.clear();
        self.selections.clear();
    }

    /// Remember our own cursor and return it stamped with our user id, ready
    /// to publish.
    pub fn set_local_cursor(&mut self, position: Position) -> CursorPosition {
        self.local_cursor = Some(position);
        CursorPosition {
            user_id: self.local_user_id.clone(),
            position,
        }
    }

    /// Remember our own selection and return it stamped with our user id.
    pub fn set_local_selection(&mut self, start: Position, end: Position) -> SelectionRange {
        self.local_selection = Some((start, end));
        SelectionRange::new(self.local_user_id.clone(), start, end)
    }

    /// Latest cursor of a remote user.
    pub fn cursor(&self, user_id: &str) -> Option<&CursorPosition> {
        self.cursors.get(user_id)
    }

    /// Latest selection of a remote user.
    pub fn selection(&self, user_id: &str) -> Option<&SelectionRange> {
        self.selections.get(user_id)
    }

    /// All remote cursors keyed by user id. Never contains our own.
    pub fn cursors(&self) -> &HashMap<String, CursorPosition> {
        &self.cursors
    }

    pub fn selections(&self) -> &HashMap<String, SelectionRange> {
        &self.selections
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Our last cursor, kept across transport loss so it can be
    /// republished after a rejoin.
    pub fn local_cursor(&self) -> Option<Position> {
        self.local_cursor
    }

    /// Our last selection as `(start, end)`.
    pub fn local_selection(&self) -> Option<(Position, Position)> {
        self.local_selection
    }
}
