/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The Tracked Document Store: the in-memory authoritative copy of every
//! document the IDE currently has open.
//!
//! Unlike a disk-backed document manager, every entry here is driven purely
//! by IDE lifecycle notifications (`didOpen`/`didChange`/`didClose`) — there
//! is no polling and no notion of an idle timeout.

use std::collections::HashMap;

use lsp_types::{Position, Range, TextDocumentContentChangeEvent};
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};

/// A single IDE-open document.
#[derive(Debug, Clone)]
pub struct Document {
    /// The LSP language identifier the IDE assigned on open.
    pub language_id: String,
    /// Monotonically non-decreasing version, as delivered by the IDE.
    pub version: i32,
    /// Current full text.
    pub text: String,
}

/// In-memory keyed container of every document the IDE has open.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: HashMap<String, Document>,
}

impl DocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a newly opened document.
    ///
    /// Re-opening an already-tracked URI is logged as a warning, not an
    /// error — the IDE may legitimately re-open a document after a
    /// reconnect, and the fresh copy simply replaces the stale one.
    pub fn open(&mut self, uri: &str, language_id: String, version: i32, text: String) {
        if self.documents.contains_key(uri) {
            warn!("didOpen for already-tracked document: {uri}");
        }
        self.documents.insert(
            uri.to_string(),
            Document {
                language_id,
                version,
                text,
            },
        );
    }

    /// Applies a sequence of LSP content changes to a tracked document.
    ///
    /// An event with no range is a full-text replacement. `range_length` is
    /// always ignored, per the store's contract — clangd is known to
    /// corrupt its own state if handed a stale byte count, so outbound
    /// edits never carry it either.
    ///
    /// # Errors
    ///
    /// Returns `UnknownUri` if the document isn't tracked, or `OutOfRange`
    /// if a change's range falls outside the current text.
    pub fn change(
        &mut self,
        uri: &str,
        version: i32,
        events: &[TextDocumentContentChangeEvent],
    ) -> ProxyResult<()> {
        let doc = self
            .documents
            .get_mut(uri)
            .ok_or_else(|| ProxyError::UnknownUri(uri.to_string()))?;

        for event in events {
            match event.range {
                None => doc.text = event.text.clone(),
                Some(range) => {
                    doc.text = apply_range_edit(&doc.text, range, &event.text)?;
                }
            }
        }

        doc.version = version;
        Ok(())
    }

    /// Removes a tracked document.
    ///
    /// # Errors
    ///
    /// Returns `UnknownUri` if the document wasn't tracked; this has no
    /// side effects, matching the store's idempotent-close contract.
    pub fn close(&mut self, uri: &str) -> ProxyResult<()> {
        self.documents
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| ProxyError::UnknownUri(uri.to_string()))
    }

    /// Reads a tracked document's current state.
    #[must_use]
    pub fn get(&self, uri: &str) -> Option<&Document> {
        self.documents.get(uri)
    }

    /// Whether any document under the store is currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Iterates every tracked `(uri, document)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Document)> {
        self.documents.iter()
    }
}

/// Splices `new_text` into `text` at `range`, treating `Position::character`
/// as a character offset within the line (not a UTF-16 code unit count).
fn apply_range_edit(text: &str, range: Range, new_text: &str) -> ProxyResult<String> {
    let start = position_to_offset(text, range.start)?;
    let end = position_to_offset(text, range.end)?;
    if end < start {
        return Err(ProxyError::OutOfRange(format!(
            "range end {:?} precedes start {:?}",
            range.end, range.start
        )));
    }

    let mut result = String::with_capacity(text.len() - (end - start) + new_text.len());
    result.push_str(&text[..start]);
    result.push_str(new_text);
    result.push_str(&text[end..]);
    Ok(result)
}

fn position_to_offset(text: &str, position: Position) -> ProxyResult<usize> {
    let mut offset = 0usize;
    for (line_no, line) in text.split_inclusive('\n').enumerate() {
        if line_no == position.line as usize {
            let line_content = line.strip_suffix('\n').unwrap_or(line);
            let char_count = line_content.chars().count();
            if position.character as usize > char_count {
                return Err(ProxyError::OutOfRange(format!(
                    "character {} on line {}",
                    position.character, position.line
                )));
            }
            let byte_in_line: usize = line_content
                .char_indices()
                .nth(position.character as usize)
                .map_or(line_content.len(), |(i, _)| i);
            return Ok(offset + byte_in_line);
        }
        offset += line.len();
    }

    if position.line as usize == text.split_inclusive('\n').count() && position.character == 0 {
        return Ok(text.len());
    }

    Err(ProxyError::OutOfRange(format!("line {}", position.line)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_get_round_trips() {
        let mut store = DocumentStore::new();
        store.open("file:///a.ino", "arduino".to_string(), 1, "void setup() {}".to_string());
        let doc = store.get("file:///a.ino").expect("tracked");
        assert_eq!(doc.version, 1);
        assert_eq!(doc.text, "void setup() {}");
    }

    #[test]
    fn reopening_a_tracked_uri_replaces_it_without_erroring() {
        let mut store = DocumentStore::new();
        store.open("file:///a.ino", "arduino".to_string(), 1, "old".to_string());
        store.open("file:///a.ino", "arduino".to_string(), 1, "new".to_string());
        assert_eq!(store.get("file:///a.ino").expect("tracked").text, "new");
    }

    #[test]
    fn full_text_change_replaces_content() {
        let mut store = DocumentStore::new();
        store.open("file:///a.ino", "arduino".to_string(), 1, "old".to_string());
        let events = vec![TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: "new text".to_string(),
        }];
        store.change("file:///a.ino", 2, &events).expect("change");
        let doc = store.get("file:///a.ino").expect("tracked");
        assert_eq!(doc.text, "new text");
        assert_eq!(doc.version, 2);
    }

    #[test]
    fn incremental_change_splices_at_the_given_range() {
        let mut store = DocumentStore::new();
        store.open("file:///a.ino", "arduino".to_string(), 1, "hello world".to_string());
        let events = vec![TextDocumentContentChangeEvent {
            range: Some(Range::new(Position::new(0, 6), Position::new(0, 11))),
            range_length: Some(999), // must be ignored
            text: "there".to_string(),
        }];
        store.change("file:///a.ino", 2, &events).expect("change");
        assert_eq!(store.get("file:///a.ino").expect("tracked").text, "hello there");
    }

    #[test]
    fn change_on_untracked_uri_is_unknown() {
        let mut store = DocumentStore::new();
        let events = vec![TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: "x".to_string(),
        }];
        let err = store.change("file:///missing.ino", 1, &events).unwrap_err();
        assert_eq!(err, ProxyError::UnknownUri("file:///missing.ino".to_string()));
    }

    #[test]
    fn close_on_untracked_uri_is_unknown_and_has_no_side_effects() {
        let mut store = DocumentStore::new();
        store.open("file:///a.ino", "arduino".to_string(), 1, "x".to_string());
        let err = store.close("file:///missing.ino").unwrap_err();
        assert_eq!(err, ProxyError::UnknownUri("file:///missing.ino".to_string()));
        assert!(store.get("file:///a.ino").is_some());
    }

    #[test]
    fn close_removes_the_document() {
        let mut store = DocumentStore::new();
        store.open("file:///a.ino", "arduino".to_string(), 1, "x".to_string());
        store.close("file:///a.ino").expect("close");
        assert!(store.get("file:///a.ino").is_none());
    }
}
