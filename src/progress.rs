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

//! The Progress Proxy: a small per-token state machine that keeps
//! `$/progress` notifications from clangd correctly ordered even when the
//! IDE is slow to acknowledge `window/workDoneProgress/create`.
//!
//! Clangd emits progress freely, but some IDE clients refuse a `create`
//! before they consider themselves initialized. Buffering begin/report
//! events per token until `create` is acknowledged means a late ack still
//! produces a `create → begin → report* → end` sequence downstream.

use std::collections::HashMap;

use lsp_types::NumberOrString;
use serde_json::Value;

/// Lifecycle of a single progress token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    /// `create` was sent to the IDE; no acknowledgment yet.
    New,
    /// The IDE acknowledged `create`; notifications forward immediately.
    Created,
    /// A `begin` notification has been forwarded.
    Begun,
}

/// The three `$/progress` value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    /// `WorkDoneProgressBegin`.
    Begin,
    /// `WorkDoneProgressReport`.
    Report,
    /// `WorkDoneProgressEnd`.
    End,
}

/// Tracks in-flight progress tokens and buffers notifications ahead of a
/// late `create` acknowledgment.
#[derive(Debug, Default)]
pub struct ProgressProxy {
    state: HashMap<NumberOrString, TokenState>,
    buffered: HashMap<NumberOrString, Vec<Value>>,
}

impl ProgressProxy {
    /// Creates an empty proxy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a `workDoneProgress/create` request was forwarded to
    /// the IDE for `token`.
    pub fn note_create_sent(&mut self, token: NumberOrString) {
        self.state.entry(token).or_insert(TokenState::New);
    }

    /// Records that the IDE acknowledged `create` for `token`, returning
    /// any notifications that were buffered in the meantime, in arrival
    /// order, ready to forward.
    pub fn note_created(&mut self, token: &NumberOrString) -> Vec<Value> {
        self.state.insert(token.clone(), TokenState::Created);
        self.buffered.remove(token).unwrap_or_default()
    }

    /// Processes a `$/progress` notification from clangd for `token`.
    ///
    /// Returns `Some(value)` when it should be forwarded to the IDE now, or
    /// `None` when it was buffered pending `note_created`. A token that was
    /// never explicitly created (no prior `note_create_sent`) is treated as
    /// already created, since not every progress source round-trips
    /// through an explicit create handshake.
    pub fn on_progress(&mut self, token: NumberOrString, kind: ProgressKind, value: Value) -> Option<Value> {
        let state = *self
            .state
            .entry(token.clone())
            .or_insert(TokenState::Created);

        match state {
            TokenState::New => {
                self.buffered.entry(token).or_default().push(value);
                None
            }
            TokenState::Created | TokenState::Begun => {
                match kind {
                    ProgressKind::Begin => {
                        self.state.insert(token, TokenState::Begun);
                    }
                    ProgressKind::Report => {}
                    ProgressKind::End => {
                        self.state.remove(&token);
                    }
                }
                Some(value)
            }
        }
    }

    /// Ends the proxy for a shutdown: any still-tracked tokens are dropped
    /// without emitting further notifications.
    pub fn clear(&mut self) {
        self.state.clear();
        self.buffered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token() -> NumberOrString {
        NumberOrString::String("indexing".to_string())
    }

    #[test]
    fn progress_before_create_ack_is_buffered_and_flushed_in_order() {
        let mut proxy = ProgressProxy::new();
        proxy.note_create_sent(token());

        let begin = json!({"kind": "begin", "title": "Indexing"});
        let report = json!({"kind": "report", "percentage": 50});

        assert_eq!(proxy.on_progress(token(), ProgressKind::Begin, begin.clone()), None);
        assert_eq!(proxy.on_progress(token(), ProgressKind::Report, report.clone()), None);

        let flushed = proxy.note_created(&token());
        assert_eq!(flushed, vec![begin, report]);
    }

    #[test]
    fn progress_after_create_ack_forwards_immediately() {
        let mut proxy = ProgressProxy::new();
        proxy.note_create_sent(token());
        proxy.note_created(&token());

        let begin = json!({"kind": "begin", "title": "Indexing"});
        assert_eq!(
            proxy.on_progress(token(), ProgressKind::Begin, begin.clone()),
            Some(begin)
        );
    }

    #[test]
    fn end_clears_the_token() {
        let mut proxy = ProgressProxy::new();
        proxy.note_create_sent(token());
        proxy.note_created(&token());
        proxy.on_progress(token(), ProgressKind::Begin, json!({}));
        let end = json!({"kind": "end"});
        assert_eq!(proxy.on_progress(token(), ProgressKind::End, end.clone()), Some(end));
        assert!(!proxy.state.contains_key(&token()));
    }

    #[test]
    fn a_token_with_no_create_is_treated_as_already_created() {
        let mut proxy = ProgressProxy::new();
        let begin = json!({"kind": "begin"});
        assert_eq!(
            proxy.on_progress(token(), ProgressKind::Begin, begin.clone()),
            Some(begin)
        );
    }
}
