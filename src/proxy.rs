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

//! The LSP Proxy Core: the method-by-method translation layer standing
//! between the IDE and clangd.
//!
//! Two readers-writer locks guard the mutable state a request might touch:
//! `core` (the Source Mapper and Tracked Document Store move together,
//! since almost every translation needs both) and `tabs` (which `.ino` tabs
//! are currently open, used only to decide whether a `didOpen`/`didClose`
//! from the IDE is the sketch's first or last and should cross to clangd).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use lsp_types::{
    Diagnostic, DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, NumberOrString, PublishDiagnosticsParams, Range,
    TextDocumentIdentifier, TextDocumentItem, Url, VersionedTextDocumentIdentifier,
    WorkDoneProgressCreateParams,
};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

use crate::clangd::ClangdClient;
use crate::core_state::CoreState;
use crate::error::{ProxyError, ProxyResult};
use crate::ide::IdeEndpoint;
use crate::mapper::{LineChange, SourceMapper};
use crate::progress::{ProgressKind, ProgressProxy};
use crate::protocol::{NotificationMessage, RequestId, RequestMessage};
use crate::rebuild::{RebuildContext, RebuildController};
use crate::translator::{IdeUri, Translator};

/// Diagnostic codes clangd emits purely because it's compiling a synthesized
/// translation unit with embedded-toolchain flags it doesn't understand.
/// These never reflect a real defect in the sketch and are dropped before
/// they reach the IDE.
const SUPPRESSED_DIAGNOSTIC_CODES: &[&str] =
    &["drv_unknown_argument", "drv_unknown_argument_with_suggestion"];

/// Everything the proxy core needs to answer one IDE request or notification.
pub struct Proxy {
    core: Arc<RwLock<CoreState>>,
    open_tabs: RwLock<HashSet<Url>>,
    translator: Translator,
    clangd: Arc<ClangdClient>,
    ide: Arc<IdeEndpoint>,
    rebuild: RebuildController,
    rebuild_ctx: Arc<RebuildContext>,
    progress: std::sync::Mutex<ProgressProxy>,
    clangd_started: Notify,
    clangd_ready: AtomicBool,
    ide_doc_version: AtomicI32,
}

impl Proxy {
    /// Assembles the proxy around an already-bootstrapped clangd connection
    /// and the shared core state the bootstrap rebuild produced. `core` is
    /// the same lock the rebuild controller swaps the mapper through, so a
    /// background rebuild's fresh mapper becomes visible to every handler
    /// the moment it commits.
    pub fn new(
        translator: Translator,
        core: Arc<RwLock<CoreState>>,
        clangd: Arc<ClangdClient>,
        ide: Arc<IdeEndpoint>,
        rebuild_ctx: Arc<RebuildContext>,
    ) -> Arc<Self> {
        let rebuild = RebuildController::spawn(rebuild_ctx.clone());
        Arc::new(Self {
            core,
            open_tabs: RwLock::new(HashSet::new()),
            translator,
            clangd,
            ide,
            rebuild,
            rebuild_ctx,
            progress: std::sync::Mutex::new(ProgressProxy::new()),
            clangd_started: Notify::new(),
            clangd_ready: AtomicBool::new(false),
            ide_doc_version: AtomicI32::new(0),
        })
    }

    /// Marks clangd as ready for traffic and wakes anything waiting on it.
    pub fn mark_clangd_started(&self) {
        self.clangd_ready.store(true, Ordering::SeqCst);
        self.clangd_started.notify_waiters();
    }

    async fn wait_for_clangd(&self) {
        if self.clangd_ready.load(Ordering::SeqCst) {
            return;
        }
        self.clangd_started.notified().await;
    }

    /// Runs the four concurrent pumps: requests and notifications in each
    /// direction. Returns once the IDE closes its connection.
    pub async fn run(self: Arc<Self>) {
        let ide_requests = {
            let this = self.clone();
            tokio::spawn(async move { this.pump_ide_requests().await })
        };
        let ide_notifications = {
            let this = self.clone();
            tokio::spawn(async move { this.pump_ide_notifications().await })
        };
        let clangd_requests = {
            let this = self.clone();
            tokio::spawn(async move { this.pump_clangd_requests().await })
        };
        let clangd_notifications = {
            let this = self.clone();
            tokio::spawn(async move { this.pump_clangd_notifications().await })
        };

        let _ = tokio::join!(ide_requests, ide_notifications, clangd_requests, clangd_notifications);
    }

    async fn pump_ide_requests(self: &Arc<Self>) {
        while let Some(request) = self.ide.next_request().await {
            let this = self.clone();
            tokio::spawn(async move {
                let RequestMessage { id, method, params, .. } = request;
                match this.handle_ide_request(&method, params).await {
                    Ok(result) => {
                        if let Err(e) = this.ide.respond_ok(id, result).await {
                            warn!("failed writing response to IDE: {e}");
                        }
                    }
                    Err(err) => {
                        if let Err(e) = this.ide.respond_err(id, err.lsp_code(), err.to_string()).await {
                            warn!("failed writing error response to IDE: {e}");
                        }
                    }
                }
            });
        }
    }

    async fn pump_ide_notifications(self: &Arc<Self>) {
        while let Some(notification) = self.ide.next_notification().await {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_ide_notification(&notification.method, notification.params).await {
                    warn!("handling IDE notification {}: {e}", notification.method);
                }
            });
        }
    }

    async fn pump_clangd_requests(self: &Arc<Self>) {
        while let Some(request) = self.clangd.next_request().await {
            let this = self.clone();
            tokio::spawn(async move {
                let RequestMessage { id, method, params, .. } = request;
                match this.handle_clangd_request(&method, params).await {
                    Ok(result) => {
                        if let Err(e) = this.clangd.respond(id, result).await {
                            warn!("failed writing response to clangd: {e}");
                        }
                    }
                    Err(err) => warn!("clangd request {method} failed: {err}"),
                }
            });
        }
    }

    async fn pump_clangd_notifications(self: &Arc<Self>) {
        while let Some(notification) = self.clangd.next_notification().await {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_clangd_notification(&notification.method, notification.params).await {
                    warn!("handling clangd notification {}: {e}", notification.method);
                }
            });
        }
    }

    // ---- requests from the IDE -------------------------------------------------

    async fn handle_ide_request(&self, method: &str, params: Value) -> ProxyResult<Value> {
        match method {
            "initialize" => Ok(serde_json::json!({ "capabilities": ide_capabilities() })),
            "shutdown" => {
                self.clangd.shutdown().await?;
                self.progress
                    .lock()
                    .map_err(|_| ProxyError::ProtocolFailure("progress proxy poisoned".to_string()))?
                    .clear();
                Ok(Value::Null)
            }
            "textDocument/documentSymbol" => self.handle_document_symbol(params).await,
            "textDocument/completion" => self.handle_completion(params).await,
            "textDocument/rename" => self.handle_rename(params).await,
            "textDocument/formatting" | "textDocument/rangeFormatting" => {
                self.handle_formatting(method, params).await
            }
            _ => self.forward_passthrough_request(method, params).await,
        }
    }

    /// Requests this proxy doesn't special-case: translate the leading
    /// `TextDocumentPositionParams`-shaped URI/range onto clang space,
    /// forward verbatim, translate the response's locations back.
    async fn forward_passthrough_request(&self, method: &str, mut params: Value) -> ProxyResult<Value> {
        self.wait_for_clangd().await;

        let ide_uri = extract_uri(&params, "/textDocument/uri")
            .ok_or_else(|| ProxyError::ProtocolFailure(format!("{method} missing textDocument.uri")))?;

        let core = self.core.read().await;
        let clang_uri = self.translator.ide_uri_to_clang(&ide_uri)?;
        set_uri(&mut params, "/textDocument/uri", &clang_uri);

        if let Some(range) = extract_range(&params, "/range").or_else(|| extract_range(&params, "/position")) {
            let clang_range = self.translator.range_to_clang(&ide_uri, range, &core.mapper)?;
            set_range(&mut params, "/range", clang_range);
            set_range(&mut params, "/position", clang_range);
        }
        drop(core);

        let result: Value = self.clangd.request(method, params).await?;
        self.translate_locations_in_response(result).await
    }

    /// Walks a clangd response for embedded `uri`/`range` pairs (the shape
    /// every location-bearing LSP response shares) and translates them back
    /// to IDE space, dropping anything that resolves into a preprocessed
    /// region with no IDE counterpart.
    async fn translate_locations_in_response(&self, value: Value) -> ProxyResult<Value> {
        let core = self.core.read().await;
        Ok(translate_value_locations(&value, &self.translator, &core.mapper))
    }

    async fn handle_document_symbol(&self, mut params: Value) -> ProxyResult<Value> {
        self.wait_for_clangd().await;

        let ide_uri = extract_uri(&params, "/textDocument/uri")
            .ok_or_else(|| ProxyError::ProtocolFailure("documentSymbol missing textDocument.uri".to_string()))?;
        let clang_uri = self.translator.ide_uri_to_clang(&ide_uri)?;
        set_uri(&mut params, "/textDocument/uri", &clang_uri);

        let result: Value = self.clangd.request("textDocument/documentSymbol", params).await?;
        let core = self.core.read().await;

        let Value::Array(symbols) = result else {
            return Ok(Value::Array(Vec::new()));
        };

        let filtered: Vec<Value> = symbols
            .into_iter()
            .filter(|symbol| {
                let Some(range) = extract_range(symbol, "/range") else {
                    return false;
                };
                matches!(
                    core.mapper.cpp_to_ino_line(range.start.line as usize),
                    Some(crate::mapper::LineOrigin::Source { ino_file, .. })
                        if ino_file == &tab_file_name(&ide_uri)
                )
            })
            .map(|symbol| translate_value_locations(&symbol, &self.translator, &core.mapper))
            .collect();

        Ok(Value::Array(filtered))
    }

    async fn handle_completion(&self, mut params: Value) -> ProxyResult<Value> {
        self.wait_for_clangd().await;

        let ide_uri = extract_uri(&params, "/textDocument/uri")
            .ok_or_else(|| ProxyError::ProtocolFailure("completion missing textDocument.uri".to_string()))?;

        let core = self.core.read().await;
        let clang_uri = self.translator.ide_uri_to_clang(&ide_uri)?;
        set_uri(&mut params, "/textDocument/uri", &clang_uri);
        if let Some(position) = extract_range(&params, "/position") {
            let clang_range = self.translator.range_to_clang(&ide_uri, position, &core.mapper)?;
            set_range(&mut params, "/position", clang_range);
        }
        drop(core);

        let result: Value = self.clangd.request("textDocument/completion", params).await?;
        let items = match &result {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map.get("items").and_then(Value::as_array).cloned().unwrap_or_default(),
            _ => Vec::new(),
        };

        let visible: Vec<Value> = items.into_iter().filter(|item| !is_internal_completion_item(item)).collect();

        let core = self.core.read().await;
        let translated: Vec<Value> = visible
            .into_iter()
            .map(|item| translate_value_locations(&item, &self.translator, &core.mapper))
            .collect();

        Ok(match result {
            Value::Object(mut map) if map.contains_key("items") => {
                map.insert("items".to_string(), Value::Array(translated));
                Value::Object(map)
            }
            _ => Value::Array(translated),
        })
    }

    /// Renames translate forward to clang space, apply there, then translate
    /// the resulting edits back. An edit that lands outside the sketch (in a
    /// library header, say) is rejected wholesale rather than partially
    /// applied.
    async fn handle_rename(&self, mut params: Value) -> ProxyResult<Value> {
        self.wait_for_clangd().await;

        let ide_uri = extract_uri(&params, "/textDocument/uri")
            .ok_or_else(|| ProxyError::ProtocolFailure("rename missing textDocument.uri".to_string()))?;

        let core = self.core.read().await;
        let clang_uri = self.translator.ide_uri_to_clang(&ide_uri)?;
        set_uri(&mut params, "/textDocument/uri", &clang_uri);
        if let Some(position) = extract_range(&params, "/position") {
            let clang_range = self.translator.range_to_clang(&ide_uri, position, &core.mapper)?;
            set_range(&mut params, "/position", clang_range);
        }
        drop(core);

        let edit: Value = self.clangd.request("textDocument/rename", params).await?;

        let core = self.core.read().await;
        if let Some(changes) = edit.get("changes").and_then(Value::as_object) {
            for (uri, edits) in changes {
                let Ok(parsed) = Url::parse(uri) else { continue };
                let Some(range) = edits
                    .as_array()
                    .and_then(|edits| edits.first())
                    .and_then(|e| extract_range(e, "/range"))
                else {
                    continue;
                };
                if !self.translator.is_edit_target_inside_sketch(&parsed, range, &core.mapper) {
                    return Err(ProxyError::InvalidRenameTarget(
                        "Could not rename symbol, it requires changes outside the sketch.".to_string(),
                    ));
                }
            }
        }

        Ok(translate_value_locations(&edit, &self.translator, &core.mapper))
    }

    /// Formatting runs clangd's formatter against a scoped copy of
    /// `.clang-format` the sketch may not itself carry, written into the
    /// directory that holds the clang-space file so clangd's own style
    /// search actually finds it, and removed again once the request
    /// completes (whichever way it completes).
    async fn handle_formatting(&self, method: &str, mut params: Value) -> ProxyResult<Value> {
        self.wait_for_clangd().await;

        let ide_uri = extract_uri(&params, "/textDocument/uri")
            .ok_or_else(|| ProxyError::ProtocolFailure(format!("{method} missing textDocument.uri")))?;

        let core = self.core.read().await;
        let clang_uri = self.translator.ide_uri_to_clang(&ide_uri)?;
        set_uri(&mut params, "/textDocument/uri", &clang_uri);
        if let Some(range) = extract_range(&params, "/range") {
            let clang_range = self.translator.range_to_clang(&ide_uri, range, &core.mapper)?;
            set_range(&mut params, "/range", clang_range);
        }
        drop(core);

        let clang_path = clang_uri
            .to_file_path()
            .map_err(|()| ProxyError::ProtocolFailure(format!("non-file clang URI: {clang_uri}")))?;
        let format_dir = clang_path
            .parent()
            .ok_or_else(|| ProxyError::ProtocolFailure(format!("clang path has no parent: {}", clang_path.display())))?;
        let _guard = stage_clang_format(format_dir).await?;

        let result: Value = self.clangd.request(method, params).await?;
        let core = self.core.read().await;
        Ok(translate_text_edits(&result, &clang_uri, &self.translator, &core.mapper))
    }

    // ---- requests from clangd ---------------------------------------------------

    async fn handle_clangd_request(&self, method: &str, params: Value) -> ProxyResult<Value> {
        match method {
            "window/workDoneProgress/create" => {
                let typed: WorkDoneProgressCreateParams =
                    serde_json::from_value(params).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;
                let token = typed.token.clone();
                self.progress
                    .lock()
                    .map_err(|_| ProxyError::ProtocolFailure("progress proxy poisoned".to_string()))?
                    .note_create_sent(token.clone());
                let _result: Value = self.ide.request("window/workDoneProgress/create", typed).await?;
                let flushed = {
                    let mut guard = self
                        .progress
                        .lock()
                        .map_err(|_| ProxyError::ProtocolFailure("progress proxy poisoned".to_string()))?;
                    guard.note_created(&token)
                };
                for value in flushed {
                    let _ = self.ide.notify("$/progress", value).await;
                }
                Ok(Value::Null)
            }
            _ => Err(ProxyError::ProtocolFailure(format!("method not found: {method}"))),
        }
    }

    // ---- notifications from the IDE ---------------------------------------------

    async fn handle_ide_notification(&self, method: &str, params: Value) -> ProxyResult<()> {
        match method {
            "textDocument/didOpen" => self.handle_did_open(params).await,
            "textDocument/didChange" => self.handle_did_change(params).await,
            "textDocument/didClose" => self.handle_did_close(params).await,
            "textDocument/didSave" => {
                self.rebuild.trigger();
                Ok(())
            }
            "ino/didCompleteBuild" => self.handle_did_complete_build(params).await,
            "initialized" | "exit" => Ok(()),
            "$/cancelRequest" => {
                if let Some(id) = params.get("id").cloned() {
                    let request_id: RequestId =
                        serde_json::from_value(id).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;
                    self.clangd.cancel_request(request_id).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_did_open(&self, params: Value) -> ProxyResult<()> {
        let typed: DidOpenTextDocumentParams =
            serde_json::from_value(params).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;

        let is_first_tab = {
            let mut tabs = self.open_tabs.write().await;
            let was_empty = tabs.is_empty();
            tabs.insert(typed.text_document.uri.clone());
            was_empty
        };

        {
            let mut core = self.core.write().await;
            core.documents.open(
                typed.text_document.uri.as_str(),
                typed.text_document.language_id.clone(),
                typed.text_document.version,
                typed.text_document.text.clone(),
            );
        }

        if is_first_tab {
            let core = self.core.read().await;
            let text = core.mapper.text();
            drop(core);
            let uri = Url::from_file_path(self.translator.synthesized_path())
                .map_err(|()| ProxyError::MappingFailure("synthesized path".to_string()))?;
            self.clangd
                .notify(
                    "textDocument/didOpen",
                    DidOpenTextDocumentParams {
                        text_document: TextDocumentItem {
                            uri,
                            language_id: "cpp".to_string(),
                            version: self.rebuild_ctx.next_version(),
                            text,
                        },
                    },
                )
                .await?;
        }

        Ok(())
    }

    async fn handle_did_change(&self, params: Value) -> ProxyResult<()> {
        let typed: DidChangeTextDocumentParams =
            serde_json::from_value(params).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;

        let ino_file = tab_file_name(&typed.text_document.uri);

        {
            let mut core = self.core.write().await;

            // Apply one content-change event at a time: the document store
            // needs each edit applied in order (the character splice already
            // done for the IDE copy in `document_store::apply_range_edit`),
            // and the mapper needs each edit's line range resolved against
            // the mapper state as it stood *before* that edit, not after a
            // later edit in the same batch has already shifted it.
            for change in &typed.content_changes {
                core.documents.change(
                    typed.text_document.uri.as_str(),
                    typed.text_document.version,
                    std::slice::from_ref(change),
                )?;

                let Some(range) = change.range else { continue };

                // The document store already spliced this edit in
                // character-precisely; re-read the now-current lines it
                // occupies rather than treating `change.text` as whole-line
                // replacement content (it's only the typed fragment, missing
                // whatever text surrounded it on the edited lines).
                let new_end_line = range.start.line as usize + change.text.matches('\n').count();
                let new_lines: Vec<String> = core
                    .documents
                    .get(typed.text_document.uri.as_str())
                    .map(|document| {
                        document
                            .text
                            .lines()
                            .skip(range.start.line as usize)
                            .take(new_end_line - range.start.line as usize + 1)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                let line_change = LineChange {
                    ino_file: &ino_file,
                    start_line: range.start.line as usize,
                    end_line: range.end.line as usize + 1,
                    new_lines,
                };
                if let Err(e) = core.mapper.apply_change(&line_change) {
                    warn!("incremental mapper update failed, falling back to rebuild: {e}");
                    self.rebuild.trigger();
                    return Ok(());
                }
            }
        }

        let core = self.core.read().await;
        let text = core.mapper.text();
        drop(core);

        let uri = Url::from_file_path(self.translator.synthesized_path())
            .map_err(|()| ProxyError::MappingFailure("synthesized path".to_string()))?;
        self.clangd
            .notify(
                "textDocument/didChange",
                DidChangeTextDocumentParams {
                    text_document: VersionedTextDocumentIdentifier {
                        uri,
                        version: self.rebuild_ctx.next_version(),
                    },
                    content_changes: vec![lsp_types::TextDocumentContentChangeEvent {
                        range: None,
                        range_length: None,
                        text,
                    }],
                },
            )
            .await?;

        self.rebuild.trigger();
        Ok(())
    }

    async fn handle_did_close(&self, params: Value) -> ProxyResult<()> {
        let typed: DidCloseTextDocumentParams =
            serde_json::from_value(params).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;

        let mut core = self.core.write().await;
        core.documents.close(typed.text_document.uri.as_str())?;
        drop(core);

        let is_last_tab = {
            let mut tabs = self.open_tabs.write().await;
            tabs.remove(&typed.text_document.uri);
            tabs.is_empty()
        };

        if is_last_tab {
            let uri = Url::from_file_path(self.translator.synthesized_path())
                .map_err(|()| ProxyError::MappingFailure("synthesized path".to_string()))?;
            self.clangd
                .notify(
                    "textDocument/didClose",
                    DidCloseTextDocumentParams {
                        text_document: TextDocumentIdentifier { uri },
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// The IDE sends this once it finishes its own full compile of the
    /// sketch. `libraries.cache` from that output speeds up the next
    /// incremental rebuild (it lets the build tool skip re-resolving every
    /// library's dependency graph), so we copy it into our build root.
    /// Missing or unreadable caches are logged, not propagated: a faster
    /// rebuild is a nice-to-have, not something worth failing the IDE's
    /// notification over.
    async fn handle_did_complete_build(&self, params: Value) -> ProxyResult<()> {
        let Some(uri) = extract_uri(&params, "/buildOutputUri") else {
            return Ok(());
        };
        let Ok(build_output) = uri.to_file_path() else {
            return Ok(());
        };

        let source = build_output.join("libraries.cache");
        let dest = self.translator.build_root().join("libraries.cache");
        if let Err(e) = tokio::fs::copy(&source, &dest).await {
            warn!("copying libraries.cache from {}: {e}", source.display());
        }

        Ok(())
    }

    // ---- notifications from clangd ----------------------------------------------

    async fn handle_clangd_notification(&self, method: &str, params: Value) -> ProxyResult<()> {
        match method {
            "textDocument/publishDiagnostics" => self.handle_publish_diagnostics(params).await,
            "$/progress" => self.handle_progress(params).await,
            _ => Ok(()),
        }
    }

    /// clangd publishes one diagnostics set for the whole synthesized file;
    /// that set has to fan out to every tab it touches, and every tab that
    /// isn't mentioned has to be cleared so a fixed error doesn't linger.
    async fn handle_publish_diagnostics(&self, params: Value) -> ProxyResult<()> {
        let typed: PublishDiagnosticsParams =
            serde_json::from_value(params).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;

        let core = self.core.read().await;
        let mut by_tab: std::collections::HashMap<String, Vec<Diagnostic>> = std::collections::HashMap::new();

        for diagnostic in typed.diagnostics {
            if is_suppressed(&diagnostic) {
                continue;
            }
            let range = diagnostic.range;
            match core.mapper.cpp_to_ino_line(range.start.line as usize) {
                Some(crate::mapper::LineOrigin::Source { ino_file, .. }) => {
                    let MappedRangeResult(ide_range) = translate_diagnostic_range(&core.mapper, range);
                    let mut translated = diagnostic;
                    translated.range = ide_range;
                    by_tab.entry(ino_file.clone()).or_default().push(translated);
                }
                _ => continue,
            }
        }

        let open_tabs = self.open_tabs.read().await;
        for tab_uri in open_tabs.iter() {
            let file_name = tab_file_name(tab_uri);
            let diagnostics = by_tab.remove(&file_name).unwrap_or_default();
            let _ = self
                .ide
                .notify(
                    "textDocument/publishDiagnostics",
                    PublishDiagnosticsParams {
                        uri: tab_uri.clone(),
                        diagnostics,
                        version: None,
                    },
                )
                .await;
        }

        Ok(())
    }

    async fn handle_progress(&self, params: Value) -> ProxyResult<()> {
        let token = params
            .get("token")
            .cloned()
            .ok_or_else(|| ProxyError::ProtocolFailure("$/progress missing token".to_string()))?;
        let token: NumberOrString =
            serde_json::from_value(token).map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;
        let value = params
            .get("value")
            .cloned()
            .ok_or_else(|| ProxyError::ProtocolFailure("$/progress missing value".to_string()))?;
        let kind = match value.get("kind").and_then(Value::as_str) {
            Some("begin") => ProgressKind::Begin,
            Some("end") => ProgressKind::End,
            _ => ProgressKind::Report,
        };

        let forwarded = {
            let mut guard = self
                .progress
                .lock()
                .map_err(|_| ProxyError::ProtocolFailure("progress proxy poisoned".to_string()))?;
            guard.on_progress(token.clone(), kind, value)
        };

        if let Some(value) = forwarded {
            self.ide
                .notify("$/progress", serde_json::json!({ "token": token, "value": value }))
                .await?;
        }

        Ok(())
    }
}

struct MappedRangeResult(Range);

fn translate_diagnostic_range(mapper: &SourceMapper, range: Range) -> MappedRangeResult {
    mapper
        .cpp_range_to_ino(range)
        .map(|(_, mapped)| MappedRangeResult(mapped.range))
        .unwrap_or(MappedRangeResult(range))
}

fn is_suppressed(diagnostic: &Diagnostic) -> bool {
    match &diagnostic.code {
        Some(NumberOrString::String(code)) => SUPPRESSED_DIAGNOSTIC_CODES.contains(&code.as_str()),
        _ => false,
    }
}

/// Whether a completion item is a toolchain-internal symbol that should
/// never reach the IDE. Decided on insert-text, not the (possibly
/// prettier) display label — `insertText` falls back to `label` when
/// clangd omits it, matching the LSP completion item contract.
fn is_internal_completion_item(item: &Value) -> bool {
    let insert_text = item
        .get("insertText")
        .and_then(Value::as_str)
        .or_else(|| item.get("label").and_then(Value::as_str));
    insert_text.is_some_and(|text| text.starts_with('_'))
}

/// Cleans up a `.clang-format` this proxy staged, once dropped. `path` is
/// `None` when the directory already carried its own `.clang-format` — in
/// that case the guard does nothing, so a real user config is never
/// deleted out from under them.
struct ClangFormatGuard {
    path: Option<PathBuf>,
}

impl Drop for ClangFormatGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Ensures `dir` has a `.clang-format` clangd's formatter will pick up,
/// writing a built-in default only if the directory doesn't already carry
/// one of its own.
async fn stage_clang_format(dir: &Path) -> ProxyResult<ClangFormatGuard> {
    let format_path = dir.join(".clang-format");
    if tokio::fs::try_exists(&format_path).await.unwrap_or(false) {
        return Ok(ClangFormatGuard { path: None });
    }

    tokio::fs::create_dir_all(dir).await.map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;
    tokio::fs::write(&format_path, "BasedOnStyle: Google\nColumnLimit: 0\n")
        .await
        .map_err(|e| ProxyError::ProtocolFailure(e.to_string()))?;
    Ok(ClangFormatGuard { path: Some(format_path) })
}

/// Translates the `range` of every `TextEdit` in a formatting response from
/// clang space back to IDE space. `TextEdit`s carry no `uri` of their own,
/// so (unlike `translate_value_locations`) the clang-space URI they all
/// share has to be supplied by the caller.
fn translate_text_edits(value: &Value, clang_uri: &Url, translator: &Translator, mapper: &SourceMapper) -> Value {
    let Value::Array(edits) = value else { return value.clone() };

    Value::Array(
        edits
            .iter()
            .map(|edit| {
                let Some(range) = extract_range(edit, "/range") else {
                    return edit.clone();
                };
                let Ok(ide_range) = translator.range_to_ide(clang_uri, range, mapper) else {
                    return edit.clone();
                };
                let mut translated = edit.clone();
                set_range(&mut translated, "/range", ide_range);
                translated
            })
            .collect(),
    )
}

fn tab_file_name(uri: &Url) -> String {
    uri.path_segments()
        .and_then(std::iter::Iterator::last)
        .unwrap_or_default()
        .to_string()
}

fn extract_uri(value: &Value, pointer: &str) -> Option<Url> {
    value.pointer(pointer).and_then(Value::as_str).and_then(|s| Url::parse(s).ok())
}

fn set_uri(value: &mut Value, pointer: &str, uri: &Url) {
    if let Some(slot) = value.pointer_mut(pointer) {
        *slot = Value::String(uri.to_string());
    }
}

fn extract_range(value: &Value, pointer: &str) -> Option<Range> {
    let node = value.pointer(pointer)?;
    if node.get("start").is_some() {
        serde_json::from_value(node.clone()).ok()
    } else {
        let position: lsp_types::Position = serde_json::from_value(node.clone()).ok()?;
        Some(Range::new(position, position))
    }
}

fn set_range(value: &mut Value, pointer: &str, range: Range) {
    let Some(slot) = value.pointer_mut(pointer) else { return };
    if slot.get("start").is_some() {
        *slot = serde_json::to_value(range).unwrap_or(Value::Null);
    } else {
        *slot = serde_json::to_value(range.start).unwrap_or(Value::Null);
    }
}

/// Walks any JSON value looking for `{"uri": ..., "range": {...}}` shaped
/// objects (locations, `Location[]`, `LocationLink[]`) and translates them
/// from clang space back to IDE space in place. Entries that resolve into a
/// preprocessed region are dropped.
fn translate_value_locations(value: &Value, translator: &Translator, mapper: &SourceMapper) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter_map(|item| translate_location_object(item, translator, mapper))
                .collect(),
        ),
        // `None` here always means "location-shaped but preprocessed"; a
        // non-location object already comes back as `Some(value.clone())`
        // from `translate_location_object`, so dropping to `null` here never
        // discards an unrelated response shape.
        Value::Object(_) => translate_location_object(value, translator, mapper).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

fn translate_location_object(value: &Value, translator: &Translator, mapper: &SourceMapper) -> Option<Value> {
    let Value::Object(map) = value else { return Some(value.clone()) };

    let uri_key = ["uri", "targetUri"].into_iter().find(|k| map.contains_key(*k));
    let Some(uri_key) = uri_key else { return Some(value.clone()) };
    let uri_str = map.get(uri_key)?.as_str()?;
    let Ok(clang_uri) = Url::parse(uri_str) else {
        return Some(value.clone());
    };

    let range_key = ["range", "targetRange", "targetSelectionRange"]
        .into_iter()
        .find(|k| map.contains_key(*k));
    let range = range_key.and_then(|k| map.get(k)).and_then(|r| serde_json::from_value(r.clone()).ok());

    match translator.clang_uri_to_ide(&clang_uri, range, mapper, None) {
        Ok(IdeUri::Document(ide_uri)) => {
            let mut updated = map.clone();
            updated.insert(uri_key.to_string(), Value::String(ide_uri.to_string()));
            if let (Some(key), Some(range)) = (range_key, range) {
                if let Ok(ide_range) = translator.range_to_ide(&clang_uri, range, mapper) {
                    updated.insert(key.to_string(), serde_json::to_value(ide_range).unwrap_or(Value::Null));
                }
            }
            Some(Value::Object(updated))
        }
        Ok(IdeUri::Preprocessed) => None,
        Err(_) => Some(value.clone()),
    }
}

/// Capabilities the proxy advertises to the IDE, mirroring the subset of
/// clangd's own that this translation layer can faithfully carry through.
fn ide_capabilities() -> Value {
    serde_json::json!({
        "textDocumentSync": { "openClose": true, "change": 2, "save": { "includeText": true } },
        "completionProvider": {
            "triggerCharacters": [".", "<", ">", ":", "\"", "/"],
            "allCommitCharacters": [
                " ", "\t", "(", ")", "[", "]", "{", "}", "<", ">", ":", ";", ",", "+", "-",
                "*", "/", "%", "^", "&", "#", "?", ".", "=", "\"", "'", "|",
            ],
        },
        "signatureHelpProvider": { "triggerCharacters": ["(", ","] },
        "hoverProvider": true,
        "definitionProvider": true,
        "typeDefinitionProvider": true,
        "implementationProvider": true,
        "documentHighlightProvider": true,
        "documentSymbolProvider": true,
        "workspaceSymbolProvider": true,
        "codeActionProvider": { "codeActionKinds": ["quickfix", "refactor", "info"] },
        "documentFormattingProvider": true,
        "documentRangeFormattingProvider": true,
        "documentOnTypeFormattingProvider": { "firstTriggerCharacter": "\n" },
        "renameProvider": true,
        "executeCommandProvider": { "commands": ["clangd.applyFix", "clangd.applyTweak"] },
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::translator::Translator;

    #[test]
    fn completion_drops_items_whose_insert_text_is_internal() {
        // S3: clangd returns [_ZN5hello, loop, setup, __preinit]; the IDE
        // should only see loop and setup.
        let items = [
            serde_json::json!({"label": "_ZN5hello", "insertText": "_ZN5hello"}),
            serde_json::json!({"label": "loop", "insertText": "loop"}),
            serde_json::json!({"label": "setup", "insertText": "setup"}),
            serde_json::json!({"label": "__preinit", "insertText": "__preinit"}),
        ];
        let visible: Vec<&str> = items
            .iter()
            .filter(|item| !is_internal_completion_item(item))
            .map(|item| item["label"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(visible, vec!["loop", "setup"]);
    }

    #[test]
    fn completion_filter_prefers_insert_text_over_label() {
        // A pretty label shouldn't save an internal insert-text from being
        // dropped, and vice versa.
        let internal_insert_text =
            serde_json::json!({"label": "hello()", "insertText": "_hello"});
        assert!(is_internal_completion_item(&internal_insert_text));

        let internal_label_only = serde_json::json!({"label": "_hello"});
        assert!(is_internal_completion_item(&internal_label_only));

        let visible = serde_json::json!({"label": "_displayOnly", "insertText": "loop"});
        assert!(!is_internal_completion_item(&visible));
    }

    #[test]
    fn suppressed_diagnostic_codes_are_dropped() {
        let suppressed: Diagnostic = serde_json::from_value(serde_json::json!({
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}},
            "message": "unknown argument",
            "code": "drv_unknown_argument",
        }))
        .expect("parse");
        assert!(is_suppressed(&suppressed));

        let real: Diagnostic = serde_json::from_value(serde_json::json!({
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}},
            "message": "undeclared identifier",
            "code": "undeclared_var_use",
        }))
        .expect("parse");
        assert!(!is_suppressed(&real));
    }

    #[test]
    fn tab_file_name_takes_the_last_path_segment() {
        let uri = Url::parse("file:///sketches/blink/blink.ino").expect("parse");
        assert_eq!(tab_file_name(&uri), "blink.ino");
    }

    #[test]
    fn uri_and_range_json_pointer_round_trip() {
        let mut params = serde_json::json!({
            "textDocument": { "uri": "file:///a.ino" },
            "range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 5}},
        });

        let uri = extract_uri(&params, "/textDocument/uri").expect("uri");
        assert_eq!(uri.as_str(), "file:///a.ino");

        let range = extract_range(&params, "/range").expect("range");
        assert_eq!(range.start.line, 1);

        let replacement = Url::parse("file:///build/sketch/x.ino.cpp").expect("parse");
        set_uri(&mut params, "/textDocument/uri", &replacement);
        assert_eq!(
            params["textDocument"]["uri"].as_str(),
            Some("file:///build/sketch/x.ino.cpp")
        );

        let new_range = Range::new(lsp_types::Position::new(9, 0), lsp_types::Position::new(9, 1));
        set_range(&mut params, "/range", new_range);
        assert_eq!(params["range"]["start"]["line"], 9);
    }

    #[test]
    fn location_translation_drops_results_in_preprocessed_regions() {
        let translator = Translator::new(PathBuf::from("/sketches/blink"), PathBuf::from("/build"));
        let mapper = SourceMapper::build("#include <Arduino.h>\n#line 1 \"blink.ino\"\nvoid setup() {}\n");
        let synth_uri = Url::from_file_path(translator.synthesized_path()).expect("uri");

        // Line 0 is the preamble: always preprocessed.
        let preprocessed_location = serde_json::json!({
            "uri": synth_uri.to_string(),
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}},
        });
        assert_eq!(
            translate_value_locations(&preprocessed_location, &translator, &mapper),
            Value::Null
        );

        // Line 2 is real source: it should translate back to the owning tab.
        let source_location = serde_json::json!({
            "uri": synth_uri.to_string(),
            "range": {"start": {"line": 2, "character": 0}, "end": {"line": 2, "character": 4}},
        });
        let translated = translate_value_locations(&source_location, &translator, &mapper);
        assert_eq!(
            translated["uri"].as_str(),
            Some(Url::from_file_path("/sketches/blink/blink.ino").unwrap().as_str())
        );
    }

    #[test]
    fn location_array_drops_only_preprocessed_entries() {
        let translator = Translator::new(PathBuf::from("/sketches/blink"), PathBuf::from("/build"));
        let mapper = SourceMapper::build("#include <Arduino.h>\n#line 1 \"blink.ino\"\nvoid setup() {}\n");
        let synth_uri = Url::from_file_path(translator.synthesized_path()).expect("uri");

        let locations = serde_json::json!([
            {
                "uri": synth_uri.to_string(),
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}},
            },
            {
                "uri": synth_uri.to_string(),
                "range": {"start": {"line": 2, "character": 0}, "end": {"line": 2, "character": 4}},
            },
        ]);

        let Value::Array(translated) = translate_value_locations(&locations, &translator, &mapper) else {
            panic!("expected array");
        };
        assert_eq!(translated.len(), 1);
    }

    #[test]
    fn text_edits_translate_ranges_using_the_supplied_clang_uri() {
        let translator = Translator::new(PathBuf::from("/sketches/blink"), PathBuf::from("/build"));
        let mapper = SourceMapper::build("#include <Arduino.h>\n#line 1 \"blink.ino\"\nvoid setup() {}\n");
        let synth_uri = Url::from_file_path(translator.synthesized_path()).expect("uri");

        let edits = serde_json::json!([
            {
                "range": {"start": {"line": 2, "character": 0}, "end": {"line": 2, "character": 4}},
                "newText": "void",
            },
        ]);

        let translated = translate_text_edits(&edits, &synth_uri, &translator, &mapper);
        let Value::Array(translated) = translated else {
            panic!("expected array");
        };
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0]["range"]["start"]["line"], 0);
        assert_eq!(translated[0]["newText"], "void");
    }

    #[test]
    fn text_edits_pass_through_non_array_results_unchanged() {
        let translator = Translator::new(PathBuf::from("/sketches/blink"), PathBuf::from("/build"));
        let mapper = SourceMapper::build("#include <Arduino.h>\n#line 1 \"blink.ino\"\nvoid setup() {}\n");
        let synth_uri = Url::from_file_path(translator.synthesized_path()).expect("uri");

        assert_eq!(translate_text_edits(&Value::Null, &synth_uri, &translator, &mapper), Value::Null);
    }
}
