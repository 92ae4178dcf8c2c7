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

//! The Rebuild Controller: a debounced single-consumer worker that reruns
//! the external build tool, swaps in a freshly built Source Mapper, and
//! resynchronizes clangd's copy of the synthesized translation unit.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use lsp_types::{
    DidChangeTextDocumentParams, DidSaveTextDocumentParams, TextDocumentContentChangeEvent,
    TextDocumentIdentifier, Url, VersionedTextDocumentIdentifier,
};
use tokio::sync::{Notify, RwLock, mpsc};
use tracing::{info, warn};

use crate::build_tool::{self, BuildOverrides};
use crate::clangd::ClangdClient;
use crate::core_state::CoreState;
use crate::error::{ProxyError, ProxyResult};
use crate::mapper::SourceMapper;
use crate::translator::Translator;

/// How long the worker waits for the trigger stream to go quiet before it
/// actually rebuilds. Collapses a burst of keystrokes into one rebuild.
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// Everything a rebuild needs that doesn't change across the life of the
/// proxy: where the sketch and its build artifacts live, how to invoke the
/// build tool, and the shared mapper/clangd handles to update afterward.
pub struct RebuildContext {
    /// Root directory of the sketch being edited.
    pub sketch_root: PathBuf,
    /// Scratch directory the build tool writes its output into.
    pub build_root: PathBuf,
    /// Fully qualified board name passed to the build tool.
    pub fqbn: String,
    /// Build tool executable.
    pub build_command: String,
    /// Extra arguments always passed to the build tool.
    pub build_args: Vec<String>,
    /// The shared mapper/document-store lock, swapped wholesale on every
    /// successful rebuild and read for the sketch-override snapshot.
    pub core: Arc<RwLock<CoreState>>,
    /// URI/range translator, used only to locate the synthesized file.
    pub translator: Translator,
    /// The always-on clangd connection, resynchronized after each rebuild.
    pub clangd: Arc<ClangdClient>,
    /// Document version clangd believes the synthesized file is at. Shared
    /// with whichever proxy code also forwards incremental edits to clangd,
    /// so the sequence never goes backwards.
    pub synth_version: AtomicI32,
}

impl RebuildContext {
    /// Allocates the next LSP document version for the synthesized file.
    pub fn next_version(&self) -> i32 {
        self.synth_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Owns the debounce worker task and the channel used to trigger it.
pub struct RebuildController {
    trigger_tx: mpsc::UnboundedSender<()>,
}

impl RebuildController {
    /// Spawns the debounce worker. Every `trigger()` call after this either
    /// starts a new quiet window or extends one already running.
    pub fn spawn(ctx: Arc<RebuildContext>) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(trigger_rx, ctx));
        Self { trigger_tx }
    }

    /// Requests a rebuild. Cheap and idempotent: calling it many times
    /// within the debounce window still produces exactly one rebuild.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }

    /// Runs a rebuild immediately, bypassing the debounce window. Used once
    /// clangd is already running, e.g. a `MappingFailure` asking for an
    /// immediate resync outside the normal debounce path.
    ///
    /// # Errors
    ///
    /// Returns whatever `perform_rebuild` returns.
    pub async fn run_once(ctx: &RebuildContext) -> ProxyResult<()> {
        // Nothing else holds this token, so this call can never be canceled.
        perform_rebuild(ctx, &Notify::new()).await
    }
}

/// Runs the mandatory bootstrap rebuild: the one invocation of the build
/// tool that happens before clangd has even been spawned, so it cannot
/// notify a clangd connection that doesn't exist yet. Returns the mapper
/// built from the synthesized file, for the caller to seed the shared core
/// state with before constructing a `RebuildContext` (which assumes clangd
/// is already running) for every subsequent rebuild.
///
/// # Errors
///
/// Returns `BuildFailure` if the build tool fails or leaves no synthesized
/// file behind.
pub async fn bootstrap(
    build_command: &str,
    build_args: &[String],
    sketch_root: &PathBuf,
    fqbn: &str,
    build_root: &PathBuf,
    translator: &Translator,
) -> ProxyResult<SourceMapper> {
    info!(sketch = %sketch_root.display(), "running bootstrap rebuild");

    // Nothing can trigger a concurrent rebuild before clangd even exists, so
    // this invocation is never canceled.
    build_tool::build(
        build_command,
        build_args,
        sketch_root,
        fqbn,
        build_root,
        &BuildOverrides::new(),
        &Notify::new(),
    )
    .await?;

    let synthesized_path = translator.synthesized_path();
    let text = tokio::fs::read_to_string(&synthesized_path)
        .await
        .map_err(|e| ProxyError::BuildFailure(format!("reading synthesized file: {e}")))?;

    Ok(SourceMapper::build(&text))
}

async fn worker(mut trigger_rx: mpsc::UnboundedReceiver<()>, ctx: Arc<RebuildContext>) {
    // Set when a trigger that arrived mid-build already canceled that build
    // (see below): it still has to start the *next* debounce wait, so the
    // top of the loop must not block on another trigger first.
    let mut pending_trigger = false;

    loop {
        if !pending_trigger {
            if trigger_rx.recv().await.is_none() {
                return;
            }
        }
        pending_trigger = false;

        // Triggers that arrive while a rebuild is already running queue here
        // and start a fresh window once that rebuild finishes, rather than
        // being dropped or racing it.
        if !wait_for_quiet(&mut trigger_rx).await {
            return;
        }

        let cancel = Arc::new(Notify::new());
        let mut build = Box::pin(perform_rebuild(&ctx, &cancel));

        // A trigger arriving while this build is in flight cancels it: the
        // build tool is killed and the worker loops back to the debounce
        // wait instead of letting a now-stale build finish.
        loop {
            tokio::select! {
                result = &mut build => {
                    if let Err(e) = result {
                        warn!("rebuild failed: {e}");
                    }
                    break;
                }
                trigger = trigger_rx.recv() => {
                    match trigger {
                        Some(()) => {
                            info!("new trigger arrived mid-rebuild, canceling in-flight build");
                            cancel.notify_one();
                            pending_trigger = true;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Drains `trigger_rx` until it goes quiet for a full debounce window.
/// Returns `false` if the channel closed instead, telling the caller to stop.
async fn wait_for_quiet(trigger_rx: &mut mpsc::UnboundedReceiver<()>) -> bool {
    loop {
        match tokio::time::timeout(DEBOUNCE_WINDOW, trigger_rx.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}

async fn perform_rebuild(ctx: &RebuildContext, cancel: &Notify) -> ProxyResult<()> {
    info!(sketch = %ctx.sketch_root.display(), "rebuilding");

    let overrides = snapshot_overrides(ctx).await;

    // The build tool is invoked with `--build-path` set to `build_root`
    // directly, the same directory clangd was started with
    // `--compile-commands-dir` pointed at, so the database lands in the
    // clangd-watched location as a side effect of the build itself.
    build_tool::build(
        &ctx.build_command,
        &ctx.build_args,
        &ctx.sketch_root,
        &ctx.fqbn,
        &ctx.build_root,
        &overrides,
        cancel,
    )
    .await?;

    let synthesized_path = ctx.translator.synthesized_path();
    let text = tokio::fs::read_to_string(&synthesized_path)
        .await
        .map_err(|e| ProxyError::BuildFailure(format!("reading synthesized file: {e}")))?;

    let uri = Url::from_file_path(&synthesized_path)
        .map_err(|()| ProxyError::MappingFailure(synthesized_path.display().to_string()))?;

    {
        let mut core = ctx.core.write().await;
        core.mapper = SourceMapper::build(&text);

        ctx.clangd
            .notify(
                "textDocument/didSave",
                DidSaveTextDocumentParams {
                    text_document: TextDocumentIdentifier { uri: uri.clone() },
                    text: Some(text.clone()),
                },
            )
            .await?;

        ctx.clangd
            .notify(
                "textDocument/didChange",
                DidChangeTextDocumentParams {
                    text_document: VersionedTextDocumentIdentifier {
                        uri: uri.clone(),
                        version: ctx.next_version(),
                    },
                    content_changes: vec![TextDocumentContentChangeEvent {
                        range: None,
                        range_length: None,
                        text,
                    }],
                },
            )
            .await?;
    }

    Ok(())
}

/// Collects `(relative_path → current_text)` for every tracked IDE document
/// that lives inside the sketch root, under the read lock. Unsaved editor
/// buffers participate in the next build this way, without ever touching the
/// files actually on disk.
async fn snapshot_overrides(ctx: &RebuildContext) -> BuildOverrides {
    let core = ctx.core.read().await;
    let mut overrides = BuildOverrides::new();

    for (uri, document) in core.documents.iter() {
        let Ok(parsed) = Url::parse(uri) else { continue };
        let Ok(path) = parsed.to_file_path() else { continue };
        let Ok(relative) = path.strip_prefix(&ctx.sketch_root) else {
            continue;
        };
        overrides.insert(relative.to_string_lossy().into_owned(), document.text.clone());
    }

    overrides
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn next_version_is_monotonically_increasing() {
        let ctx_version = AtomicI32::new(0);
        let first = ctx_version.fetch_add(1, Ordering::SeqCst) + 1;
        let second = ctx_version.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn triggers_within_the_debounce_window_collapse_to_a_single_wakeup() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tx.send(()).expect("send");
        tx.send(()).expect("send");
        tx.send(()).expect("send");

        let mut drained = 0;
        while tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_ok()
        {
            drained += 1;
        }
        assert_eq!(drained, 3);
        // All three were available well inside one debounce window; a real
        // worker loop drains them in the same quiet-window pass and performs
        // exactly one rebuild afterward.
    }

    #[tokio::test]
    async fn ten_triggers_fifty_millis_apart_collapse_to_one_quiet_period() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        // The outer `worker()` loop's first `recv()` already consumed the
        // trigger that opened this window; emulate that here before timing
        // the debounce wait itself.
        tx.send(()).expect("send");
        rx.recv().await.expect("first trigger");

        let start = tokio::time::Instant::now();
        for _ in 0..9 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(()).expect("send");
        }

        let became_quiet = wait_for_quiet(&mut rx).await;
        let elapsed = start.elapsed();

        assert!(became_quiet);
        // The wait can only return once the full debounce window has passed
        // with no new trigger, so it must take at least the nine 50ms gaps
        // plus one whole quiet window measured from the last trigger.
        assert!(elapsed >= Duration::from_millis(9 * 50) + DEBOUNCE_WINDOW);
        assert!(rx.try_recv().is_err(), "exactly one quiet period, no leftover triggers");
    }

    #[tokio::test]
    async fn closed_trigger_channel_ends_the_wait_without_a_rebuild() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        drop(tx);
        assert!(!wait_for_quiet(&mut rx).await);
    }
}
