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

//! Catenary's Arduino Language Server entry point.
//!
//! Wires the core (mapper, translator, document store, rebuild controller,
//! proxy) to an actual sketch on disk and a real clangd subprocess, and
//! drives the IDE-facing and clangd-facing message loops over stdio.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use lsp_types::{MessageType, ShowMessageParams, Url};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use catenary_ino_ls::clangd::ClangdClient;
use catenary_ino_ls::config::Config;
use catenary_ino_ls::core_state::CoreState;
use catenary_ino_ls::ide::IdeEndpoint;
use catenary_ino_ls::protocol::RequestMessage;
use catenary_ino_ls::proxy::Proxy;
use catenary_ino_ls::rebuild::{self, RebuildContext};
use catenary_ino_ls::translator::Translator;

/// Version string embedded by `build.rs`: the nearest git tag, or
/// `CARGO_PKG_VERSION` if git was unavailable at build time.
const VERSION: &str = env!("CATENARY_INO_LS_VERSION");

/// Command-line arguments for the Arduino Language Server.
#[derive(Parser, Debug)]
#[command(name = "catenary-ino-ls", version = VERSION)]
#[command(about = "Arduino Language Server: an LSP proxy between an IDE and clangd")]
struct Args {
    /// Root directory of the sketch to serve.
    sketch_root: PathBuf,

    /// Path to configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fully qualified board name. Overrides the config file if set.
    #[arg(long)]
    fqbn: Option<String>,

    /// Scratch directory the build tool writes its output into. Overrides
    /// the config file if set.
    #[arg(long)]
    build_root: Option<PathBuf>,

    /// Path to the clangd executable. Overrides the config file if set.
    #[arg(long)]
    clangd_path: Option<PathBuf>,
}

/// Entry point for the `catenary-ino-ls` binary.
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded or the sketch root
/// does not exist; failures past that point are surfaced to the IDE rather
/// than returned, and instead surfaced to the IDE once it connects.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.clone())?;
    if let Some(fqbn) = args.fqbn.clone() {
        config.fqbn = fqbn;
    }
    if let Some(build_root) = args.build_root.clone() {
        config.build_root = build_root;
    }
    if let Some(clangd_path) = args.clangd_path.clone() {
        config.clangd_path = clangd_path;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("catenary_ino_ls={}", config.log_level))),
        )
        .with_writer(std::io::stderr)
        .init();

    let sketch_root = tokio::fs::canonicalize(&args.sketch_root)
        .await
        .map_err(|e| anyhow::anyhow!("canonicalizing sketch root {}: {e}", args.sketch_root.display()))?;

    let translator = Translator::new(sketch_root.clone(), config.build_root.clone());
    let ide = Arc::new(IdeEndpoint::new(tokio::io::stdin(), tokio::io::stdout()));

    info!(sketch = %sketch_root.display(), fqbn = %config.fqbn, "starting");

    let initial_mapper = match rebuild::bootstrap(
        &config.build_command,
        &config.build_args,
        &sketch_root,
        &config.fqbn,
        &config.build_root,
        &translator,
    )
    .await
    {
        Ok(mapper) => mapper,
        Err(failure) => {
            error!("bootstrap rebuild failed: {failure}");
            run_degraded(ide, failure.to_string()).await;
            return Ok(());
        }
    };

    let core = Arc::new(RwLock::new(CoreState::new(initial_mapper)));

    let clangd = match ClangdClient::spawn(&config.clangd_path, &config.build_root, &config.clangd_args).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("spawning clangd failed: {e}");
            run_degraded(ide, e.to_string()).await;
            return Ok(());
        }
    };

    let init_params = lsp_types::InitializeParams {
        process_id: Some(std::process::id()),
        root_uri: Url::from_directory_path(&sketch_root).ok(),
        capabilities: lsp_types::ClientCapabilities::default(),
        ..Default::default()
    };

    if let Err(e) = clangd.initialize(init_params).await {
        error!("clangd initialize failed: {e}");
        clangd.kill().await;
        run_degraded(ide, e.to_string()).await;
        return Ok(());
    }

    let rebuild_ctx = Arc::new(RebuildContext {
        sketch_root: sketch_root.clone(),
        build_root: config.build_root.clone(),
        fqbn: config.fqbn.clone(),
        build_command: config.build_command.clone(),
        build_args: config.build_args.clone(),
        core: core.clone(),
        translator: Translator::new(sketch_root.clone(), config.build_root.clone()),
        clangd: clangd.clone(),
        synth_version: std::sync::atomic::AtomicI32::new(0),
    });

    let proxy = Proxy::new(translator, core, clangd.clone(), ide.clone(), rebuild_ctx);
    proxy.mark_clangd_started();

    tokio::select! {
        () = proxy.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl_c received, shutting down");
        }
    }

    clangd.kill().await;
    Ok(())
}

/// Runs a minimal IDE-facing loop with no clangd connection: answers
/// `initialize` with an empty capability set, surfaces the bootstrap
/// failure via `window/showMessage`, and replies to `shutdown`/`exit` so the
/// IDE can still close the connection cleanly.
async fn run_degraded(ide: Arc<IdeEndpoint>, failure_message: String) {
    let message = format!(
        "Arduino Language Server failed to start: {failure_message}. Check that the board core and any \
         referenced libraries are installed."
    );

    while let Some(request) = ide.next_request().await {
        let RequestMessage { id, method, .. } = request;
        match method.as_str() {
            "initialize" => {
                let _ = ide
                    .respond_ok(id, serde_json::json!({ "capabilities": {} }))
                    .await;
                let _ = ide
                    .notify(
                        "window/showMessage",
                        ShowMessageParams {
                            typ: MessageType::ERROR,
                            message: message.clone(),
                        },
                    )
                    .await;
            }
            "shutdown" => {
                let _ = ide.respond_ok(id, Value::Null).await;
            }
            "exit" => return,
            other => {
                warn!("degraded mode: no clangd connection, rejecting {other}");
                let _ = ide
                    .respond_err(id, -32603, "server failed to start".to_string())
                    .await;
            }
        }
    }
}
