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

//! Invokes the external build tool that turns a sketch into a synthesized
//! translation unit plus a `compile_commands.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt as _;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};

/// A single entry of a `compile_commands.json` database.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompileCommand {
    /// Working directory the command was recorded in.
    pub directory: String,
    /// The invoked compiler command line.
    pub command: Option<String>,
    /// The compiled file.
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
}

/// The IDE's in-memory content for tracked sketch files, keyed by path
/// relative to `sketch_root`. Applied over the on-disk sketch before the
/// build tool runs, so a rebuild reflects unsaved editor state rather than
/// whatever was last written to disk.
pub type BuildOverrides = HashMap<String, String>;

/// Runs the external build tool against a sketch, producing a synthesized
/// translation unit and compile commands database under `build_root`.
///
/// `overrides` is laid over a scratch copy of the sketch before invocation,
/// so unsaved IDE buffers participate in the build without ever touching the
/// files on disk.
///
/// # Errors
///
/// Returns `BuildFailure` if the tool exits non-zero, if it leaves no
/// `compile_commands.json` behind, or if `cancel` fires before the tool
/// exits (the child process is killed in that case).
pub async fn build(
    build_command: &str,
    build_args: &[String],
    sketch_root: &Path,
    fqbn: &str,
    build_root: &Path,
    overrides: &BuildOverrides,
    cancel: &Notify,
) -> ProxyResult<PathBuf> {
    tokio::fs::create_dir_all(build_root)
        .await
        .map_err(|e| ProxyError::BuildFailure(format!("creating build root: {e}")))?;

    let staged = stage_sketch_with_overrides(sketch_root, overrides).await?;

    let mut command = Command::new(build_command);
    command
        .args(build_args)
        .arg("--fqbn")
        .arg(fqbn)
        .arg("--build-path")
        .arg(build_root)
        .arg(staged.path())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    debug!(?command, "invoking build tool");
    let mut child = command
        .spawn()
        .map_err(|e| ProxyError::BuildFailure(format!("spawning build tool: {e}")))?;
    let mut stderr_pipe = child.stderr.take();

    // A new trigger arriving mid-build kills the in-flight build tool
    // invocation rather than letting it run to completion; the worker loop
    // restarts the debounce wait afterward.
    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| ProxyError::BuildFailure(format!("waiting for build tool: {e}")))?,
        () = cancel.notified() => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return Err(ProxyError::BuildFailure("rebuild canceled by a newer trigger".to_string()));
        }
    };

    let mut stderr = String::new();
    if let Some(mut pipe) = stderr_pipe.take() {
        let _ = pipe.read_to_string(&mut stderr).await;
    }

    if !status.success() {
        return Err(ProxyError::BuildFailure(stderr));
    }

    let compile_commands = build_root.join("compile_commands.json");
    if !compile_commands.is_file() {
        return Err(ProxyError::BuildFailure(
            "build tool did not produce compile_commands.json".to_string(),
        ));
    }

    canonicalize_compiler_paths(&compile_commands).await?;

    Ok(compile_commands)
}

/// Copies the sketch into a scratch directory and overlays `overrides` on
/// top, so the build tool sees unsaved IDE buffers without us mutating the
/// user's actual sketch files.
async fn stage_sketch_with_overrides(
    sketch_root: &Path,
    overrides: &BuildOverrides,
) -> ProxyResult<tempfile::TempDir> {
    let staged = tempfile::Builder::new()
        .prefix("arduino-ls-sketch-")
        .tempdir()
        .map_err(|e| ProxyError::BuildFailure(format!("creating scratch sketch dir: {e}")))?;

    copy_dir_recursive(sketch_root, staged.path()).await?;

    for (relative_path, text) in overrides {
        let dest = staged.path().join(relative_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::BuildFailure(format!("staging override: {e}")))?;
        }
        tokio::fs::write(&dest, text)
            .await
            .map_err(|e| ProxyError::BuildFailure(format!("staging override: {e}")))?;
    }

    Ok(staged)
}

async fn copy_dir_recursive(from: &Path, to: &Path) -> ProxyResult<()> {
    let mut entries = tokio::fs::read_dir(from)
        .await
        .map_err(|e| ProxyError::BuildFailure(format!("reading sketch dir: {e}")))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ProxyError::BuildFailure(format!("reading sketch dir: {e}")))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| ProxyError::BuildFailure(format!("reading sketch dir: {e}")))?;
        let dest = to.join(entry.file_name());

        if file_type.is_dir() {
            tokio::fs::create_dir_all(&dest)
                .await
                .map_err(|e| ProxyError::BuildFailure(format!("staging sketch copy: {e}")))?;
            Box::pin(copy_dir_recursive(&entry.path(), &dest)).await?;
        } else if file_type.is_file() {
            tokio::fs::copy(entry.path(), &dest)
                .await
                .map_err(|e| ProxyError::BuildFailure(format!("staging sketch copy: {e}")))?;
        }
    }

    Ok(())
}

/// Rewrites each entry's compiler path to an absolute one, appending `.exe`
/// on Windows when the recorded path omits it. clangd resolves compilers
/// relative to its own working directory otherwise, not the one recorded at
/// build time.
async fn canonicalize_compiler_paths(compile_commands: &Path) -> ProxyResult<()> {
    let raw = tokio::fs::read_to_string(compile_commands)
        .await
        .map_err(|e| ProxyError::BuildFailure(format!("reading compile_commands.json: {e}")))?;

    let mut entries: Vec<CompileCommand> = serde_json::from_str(&raw)
        .map_err(|e| ProxyError::BuildFailure(format!("parsing compile_commands.json: {e}")))?;

    for entry in &mut entries {
        if let Some(arguments) = &mut entry.arguments {
            if let Some(first) = arguments.first_mut() {
                *first = canonicalize_compiler_path(first, &entry.directory)?;
            }
        } else if let Some(command) = &entry.command {
            let mut parts = command.splitn(2, char::is_whitespace);
            let compiler = parts.next().unwrap_or_default();
            let rest = parts.next().unwrap_or_default();
            let canonical = canonicalize_compiler_path(compiler, &entry.directory)?;
            entry.command = Some(if rest.is_empty() {
                canonical
            } else {
                format!("{canonical} {rest}")
            });
        }
    }

    let rewritten = serde_json::to_string_pretty(&entries)
        .map_err(|e| ProxyError::BuildFailure(format!("serializing compile_commands.json: {e}")))?;
    tokio::fs::write(compile_commands, rewritten)
        .await
        .map_err(|e| ProxyError::BuildFailure(format!("writing compile_commands.json: {e}")))?;

    Ok(())
}

fn canonicalize_compiler_path(compiler: &str, directory: &str) -> ProxyResult<String> {
    let mut path = PathBuf::from(compiler);
    if path.is_relative() {
        path = PathBuf::from(directory).join(path);
    }

    if cfg!(windows) && path.extension().is_none() {
        path.set_extension("exe");
    }

    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_command_deserializes_with_either_command_or_arguments_shape() {
        let json = r#"{
            "directory": "/build",
            "command": "g++ -c sketch.ino.cpp",
            "file": "sketch.ino.cpp"
        }"#;
        let parsed: CompileCommand = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.file, "sketch.ino.cpp");
        assert!(parsed.command.is_some());
        assert!(parsed.arguments.is_none());
    }
}
