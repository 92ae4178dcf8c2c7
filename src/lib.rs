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

//! Catenary is an Arduino Language Server: a protocol proxy standing between
//! an IDE speaking LSP and a `clangd` instance compiling the sketch's
//! synthesized translation unit.
//!
//! It makes the hybrid `.ino` sketch format appear to the IDE as a
//! first-class language while letting clangd operate on the single
//! preprocessed C++ file the Arduino build tool actually compiles.

/// Invokes the external build tool that turns a sketch into a synthesized
/// translation unit plus a `compile_commands.json`.
pub mod build_tool;
/// The clangd-facing endpoint: spawns and speaks LSP to a single clangd subprocess.
pub mod clangd;
/// Layered configuration: defaults, user config file, explicit config file, env vars.
pub mod config;
/// The state guarded by the shared readers-writer lock: the mapper and the
/// tracked document store, which move together between the proxy core and
/// the rebuild controller.
pub mod core_state;
/// The Tracked Document Store: the in-memory authoritative copy of every
/// document the IDE currently has open.
pub mod document_store;
/// The error kinds the proxy core can surface, shared by every component.
pub mod error;
/// The IDE-facing endpoint: the server half of the proxy, speaking LSP over
/// our own process's stdio.
pub mod ide;
/// The Source Mapper: bidirectional `.ino` ↔ synthesized-`.cpp` line mapping.
pub mod mapper;
/// The Progress Proxy: orders `$/progress` notifications around a possibly
/// delayed `workDoneProgress/create` acknowledgment.
pub mod progress;
/// JSON-RPC message shapes and the Content-Length wire framing.
pub mod protocol;
/// The LSP Proxy Core: the method-by-method translation layer.
pub mod proxy;
/// The Rebuild Controller: debounced rebuilds that resynchronize clangd.
pub mod rebuild;
/// Translates document URIs and ranges between IDE space and clang space.
pub mod translator;
