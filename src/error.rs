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

//! The error kinds the proxy core can surface, shared by every component.

use thiserror::Error;

/// A failure originating in the mapper, translator, document store, rebuild
/// controller, or proxy core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// A document URI is not tracked and has no synthesized counterpart.
    #[error("unknown document: {0}")]
    UnknownUri(String),

    /// A position or line falls outside the bounds of the document it names.
    #[error("position out of range: {0}")]
    OutOfRange(String),

    /// A peer endpoint sent a malformed or unexpected message.
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    /// Clangd is starting, crashed, or a call to it timed out.
    #[error("clangd unavailable: {0}")]
    ClangdUnavailable(String),

    /// The external build tool exited non-zero or produced no synthesized file.
    #[error("build failed: {0}")]
    BuildFailure(String),

    /// A clang-space range could not be mapped; the mapper is structurally stale.
    #[error("mapping failure: {0}")]
    MappingFailure(String),

    /// A rename's workspace edit reached outside the sketch directory.
    #[error("{0}")]
    InvalidRenameTarget(String),
}

impl ProxyError {
    /// The LSP JSON-RPC error code to report this error under.
    ///
    /// Every kind surfaces to the IDE as `InternalError` except rename
    /// rejections, which callers construct directly as `InvalidParams`.
    #[must_use]
    pub const fn lsp_code(&self) -> i64 {
        match self {
            Self::ClangdUnavailable(_) => -32000,
            Self::InvalidRenameTarget(_) => -32602,
            _ => -32603,
        }
    }
}

/// Convenience alias for fallible operations within the proxy core.
pub type ProxyResult<T> = Result<T, ProxyError>;
