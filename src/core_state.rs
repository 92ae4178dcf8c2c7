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

//! The state guarded by the proxy core's single readers-writer lock: the
//! Source Mapper and the Tracked Document Store move together, since almost
//! every translation needs a consistent snapshot of both, and the Rebuild
//! Controller replaces the mapper wholesale under the same lock it reads
//! tracked documents through.

use crate::document_store::DocumentStore;
use crate::mapper::SourceMapper;

/// Mutable state shared between the proxy core and the rebuild controller.
pub struct CoreState {
    /// The current `.ino ↔ synth.cpp` correspondence.
    pub mapper: SourceMapper,
    /// Every document the IDE currently has open.
    pub documents: DocumentStore,
}

impl CoreState {
    /// Builds the initial state around a freshly constructed mapper, with an
    /// empty document store (nothing is tracked until the IDE opens a tab).
    #[must_use]
    pub fn new(mapper: SourceMapper) -> Self {
        Self {
            mapper,
            documents: DocumentStore::new(),
        }
    }
}
