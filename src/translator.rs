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

//! Translates document URIs and ranges between IDE space (sketch tabs) and
//! clang space (the synthesized translation unit and mirrored helper files).

use std::path::{Path, PathBuf};

use lsp_types::{Position, Range, Url};

use crate::error::{ProxyError, ProxyResult};
use crate::mapper::{LineOrigin, SourceMapper};

/// The one-line offset mirrored `.cpp`/`.h` files carry, because the
/// preprocessor inserts a leading `#include <Arduino.h>` that the IDE's copy
/// of the file never sees.
const MIRROR_LINE_OFFSET: u32 = 1;

/// Result of translating a clang-space URI back into IDE space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdeUri {
    /// A concrete IDE-visible document.
    Document(Url),
    /// The clang-space location fell in a preprocessed region with no IDE
    /// counterpart; callers must drop the result it was attached to.
    Preprocessed,
}

/// Translates URIs and ranges between IDE space and clang space.
pub struct Translator {
    sketch_root: PathBuf,
    build_root: PathBuf,
    sketch_name: String,
}

impl Translator {
    /// Creates a translator bound to a sketch's root and build directories.
    #[must_use]
    pub fn new(sketch_root: PathBuf, build_root: PathBuf) -> Self {
        let sketch_name = sketch_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sketch".to_string());
        Self {
            sketch_root,
            build_root,
            sketch_name,
        }
    }

    /// The synthesized translation unit's path, `build_root/sketch/<name>.ino.cpp`.
    #[must_use]
    pub fn synthesized_path(&self) -> PathBuf {
        self.build_root
            .join("sketch")
            .join(format!("{}.ino.cpp", self.sketch_name))
    }

    /// The sketch's root directory.
    #[must_use]
    pub fn sketch_root(&self) -> &Path {
        &self.sketch_root
    }

    /// The scratch directory the build tool writes its output into.
    #[must_use]
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// Whether a clang-space edit at `range`, translated back to IDE space,
    /// would land inside the sketch. Used to reject rename edits that would
    /// otherwise silently reach into a library header or other out-of-sketch
    /// file: a edit target that doesn't resolve to a tracked tab under
    /// `sketch_root` fails this check, including clangd edits to files this
    /// translator has no mirror relationship with at all.
    #[must_use]
    pub fn is_edit_target_inside_sketch(&self, clang_uri: &Url, range: Range, mapper: &SourceMapper) -> bool {
        match self.clang_uri_to_ide(clang_uri, Some(range), mapper, None) {
            Ok(IdeUri::Document(ide_uri)) => ide_uri
                .to_file_path()
                .is_ok_and(|p| p.starts_with(&self.sketch_root)),
            _ => false,
        }
    }

    fn synthesized_uri(&self) -> ProxyResult<Url> {
        path_to_uri(&self.synthesized_path())
    }

    /// Whether a path sits inside the sketch root.
    fn in_sketch(&self, path: &Path) -> bool {
        path.starts_with(&self.sketch_root)
    }

    fn mirrored_path(&self, ide_path: &Path) -> ProxyResult<PathBuf> {
        let relative = ide_path.strip_prefix(&self.sketch_root).map_err(|_| {
            ProxyError::UnknownUri(format!("{} is outside the sketch", ide_path.display()))
        })?;
        Ok(self.build_root.join("sketch").join(relative))
    }

    /// Translates an IDE-space URI to its clang-space counterpart.
    ///
    /// # Errors
    ///
    /// Returns `UnknownUri` if the URI cannot be parsed as a file path.
    pub fn ide_uri_to_clang(&self, uri: &Url) -> ProxyResult<Url> {
        let path = uri_to_path(uri)?;

        if !self.in_sketch(&path) {
            return Ok(uri.clone());
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some("ino") => self.synthesized_uri(),
            Some("cpp" | "h") => path_to_uri(&self.mirrored_path(&path)?),
            _ => Ok(uri.clone()),
        }
    }

    /// Translates a clang-space URI back to IDE space.
    ///
    /// When `range` targets the synthesized file, the line it starts on
    /// determines which tab it came from via `mapper`; if no range is given,
    /// `fallback_ino` (a representative tracked `.ino` URI) is used instead.
    ///
    /// # Errors
    ///
    /// Returns `UnknownUri` if the clang URI cannot be resolved to a tab.
    pub fn clang_uri_to_ide(
        &self,
        uri: &Url,
        range: Option<Range>,
        mapper: &SourceMapper,
        fallback_ino: Option<&Url>,
    ) -> ProxyResult<IdeUri> {
        let path = uri_to_path(uri)?;

        if path == self.synthesized_path() {
            return match range {
                Some(r) => match mapper.cpp_to_ino_line(r.start.line as usize) {
                    Some(LineOrigin::Source { ino_file, .. }) => {
                        Ok(IdeUri::Document(self.ino_file_uri(ino_file)?))
                    }
                    Some(LineOrigin::Preprocessed) => Ok(IdeUri::Preprocessed),
                    None => Err(ProxyError::OutOfRange(format!("cpp line {}", r.start.line))),
                },
                None => fallback_ino.map_or_else(
                    || {
                        Err(ProxyError::UnknownUri(
                            "synthesized file has no range and no fallback tab".to_string(),
                        ))
                    },
                    |u| Ok(IdeUri::Document(u.clone())),
                ),
            };
        }

        if let Ok(relative) = path.strip_prefix(self.build_root.join("sketch")) {
            return Ok(IdeUri::Document(path_to_uri(&self.sketch_root.join(relative))?));
        }

        Ok(IdeUri::Document(uri.clone()))
    }

    fn ino_file_uri(&self, ino_file: &str) -> ProxyResult<Url> {
        path_to_uri(&self.sketch_root.join(ino_file))
    }

    /// Translates a range in IDE space (belonging to `ino_uri`) to clang
    /// space. Delegates to the mapper for `.ino` tabs; mirrored `.cpp`/`.h`
    /// files shift by the preamble's one-line offset, everything else is
    /// identity.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the range falls outside the mapper's known
    /// lines for the tab.
    pub fn range_to_clang(&self, ino_uri: &Url, range: Range, mapper: &SourceMapper) -> ProxyResult<Range> {
        let path = uri_to_path(ino_uri)?;
        if !self.in_sketch(&path) {
            return Ok(range);
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some("ino") => {
                let ino_file = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| ProxyError::UnknownUri(ino_uri.to_string()))?;
                Ok(mapper.ino_range_to_cpp(&ino_file, range)?.range)
            }
            Some("cpp" | "h") => Ok(offset_range(range, MIRROR_LINE_OFFSET as i64)),
            _ => Ok(range),
        }
    }

    /// Translates a range in clang space back to IDE space for the tab it
    /// was found in.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the synthesized line was never materialized.
    pub fn range_to_ide(&self, clang_uri: &Url, range: Range, mapper: &SourceMapper) -> ProxyResult<Range> {
        let path = uri_to_path(clang_uri)?;

        if path == self.synthesized_path() {
            return Ok(mapper.cpp_range_to_ino(range)?.1.range);
        }

        if path.strip_prefix(self.build_root.join("sketch")).is_ok()
            && matches!(path.extension().and_then(|e| e.to_str()), Some("cpp" | "h"))
        {
            return Ok(offset_range(range, -(MIRROR_LINE_OFFSET as i64)));
        }

        Ok(range)
    }
}

fn offset_range(range: Range, delta: i64) -> Range {
    let shift = |p: Position| {
        let line = i64::from(p.line) + delta;
        Position::new(u32::try_from(line.max(0)).unwrap_or(0), p.character)
    };
    Range::new(shift(range.start), shift(range.end))
}

fn uri_to_path(uri: &Url) -> ProxyResult<PathBuf> {
    uri.to_file_path()
        .map_err(|()| ProxyError::UnknownUri(uri.to_string()))
}

fn path_to_uri(path: &Path) -> ProxyResult<Url> {
    Url::from_file_path(path).map_err(|()| ProxyError::UnknownUri(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::SourceMapper;

    fn translator() -> Translator {
        Translator::new(PathBuf::from("/sketches/blink"), PathBuf::from("/tmp/build"))
    }

    #[test]
    fn ino_tabs_translate_to_the_single_synthesized_file() {
        let t = translator();
        let uri = Url::from_file_path("/sketches/blink/blink.ino").unwrap();
        let clang = t.ide_uri_to_clang(&uri).expect("translate");
        assert_eq!(clang, Url::from_file_path(t.synthesized_path()).unwrap());
    }

    #[test]
    fn cpp_helpers_mirror_under_the_build_root() {
        let t = translator();
        let uri = Url::from_file_path("/sketches/blink/util.cpp").unwrap();
        let clang = t.ide_uri_to_clang(&uri).expect("translate");
        assert_eq!(
            clang,
            Url::from_file_path("/tmp/build/sketch/util.cpp").unwrap()
        );
    }

    #[test]
    fn paths_outside_the_sketch_are_identity() {
        let t = translator();
        let uri = Url::from_file_path("/usr/include/Arduino.h").unwrap();
        let clang = t.ide_uri_to_clang(&uri).expect("translate");
        assert_eq!(clang, uri);
    }

    #[test]
    fn preprocessed_clang_range_signals_preprocessed() {
        let t = translator();
        let mapper = SourceMapper::build("#include <Arduino.h>\n#line 1 \"blink.ino\"\nvoid setup() {}\n");
        let synth_uri = Url::from_file_path(t.synthesized_path()).unwrap();
        let range = Range::new(Position::new(0, 0), Position::new(0, 1));
        let result = t
            .clang_uri_to_ide(&synth_uri, Some(range), &mapper, None)
            .expect("translate");
        assert_eq!(result, IdeUri::Preprocessed);
    }

    #[test]
    fn synthesized_range_resolves_to_owning_tab() {
        let t = translator();
        let mapper = SourceMapper::build("#include <Arduino.h>\n#line 1 \"blink.ino\"\nvoid setup() {}\n");
        let synth_uri = Url::from_file_path(t.synthesized_path()).unwrap();
        let range = Range::new(Position::new(2, 0), Position::new(2, 1));
        let result = t
            .clang_uri_to_ide(&synth_uri, Some(range), &mapper, None)
            .expect("translate");
        assert_eq!(
            result,
            IdeUri::Document(Url::from_file_path("/sketches/blink/blink.ino").unwrap())
        );
    }

    #[test]
    fn mirrored_cpp_range_carries_the_preamble_offset() {
        let t = translator();
        let mapper = SourceMapper::build("#include <Arduino.h>\n");
        let uri = Url::from_file_path("/sketches/blink/util.cpp").unwrap();
        let range = Range::new(Position::new(0, 0), Position::new(0, 3));
        let clang_range = t.range_to_clang(&uri, range, &mapper).expect("translate");
        assert_eq!(clang_range.start.line, 1);

        let back = t
            .range_to_ide(
                &Url::from_file_path("/tmp/build/sketch/util.cpp").unwrap(),
                clang_range,
                &mapper,
            )
            .expect("translate");
        assert_eq!(back.start.line, 0);
    }
}
