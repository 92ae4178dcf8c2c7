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

//! The Source Mapper: bidirectional `.ino` ↔ synthesized-`.cpp` line mapping.
//!
//! Built once from a synthesized translation unit emitted by the external
//! build tool and mutated under incremental edits until a structural change
//! forces the Rebuild Controller to discard and rebuild it wholesale.

use std::collections::HashMap;
use std::fmt::Write as _;

use lsp_types::{Position, Range};

use crate::error::{ProxyError, ProxyResult};

/// What a synthesized line corresponds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOrigin {
    /// Preamble, `#line` directive, or other line that never round-trips to a tab.
    Preprocessed,
    /// A real line of a `.ino`/`.cpp`/`.h` tab.
    Source {
        /// The tab's file name, as it appeared in the `#line` directive.
        ino_file: String,
        /// Zero-indexed line within that tab.
        ino_line: usize,
    },
}

/// A single-line replacement expressed in ino-space coordinates.
///
/// `end_line` is exclusive: replacing lines `[start_line, end_line)` of
/// `ino_file` with `new_lines`. An insertion has `start_line == end_line`.
#[derive(Debug, Clone)]
pub struct LineChange<'a> {
    /// Tab the edit originated in.
    pub ino_file: &'a str,
    /// First ino line replaced (inclusive).
    pub start_line: usize,
    /// One past the last ino line replaced (exclusive).
    pub end_line: usize,
    /// Replacement lines.
    pub new_lines: Vec<String>,
}

/// A range translated across the `.ino` ↔ synthesized boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRange {
    /// The translated range.
    pub range: Range,
    /// Set when the end of the source range fell past the last materialized
    /// line of its file and had to be clamped.
    pub adjusted: bool,
}

/// Bidirectional `.ino` ↔ synthesized-`.cpp` line correspondence.
#[derive(Debug, Clone)]
pub struct SourceMapper {
    lines: Vec<String>,
    version: i64,
    to_ino: HashMap<usize, LineOrigin>,
    to_cpp: HashMap<(String, usize), usize>,
}

impl SourceMapper {
    /// Builds a mapper by scanning a synthesized translation unit for
    /// `#line N "FILE"` directives.
    ///
    /// Lines before the first directive (the preamble) and the directive
    /// lines themselves are preprocessed; every other line binds the
    /// directive's current `(file, ino_line)` pair and advances it by one.
    #[must_use]
    pub fn build(cpp_text: &str) -> Self {
        let lines: Vec<String> = cpp_text.lines().map(str::to_string).collect();
        let mut to_ino = HashMap::new();
        let mut to_cpp = HashMap::new();

        let mut current: Option<(String, usize)> = None;
        for (cpp_line, text) in lines.iter().enumerate() {
            if let Some((file, ino_n)) = parse_line_directive(text) {
                current = Some((file, ino_n.saturating_sub(1)));
                to_ino.insert(cpp_line, LineOrigin::Preprocessed);
                continue;
            }

            let Some((file, ino_line)) = current.as_mut() else {
                to_ino.insert(cpp_line, LineOrigin::Preprocessed);
                continue;
            };

            to_ino.insert(
                cpp_line,
                LineOrigin::Source {
                    ino_file: file.clone(),
                    ino_line: *ino_line,
                },
            );
            to_cpp.insert((file.clone(), *ino_line), cpp_line);
            *ino_line += 1;
        }

        Self {
            lines,
            version: 0,
            to_ino,
            to_cpp,
        }
    }

    /// The synthesized text's own version counter, independent of any IDE
    /// document version.
    #[must_use]
    pub const fn version(&self) -> i64 {
        self.version
    }

    /// Reassembles the full synthesized text.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let _ = writeln!(out, "{line}");
        }
        out
    }

    /// Number of lines currently in the synthesized text.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Looks up what a synthesized line corresponds to.
    #[must_use]
    pub fn cpp_to_ino_line(&self, cpp_line: usize) -> Option<&LineOrigin> {
        self.to_ino.get(&cpp_line)
    }

    /// Looks up the synthesized line for a tab line, if it was materialized.
    #[must_use]
    pub fn ino_to_cpp_line(&self, ino_file: &str, ino_line: usize) -> Option<usize> {
        self.to_cpp.get(&(ino_file.to_string(), ino_line)).copied()
    }

    /// Whether a synthesized line is preprocessed (preamble or directive).
    #[must_use]
    pub fn is_preprocessed(&self, cpp_line: usize) -> bool {
        matches!(self.to_ino.get(&cpp_line), Some(LineOrigin::Preprocessed))
    }

    /// Translates a range in the synthesized file to the owning tab's space.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the start line is preprocessed or beyond the
    /// text, or `MappingFailure` if the range spans more than one tab.
    pub fn cpp_range_to_ino(&self, range: Range) -> ProxyResult<(String, MappedRange)> {
        let start_origin = self
            .cpp_to_ino_line(range.start.line as usize)
            .ok_or_else(|| ProxyError::OutOfRange(format!("cpp line {}", range.start.line)))?;
        let LineOrigin::Source {
            ino_file,
            ino_line: start_ino,
        } = start_origin
        else {
            return Err(ProxyError::OutOfRange(format!(
                "cpp line {} is preprocessed",
                range.start.line
            )));
        };

        let mut adjusted = false;
        let end_line = if range.end.line == range.start.line {
            *start_ino
        } else {
            match self.cpp_to_ino_line(range.end.line as usize) {
                Some(LineOrigin::Source {
                    ino_file: end_file,
                    ino_line: end_ino,
                }) if end_file == ino_file => *end_ino,
                _ => {
                    adjusted = true;
                    *start_ino
                }
            }
        };

        let translated = Range::new(
            Position::new(u32::try_from(*start_ino).unwrap_or(u32::MAX), range.start.character),
            Position::new(u32::try_from(end_line).unwrap_or(u32::MAX), range.end.character),
        );

        Ok((
            ino_file.clone(),
            MappedRange {
                range: translated,
                adjusted,
            },
        ))
    }

    /// Translates a range in a tab's space to the synthesized file.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if either endpoint was never materialized.
    pub fn ino_range_to_cpp(&self, ino_file: &str, range: Range) -> ProxyResult<MappedRange> {
        let start_cpp = self
            .ino_to_cpp_line(ino_file, range.start.line as usize)
            .ok_or_else(|| {
                ProxyError::OutOfRange(format!("{ino_file}:{}", range.start.line))
            })?;

        let mut adjusted = false;
        let end_cpp = self
            .ino_to_cpp_line(ino_file, range.end.line as usize)
            .unwrap_or_else(|| {
                adjusted = true;
                start_cpp
            });

        let translated = Range::new(
            Position::new(u32::try_from(start_cpp).unwrap_or(u32::MAX), range.start.character),
            Position::new(u32::try_from(end_cpp).unwrap_or(u32::MAX), range.end.character),
        );

        Ok(MappedRange {
            range: translated,
            adjusted,
        })
    }

    /// Applies a line-granular edit under the write lock, shifting every
    /// mapping entry affected by the insertion/removal.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `start_line` was never materialized for
    /// `ino_file`.
    pub fn apply_change(&mut self, change: &LineChange<'_>) -> ProxyResult<()> {
        let start_cpp = self
            .ino_to_cpp_line(change.ino_file, change.start_line)
            .ok_or_else(|| {
                ProxyError::OutOfRange(format!("{}:{}", change.ino_file, change.start_line))
            })?;

        if change.end_line < change.start_line {
            return Err(ProxyError::OutOfRange(format!(
                "{}: end line {} precedes start line {}",
                change.ino_file, change.end_line, change.start_line
            )));
        }
        let lines_removed = change.end_line - change.start_line;
        let removed_end = start_cpp + lines_removed;
        if removed_end > self.lines.len() {
            return Err(ProxyError::OutOfRange(format!(
                "{}:{}: end line beyond the {} lines currently mapped",
                change.ino_file,
                change.end_line,
                self.lines.len()
            )));
        }
        let lines_inserted = change.new_lines.len();
        let delta = i64::try_from(lines_inserted).unwrap_or(i64::MAX)
            - i64::try_from(lines_removed).unwrap_or(i64::MAX);

        // Splice the physical line array.
        self.lines
            .splice(start_cpp..removed_end, change.new_lines.iter().cloned());

        // Drop mappings for the removed region, then rebuild every other
        // entry at its shifted position.
        let mut new_to_ino = HashMap::with_capacity(self.to_ino.len());
        let mut new_to_cpp = HashMap::with_capacity(self.to_cpp.len());

        for (cpp_line, origin) in &self.to_ino {
            if (start_cpp..removed_end).contains(cpp_line) {
                continue;
            }

            let shifted_cpp = shift(*cpp_line, removed_end, delta);

            let shifted_origin = match origin {
                LineOrigin::Preprocessed => LineOrigin::Preprocessed,
                LineOrigin::Source { ino_file, ino_line } if ino_file == change.ino_file => {
                    let shifted_ino = shift(*ino_line, change.end_line, delta);
                    LineOrigin::Source {
                        ino_file: ino_file.clone(),
                        ino_line: shifted_ino,
                    }
                }
                LineOrigin::Source { ino_file, ino_line } => LineOrigin::Source {
                    ino_file: ino_file.clone(),
                    ino_line: *ino_line,
                },
            };

            if let LineOrigin::Source { ino_file, ino_line } = &shifted_origin {
                new_to_cpp.insert((ino_file.clone(), *ino_line), shifted_cpp);
            }
            new_to_ino.insert(shifted_cpp, shifted_origin);
        }

        for offset in 0..change.new_lines.len() {
            let cpp_line = start_cpp + offset;
            let ino_line = change.start_line + offset;
            new_to_ino.insert(
                cpp_line,
                LineOrigin::Source {
                    ino_file: change.ino_file.to_string(),
                    ino_line,
                },
            );
            new_to_cpp.insert((change.ino_file.to_string(), ino_line), cpp_line);
        }

        self.to_ino = new_to_ino;
        self.to_cpp = new_to_cpp;
        self.version += 1;

        Ok(())
    }
}

/// Shifts a line index by `delta` if it lies at or after `pivot`.
fn shift(line: usize, pivot: usize, delta: i64) -> usize {
    if line < pivot {
        return line;
    }
    let shifted = i64::try_from(line).unwrap_or(i64::MAX) + delta;
    usize::try_from(shifted.max(0)).unwrap_or(0)
}

/// Parses a `#line N "FILE"` directive. Returns `(FILE, N)` with `N` as it
/// appeared in the source (one-indexed).
fn parse_line_directive(line: &str) -> Option<(String, usize)> {
    let rest = line.trim_start().strip_prefix("#line")?;
    let rest = rest.trim_start();
    let (num, rest) = rest.split_once(char::is_whitespace)?;
    let n: usize = num.parse().ok()?;
    let rest = rest.trim();
    let file = rest.strip_prefix('"')?.strip_suffix('"')?;
    Some((file.to_string(), n))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKETCH_JULY2A: &str = concat!(
        "#include <Arduino.h>\n",
        "#line 1 \"sketch_july2a.ino\"\n",
        "#line 1 \"sketch_july2a.ino\"\n",
        "\n",
        "#line 2 \"sketch_july2a.ino\"\n",
        "void setup();\n",
        "#line 7 \"sketch_july2a.ino\"\n",
        "void loop();\n",
        "#line 2 \"sketch_july2a.ino\"\n",
        "void setup() { }\n",
    );

    #[test]
    fn construction_marks_preamble_and_directives_preprocessed() {
        let mapper = SourceMapper::build(SKETCH_JULY2A);
        for line in [0, 1, 2, 4, 6, 8] {
            assert!(mapper.is_preprocessed(line), "line {line} should be preprocessed");
        }
        for line in [3, 5, 7, 9] {
            assert!(!mapper.is_preprocessed(line), "line {line} should be source");
        }
    }

    #[test]
    fn construction_binds_expected_ino_lines() {
        let mapper = SourceMapper::build(SKETCH_JULY2A);
        let ino_line_of = |cpp_line: usize| match mapper.cpp_to_ino_line(cpp_line) {
            Some(LineOrigin::Source { ino_line, .. }) => *ino_line,
            other => panic!("expected source line at {cpp_line}, got {other:?}"),
        };

        // #line directives carry one-indexed N; stored ino lines are N - 1.
        assert_eq!(ino_line_of(3), 0);
        assert_eq!(ino_line_of(5), 1);
        assert_eq!(ino_line_of(7), 6);
        assert_eq!(ino_line_of(9), 1);
    }

    #[test]
    fn round_trip_identity_holds_for_every_source_line() {
        let mapper = SourceMapper::build(SKETCH_JULY2A);
        for cpp_line in 0..mapper.line_count() {
            if mapper.is_preprocessed(cpp_line) {
                continue;
            }
            let LineOrigin::Source { ino_file, ino_line } =
                mapper.cpp_to_ino_line(cpp_line).expect("mapped line")
            else {
                unreachable!()
            };
            // to_cpp is last-write-wins per ino line, so re-deriving from
            // the file/line pair must land back on a line that itself maps
            // to the same file/line (not necessarily the original index,
            // since multiple cpp lines can share one ino line, as `setup`'s
            // forward declaration and its definition both do here).
            let back = mapper
                .ino_to_cpp_line(ino_file, *ino_line)
                .expect("reverse lookup");
            let LineOrigin::Source {
                ino_file: back_file,
                ino_line: back_line,
            } = mapper.cpp_to_ino_line(back).expect("mapped line")
            else {
                unreachable!()
            };
            assert_eq!(back_file, ino_file);
            assert_eq!(back_line, ino_line);
        }
    }

    #[test]
    fn to_ino_is_total_over_every_line() {
        let mapper = SourceMapper::build(SKETCH_JULY2A);
        for cpp_line in 0..mapper.line_count() {
            assert!(mapper.cpp_to_ino_line(cpp_line).is_some());
        }
    }

    #[test]
    fn apply_change_preserves_mappings_before_the_edit() {
        let mut mapper = SourceMapper::build(SKETCH_JULY2A);
        let before = mapper.cpp_to_ino_line(3).cloned();

        mapper
            .apply_change(&LineChange {
                ino_file: "sketch_july2a.ino",
                start_line: 6,
                end_line: 6,
                new_lines: vec!["// inserted".to_string()],
            })
            .expect("apply_change");

        assert_eq!(mapper.cpp_to_ino_line(3).cloned(), before);
    }

    #[test]
    fn apply_change_shifts_following_entries_by_the_line_delta() {
        let mut mapper = SourceMapper::build(SKETCH_JULY2A);
        let original_version = mapper.version();

        mapper
            .apply_change(&LineChange {
                ino_file: "sketch_july2a.ino",
                start_line: 6,
                end_line: 6,
                new_lines: vec!["foo".to_string(), "bar".to_string()],
            })
            .expect("apply_change");

        assert_eq!(mapper.version(), original_version + 1);

        // The two new lines now occupy ino lines 6 and 7 of the tab, and
        // whatever used to sit at ino line 6 (loop's declaration) has
        // shifted two lines further down in both spaces.
        assert_eq!(mapper.ino_to_cpp_line("sketch_july2a.ino", 6), Some(7));
        assert_eq!(mapper.ino_to_cpp_line("sketch_july2a.ino", 7), Some(8));
        assert_eq!(mapper.ino_to_cpp_line("sketch_july2a.ino", 8), Some(9));
    }

    #[test]
    fn out_of_range_line_is_reported_not_panicked() {
        let mapper = SourceMapper::build(SKETCH_JULY2A);
        assert!(mapper.cpp_to_ino_line(9_999).is_none());
        assert!(mapper.ino_to_cpp_line("sketch_july2a.ino", 9_999).is_none());
    }
}
