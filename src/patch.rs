//! Structured unified diffs.
//!
//! Content history stores unified-diff text, but every operation on a diff
//! goes through the parsed [`Patch`] value: building it from two texts,
//! reversing it, and applying it. Reversal swaps labels, ranges, and
//! added/removed lines on the value, so it never has to rewrite raw text.
//!
//! Lines keep their own terminator. A line without a trailing `\n` (the last
//! line of a text that does not end in a newline) is rendered with the usual
//! `\ No newline at end of file` marker.

use std::fmt::Write as _;

use similar::{ChangeTag, TextDiff};
use thiserror::Error;

/// Lines of unchanged context around each hunk.
pub const CONTEXT_LINES: usize = 3;

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed patch at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("hunk {hunk} does not fit the text (starts at line {start}, text has {len} lines)")]
    OutOfRange { hunk: usize, start: usize, len: usize },

    #[error("hunk {hunk} expected {expected:?} at line {line}, found {found:?}")]
    Mismatch {
        hunk: usize,
        line: usize,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(String),
    Remove(String),
    Add(String),
}

impl PatchLine {
    fn text(&self) -> &str {
        match self {
            PatchLine::Context(s) | PatchLine::Remove(s) | PatchLine::Add(s) => s,
        }
    }

    fn prefix(&self) -> char {
        match self {
            PatchLine::Context(_) => ' ',
            PatchLine::Remove(_) => '-',
            PatchLine::Add(_) => '+',
        }
    }

    fn reversed(&self) -> PatchLine {
        match self {
            PatchLine::Context(s) => PatchLine::Context(s.clone()),
            PatchLine::Remove(s) => PatchLine::Add(s.clone()),
            PatchLine::Add(s) => PatchLine::Remove(s.clone()),
        }
    }
}

/// One `@@ -old_start,old_len +new_start,new_len @@` section.
///
/// Starts are 1-based. A zero-length side uses the number of the line
/// before the change, so `-0,0` means "before the first line".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<PatchLine>,
}

impl Hunk {
    fn reversed(&self) -> Hunk {
        Hunk {
            old_start: self.new_start,
            old_len: self.new_len,
            new_start: self.old_start,
            new_len: self.old_len,
            lines: self.lines.iter().map(PatchLine::reversed).collect(),
        }
    }

    fn counts(&self) -> (usize, usize) {
        self.lines.iter().fold((0, 0), |(old, new), line| match line {
            PatchLine::Context(_) => (old + 1, new + 1),
            PatchLine::Remove(_) => (old + 1, new),
            PatchLine::Add(_) => (old, new + 1),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub old_label: String,
    pub new_label: String,
    pub hunks: Vec<Hunk>,
}

fn range_start(start: usize, len: usize) -> usize {
    if len == 0 {
        start
    } else {
        start + 1
    }
}

impl Patch {
    /// Line diff from `old` to `new` with [`CONTEXT_LINES`] of context.
    ///
    /// Lines split on `\n` only, the same way [`Patch::apply`] splits them;
    /// a lone `\r` stays inside its line.
    pub fn between(old: &str, new: &str) -> Patch {
        let old_lines: Vec<&str> = old.split_inclusive('\n').collect();
        let new_lines: Vec<&str> = new.split_inclusive('\n').collect();
        let diff = TextDiff::from_slices(&old_lines, &new_lines);
        let mut hunks = Vec::new();

        for group in diff.grouped_ops(CONTEXT_LINES) {
            let (first, last) = match (group.first(), group.last()) {
                (Some(first), Some(last)) => (first, last),
                _ => continue,
            };
            let old_range = first.old_range().start..last.old_range().end;
            let new_range = first.new_range().start..last.new_range().end;

            let mut lines = Vec::new();
            for op in &group {
                for change in diff.iter_changes(op) {
                    let text = change.value().to_string();
                    lines.push(match change.tag() {
                        ChangeTag::Equal => PatchLine::Context(text),
                        ChangeTag::Delete => PatchLine::Remove(text),
                        ChangeTag::Insert => PatchLine::Add(text),
                    });
                }
            }

            hunks.push(Hunk {
                old_start: range_start(old_range.start, old_range.len()),
                old_len: old_range.len(),
                new_start: range_start(new_range.start, new_range.len()),
                new_len: new_range.len(),
                lines,
            });
        }

        Patch {
            old_label: "previous".to_string(),
            new_label: "current".to_string(),
            hunks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// The patch that undoes this one.
    pub fn reversed(&self) -> Patch {
        Patch {
            old_label: self.new_label.clone(),
            new_label: self.old_label.clone(),
            hunks: self.hunks.iter().map(Hunk::reversed).collect(),
        }
    }

    /// Unified-diff text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "--- {}", self.old_label);
        let _ = writeln!(out, "+++ {}", self.new_label);
        for hunk in &self.hunks {
            let _ = writeln!(
                out,
                "@@ -{},{} +{},{} @@",
                hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len
            );
            for line in &hunk.lines {
                let text = line.text();
                out.push(line.prefix());
                match text.strip_suffix('\n') {
                    Some(body) => {
                        out.push_str(body);
                        out.push('\n');
                    }
                    None => {
                        out.push_str(text);
                        out.push('\n');
                        out.push_str(NO_NEWLINE_MARKER);
                        out.push('\n');
                    }
                }
            }
        }
        out
    }

    /// Parse unified-diff text produced by [`Patch::render`].
    pub fn parse(text: &str) -> Result<Patch, PatchError> {
        let mut raw_lines = text
            .split_inclusive('\n')
            .map(|l| l.strip_suffix('\n').unwrap_or(l))
            .enumerate()
            .map(|(i, l)| (i + 1, l));

        let old_label = match raw_lines.next() {
            Some((_, l)) if l.starts_with("--- ") => l[4..].to_string(),
            other => return Err(malformed(other.map_or(1, |(n, _)| n), "expected '--- ' header")),
        };
        let new_label = match raw_lines.next() {
            Some((_, l)) if l.starts_with("+++ ") => l[4..].to_string(),
            other => return Err(malformed(other.map_or(2, |(n, _)| n), "expected '+++ ' header")),
        };

        let mut hunks: Vec<Hunk> = Vec::new();
        for (number, line) in raw_lines {
            if line.starts_with("@@") {
                let (old_start, old_len, new_start, new_len) = parse_hunk_header(number, line)?;
                hunks.push(Hunk {
                    old_start,
                    old_len,
                    new_start,
                    new_len,
                    lines: Vec::new(),
                });
                continue;
            }

            let hunk = hunks
                .last_mut()
                .ok_or_else(|| malformed(number, "content before first hunk header"))?;

            if line.starts_with('\\') {
                match hunk.lines.last_mut() {
                    Some(PatchLine::Context(s) | PatchLine::Remove(s) | PatchLine::Add(s))
                        if s.ends_with('\n') =>
                    {
                        s.pop();
                    }
                    _ => return Err(malformed(number, "misplaced no-newline marker")),
                }
                continue;
            }

            let parsed = match line.chars().next() {
                Some(' ') => PatchLine::Context(format!("{}\n", &line[1..])),
                Some('-') => PatchLine::Remove(format!("{}\n", &line[1..])),
                Some('+') => PatchLine::Add(format!("{}\n", &line[1..])),
                None => PatchLine::Context("\n".to_string()),
                Some(c) => return Err(malformed(number, format!("unexpected line prefix {:?}", c))),
            };
            hunk.lines.push(parsed);
        }

        for (i, hunk) in hunks.iter().enumerate() {
            if hunk.counts() != (hunk.old_len, hunk.new_len) {
                return Err(malformed(
                    0,
                    format!("hunk {} line counts do not match its header", i + 1),
                ));
            }
        }

        Ok(Patch {
            old_label,
            new_label,
            hunks,
        })
    }

    /// Apply to `text`, which must be exactly the "old" side of every hunk.
    pub fn apply(&self, text: &str) -> Result<String, PatchError> {
        let source: Vec<&str> = text.split_inclusive('\n').collect();
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0usize;

        for (index, hunk) in self.hunks.iter().enumerate() {
            let number = index + 1;
            let start = if hunk.old_len == 0 {
                hunk.old_start
            } else {
                hunk.old_start.saturating_sub(1)
            };
            if start < cursor || start > source.len() {
                return Err(PatchError::OutOfRange {
                    hunk: number,
                    start: hunk.old_start,
                    len: source.len(),
                });
            }

            for line in &source[cursor..start] {
                out.push_str(line);
            }
            cursor = start;

            for line in &hunk.lines {
                match line {
                    PatchLine::Add(s) => out.push_str(s),
                    PatchLine::Context(expected) | PatchLine::Remove(expected) => {
                        let found = source.get(cursor).copied().unwrap_or("");
                        if found != expected.as_str() {
                            return Err(PatchError::Mismatch {
                                hunk: number,
                                line: cursor + 1,
                                expected: expected.clone(),
                                found: found.to_string(),
                            });
                        }
                        if matches!(line, PatchLine::Context(_)) {
                            out.push_str(found);
                        }
                        cursor += 1;
                    }
                }
            }
        }

        for line in &source[cursor..] {
            out.push_str(line);
        }
        Ok(out)
    }
}

fn malformed(line: usize, reason: impl Into<String>) -> PatchError {
    PatchError::Malformed {
        line,
        reason: reason.into(),
    }
}

fn parse_hunk_header(number: usize, line: &str) -> Result<(usize, usize, usize, usize), PatchError> {
    let inner = line
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(|| malformed(number, "bad hunk header"))?;

    let mut parts = inner.split_whitespace();
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(|| malformed(number, "missing old range"))?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(|| malformed(number, "missing new range"))?;

    let (old_start, old_len) = parse_range(number, old)?;
    let (new_start, new_len) = parse_range(number, new)?;
    Ok((old_start, old_len, new_start, new_len))
}

fn parse_range(number: usize, range: &str) -> Result<(usize, usize), PatchError> {
    let parse = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| malformed(number, format!("bad range '{}'", range)))
    };
    match range.split_once(',') {
        Some((start, len)) => Ok((parse(start)?, parse(len)?)),
        None => Ok((parse(range)?, 1)),
    }
}
