//! Text reconciler: diffs between two revisions of a cell's text, packaged
//! as context-anchored hunks that survive being applied to a drifted base.
//!
//! Diffs are computed line-first, then refined per character inside the
//! replaced line blocks. Positions and lengths count Unicode scalar values.
//!
//! Wire form (one hunk):
//! ```text
//! @@ -1,3 +1,3 @@      header: source/target start (1-based) and length
//!  x%3D                ' ' context, '-' removed, '+' inserted
//! -1
//! +2
//! ```
//! Span bodies are percent-encoded so every span stays on one line. Only the
//! canonical encoding parses, which keeps `serialize(deserialize(s)) == s`.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use similar::{Algorithm, ChangeTag, DiffOp, TextDiff};
use thiserror::Error;

/// Characters of unchanged text kept on each side of a hunk.
const CONTEXT: usize = 4;
/// Minimum similarity for a fuzzy placement to be accepted.
const MATCH_THRESHOLD: f32 = 0.5;
/// How far from the expected offset a fuzzy placement may land.
const SEARCH_RADIUS: usize = 256;
/// Hunks longer than this are never fuzzily placed.
const FUZZY_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

impl Op {
    fn marker(self) -> char {
        match self {
            Op::Equal => ' ',
            Op::Delete => '-',
            Op::Insert => '+',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    op: Op,
    text: String,
}

/// A contiguous edit plus its surrounding context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hunk {
    start1: usize,
    length1: usize,
    start2: usize,
    length2: usize,
    spans: Vec<Span>,
}

impl Hunk {
    fn source(&self) -> Vec<char> {
        self.spans
            .iter()
            .filter(|s| s.op != Op::Insert)
            .flat_map(|s| s.text.chars())
            .collect()
    }

    fn target(&self) -> Vec<char> {
        self.spans
            .iter()
            .filter(|s| s.op != Op::Delete)
            .flat_map(|s| s.text.chars())
            .collect()
    }

    fn push_front_context(&mut self, text: String) {
        let len = text.chars().count();
        if len == 0 {
            return;
        }
        self.spans.insert(0, Span { op: Op::Equal, text });
        self.start1 -= len;
        self.start2 -= len;
        self.length1 += len;
        self.length2 += len;
    }

    fn push_back_context(&mut self, text: String) {
        let len = text.chars().count();
        if len == 0 {
            return;
        }
        push_span(&mut self.spans, Op::Equal, &text);
        self.length1 += len;
        self.length2 += len;
    }
}

/// An ordered list of hunks turning one revision of a text into another.
///
/// Only meaningful against the revision it was computed from; applying it
/// elsewhere is best-effort (see [`apply`]).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    hunks: Vec<Hunk>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    pub fn hunk_count(&self) -> usize {
        self.hunks.len()
    }
}

/// How a single hunk landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkOutcome {
    /// Context matched exactly.
    Clean,
    /// Context had drifted; placed at the most similar nearby location.
    Fuzzy,
    /// No acceptable location; the hunk was dropped.
    Skipped,
}

/// Result of applying a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub text: String,
    pub outcomes: Vec<HunkOutcome>,
}

impl Applied {
    /// Per-hunk flag, `true` only where the context matched exactly.
    pub fn applied_cleanly(&self) -> Vec<bool> {
        self.outcomes
            .iter()
            .map(|o| *o == HunkOutcome::Clean)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| *o == HunkOutcome::Clean)
    }
}

/// Malformed patch text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("line {line}: malformed hunk header")]
    BadHeader { line: usize },
    #[error("line {line}: unknown span marker {marker:?}")]
    BadMarker { line: usize, marker: char },
    #[error("line {line}: span outside of a hunk")]
    OrphanSpan { line: usize },
    #[error("line {line}: not in canonical form")]
    NonCanonical { line: usize },
    #[error("line {line}: span body is not valid UTF-8")]
    BadEncoding { line: usize },
    #[error("hunk starting at line {line} disagrees with its header lengths")]
    LengthMismatch { line: usize },
    #[error("patch text must end with a newline")]
    MissingNewline,
}

// ───────────────────────────────────────────────────────────────────
// Diff
// ───────────────────────────────────────────────────────────────────

/// Compute the patch turning `base` into `current`.
///
/// Deterministic: identical inputs always yield identical patches.
pub fn diff(base: &str, current: &str) -> Patch {
    if base == current {
        return Patch::default();
    }
    let spans = diff_spans(base, current);
    Patch {
        hunks: make_hunks(base, &spans),
    }
}

fn push_span(spans: &mut Vec<Span>, op: Op, text: &str) {
    if text.is_empty() {
        return;
    }
    match spans.last_mut() {
        Some(last) if last.op == op => last.text.push_str(text),
        _ => spans.push(Span {
            op,
            text: text.to_string(),
        }),
    }
}

fn diff_spans(base: &str, current: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let lines = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_lines(base, current);
    let old = lines.old_slices();
    let new = lines.new_slices();

    for op in lines.ops() {
        match *op {
            DiffOp::Equal { old_index, len, .. } => {
                push_span(&mut spans, Op::Equal, &old[old_index..old_index + len].concat());
            }
            DiffOp::Delete { old_index, old_len, .. } => {
                push_span(&mut spans, Op::Delete, &old[old_index..old_index + old_len].concat());
            }
            DiffOp::Insert { new_index, new_len, .. } => {
                push_span(&mut spans, Op::Insert, &new[new_index..new_index + new_len].concat());
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                let before = old[old_index..old_index + old_len].concat();
                let after = new[new_index..new_index + new_len].concat();
                let chars = TextDiff::configure()
                    .algorithm(Algorithm::Myers)
                    .diff_chars(before.as_str(), after.as_str());
                for change in chars.iter_all_changes() {
                    let op = match change.tag() {
                        ChangeTag::Equal => Op::Equal,
                        ChangeTag::Delete => Op::Delete,
                        ChangeTag::Insert => Op::Insert,
                    };
                    push_span(&mut spans, op, change.value());
                }
            }
        }
    }
    spans
}

fn make_hunks(base: &str, spans: &[Span]) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut prepatch: Vec<char> = base.chars().collect();
    let mut postpatch = prepatch.clone();
    let mut hunk = Hunk::default();
    let mut count1 = 0usize;
    let mut count2 = 0usize;

    for (i, span) in spans.iter().enumerate() {
        let len = span.text.chars().count();
        if hunk.spans.is_empty() && span.op != Op::Equal {
            hunk.start1 = count1;
            hunk.start2 = count2;
        }

        match span.op {
            Op::Insert => {
                hunk.spans.push(span.clone());
                hunk.length2 += len;
                postpatch.splice(count2..count2, span.text.chars());
            }
            Op::Delete => {
                hunk.spans.push(span.clone());
                hunk.length1 += len;
                postpatch.drain(count2..count2 + len);
            }
            Op::Equal => {
                let last = i + 1 == spans.len();
                if len <= 2 * CONTEXT && !hunk.spans.is_empty() && !last {
                    hunk.spans.push(span.clone());
                    hunk.length1 += len;
                    hunk.length2 += len;
                } else if len >= 2 * CONTEXT && !hunk.spans.is_empty() {
                    add_context(&mut hunk, &prepatch);
                    hunks.push(std::mem::take(&mut hunk));
                    // Later hunks are expressed against the text with this one applied.
                    prepatch = postpatch.clone();
                    count1 = count2;
                }
            }
        }

        if span.op != Op::Insert {
            count1 += len;
        }
        if span.op != Op::Delete {
            count2 += len;
        }
    }

    if !hunk.spans.is_empty() {
        add_context(&mut hunk, &prepatch);
        hunks.push(hunk);
    }
    hunks
}

fn add_context(hunk: &mut Hunk, text: &[char]) {
    let start = hunk.start2.min(text.len());
    let end = (start + hunk.length1).min(text.len());
    let prefix: String = text[start.saturating_sub(CONTEXT)..start].iter().collect();
    let suffix: String = text[end..(end + CONTEXT).min(text.len())].iter().collect();
    hunk.push_front_context(prefix);
    hunk.push_back_context(suffix);
}

// ───────────────────────────────────────────────────────────────────
// Apply
// ───────────────────────────────────────────────────────────────────

/// Apply `patch` to `base`.
///
/// Never fails: hunks whose context cannot be found exactly are placed at
/// the most similar nearby location, or dropped, and reported as such.
pub fn apply(base: &str, patch: &Patch) -> Applied {
    let mut text: Vec<char> = base.chars().collect();
    let mut outcomes = Vec::with_capacity(patch.hunks.len());
    let mut drift: isize = 0;

    for hunk in &patch.hunks {
        let expected = (hunk.start2 as isize + drift).clamp(0, text.len() as isize) as usize;
        let source = hunk.source();

        if let Some(loc) = find_exact(&text, &source, expected) {
            text.splice(loc..loc + source.len(), hunk.target());
            drift = loc as isize - hunk.start2 as isize;
            outcomes.push(HunkOutcome::Clean);
            continue;
        }

        match find_fuzzy(&text, &source, expected) {
            Some((loc, window_len)) => {
                let window: String = text[loc..loc + window_len].iter().collect();
                let source: String = source.iter().collect();
                splice_fuzzy(&mut text, loc, hunk, &source, &window);
                drift = loc as isize - hunk.start2 as isize;
                outcomes.push(HunkOutcome::Fuzzy);
            }
            None => {
                drift -= hunk.length2 as isize - hunk.length1 as isize;
                outcomes.push(HunkOutcome::Skipped);
            }
        }
    }

    Applied {
        text: text.into_iter().collect(),
        outcomes,
    }
}

/// Exact occurrence of `pattern` in `text` closest to `expected`.
fn find_exact(text: &[char], pattern: &[char], expected: usize) -> Option<usize> {
    if pattern.is_empty() {
        return Some(expected.min(text.len()));
    }
    if text.get(expected..expected + pattern.len()) == Some(pattern) {
        return Some(expected);
    }
    text.windows(pattern.len())
        .enumerate()
        .filter(|(_, w)| *w == pattern)
        .map(|(i, _)| i)
        .min_by_key(|i| i.abs_diff(expected))
}

/// Most similar window near `expected`, as `(start, len)`.
fn find_fuzzy(text: &[char], pattern: &[char], expected: usize) -> Option<(usize, usize)> {
    if pattern.is_empty() || pattern.len() > FUZZY_LIMIT || text.is_empty() {
        return None;
    }
    let width = pattern.len();
    let pattern: String = pattern.iter().collect();
    let last_start = text.len().saturating_sub(width);
    let lo = expected.saturating_sub(SEARCH_RADIUS).min(last_start);
    let hi = (expected + SEARCH_RADIUS).min(last_start);

    let mut best: Option<(f32, usize, usize)> = None;
    for start in lo..=hi {
        let len = width.min(text.len() - start);
        let window: String = text[start..start + len].iter().collect();
        let score = TextDiff::from_chars(pattern.as_str(), window.as_str()).ratio();
        let better = match best {
            None => true,
            Some((s, b, _)) => {
                score > s || (score == s && start.abs_diff(expected) < b.abs_diff(expected))
            }
        };
        if better {
            best = Some((score, start, len));
        }
    }

    best.filter(|(score, _, _)| *score >= MATCH_THRESHOLD)
        .map(|(_, start, len)| (start, len))
}

/// Replay the hunk's edits inside a window that only resembles its source.
fn splice_fuzzy(text: &mut Vec<char>, loc: usize, hunk: &Hunk, source: &str, window: &str) {
    let mapping = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_chars(source, window);
    let runs: Vec<(ChangeTag, usize)> = mapping
        .iter_all_changes()
        .map(|c| (c.tag(), c.value().chars().count()))
        .collect();

    let mut index1 = 0usize;
    for span in &hunk.spans {
        let len = span.text.chars().count();
        match span.op {
            Op::Equal => {}
            Op::Insert => {
                let at = (loc + translate(&runs, index1)).min(text.len());
                text.splice(at..at, span.text.chars());
            }
            Op::Delete => {
                let from = (loc + translate(&runs, index1)).min(text.len());
                let to = (loc + translate(&runs, index1 + len)).clamp(from, text.len());
                text.drain(from..to);
            }
        }
        if span.op != Op::Delete {
            index1 += len;
        }
    }
}

/// Map an offset in the hunk source to the matching offset in the window.
fn translate(runs: &[(ChangeTag, usize)], loc: usize) -> usize {
    let (mut chars1, mut chars2) = (0usize, 0usize);
    let (mut last1, mut last2) = (0usize, 0usize);
    for (tag, len) in runs {
        if *tag != ChangeTag::Insert {
            chars1 += len;
        }
        if *tag != ChangeTag::Delete {
            chars2 += len;
        }
        if chars1 > loc {
            if *tag == ChangeTag::Delete {
                return last2;
            }
            break;
        }
        last1 = chars1;
        last2 = chars2;
    }
    last2 + loc.saturating_sub(last1)
}

// ───────────────────────────────────────────────────────────────────
// Text form
// ───────────────────────────────────────────────────────────────────

/// Render a patch in its wire form.
pub fn serialize(patch: &Patch) -> String {
    patch.to_string()
}

/// Parse the wire form produced by [`serialize`].
pub fn deserialize(text: &str) -> Result<Patch, PatchError> {
    text.parse()
}

fn coords(start: usize, len: usize) -> String {
    match len {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, len),
    }
}

fn parse_coords(raw: &str) -> Option<(usize, usize)> {
    match raw.split_once(',') {
        Some((start, len)) => {
            let start: usize = start.parse().ok()?;
            let len: usize = len.parse().ok()?;
            if len == 0 {
                Some((start, 0))
            } else {
                Some((start.checked_sub(1)?, len))
            }
        }
        None => Some((raw.parse::<usize>().ok()?.checked_sub(1)?, 1)),
    }
}

fn header(hunk: &Hunk) -> String {
    format!(
        "@@ -{} +{} @@",
        coords(hunk.start1, hunk.length1),
        coords(hunk.start2, hunk.length2)
    )
}

fn parse_header(line: &str, number: usize) -> Result<Hunk, PatchError> {
    let bad = || PatchError::BadHeader { line: number };
    let inner = line
        .strip_prefix("@@ -")
        .and_then(|l| l.strip_suffix(" @@"))
        .ok_or_else(bad)?;
    let (left, right) = inner.split_once(" +").ok_or_else(bad)?;
    let (start1, length1) = parse_coords(left).ok_or_else(bad)?;
    let (start2, length2) = parse_coords(right).ok_or_else(bad)?;
    let hunk = Hunk {
        start1,
        length1,
        start2,
        length2,
        spans: Vec::new(),
    };
    if header(&hunk) != line {
        return Err(PatchError::NonCanonical { line: number });
    }
    Ok(hunk)
}

fn check_lengths(hunk: &Hunk, line: usize) -> Result<(), PatchError> {
    if hunk.source().len() != hunk.length1 || hunk.target().len() != hunk.length2 {
        return Err(PatchError::LengthMismatch { line });
    }
    Ok(())
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hunk in &self.hunks {
            writeln!(f, "{}", header(hunk))?;
            for span in &hunk.spans {
                writeln!(f, "{}{}", span.op.marker(), urlencoding::encode(&span.text))?;
            }
        }
        Ok(())
    }
}

impl FromStr for Patch {
    type Err = PatchError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Ok(Patch::default());
        }
        let body = text.strip_suffix('\n').ok_or(PatchError::MissingNewline)?;

        let mut hunks: Vec<Hunk> = Vec::new();
        let mut hunk_line = 0;
        for (i, line) in body.split('\n').enumerate() {
            let number = i + 1;
            if line.starts_with("@@") {
                if let Some(prev) = hunks.last() {
                    check_lengths(prev, hunk_line)?;
                }
                hunks.push(parse_header(line, number)?);
                hunk_line = number;
                continue;
            }

            let mut chars = line.chars();
            let op = match chars.next() {
                Some(' ') => Op::Equal,
                Some('-') => Op::Delete,
                Some('+') => Op::Insert,
                Some(marker) => return Err(PatchError::BadMarker { line: number, marker }),
                None => return Err(PatchError::BadMarker { line: number, marker: '\n' }),
            };
            let raw = chars.as_str();
            let decoded = urlencoding::decode(raw)
                .map_err(|_| PatchError::BadEncoding { line: number })?;
            if urlencoding::encode(&decoded) != raw {
                return Err(PatchError::NonCanonical { line: number });
            }
            let hunk = hunks
                .last_mut()
                .ok_or(PatchError::OrphanSpan { line: number })?;
            // Adjacent same-kind spans would not survive a round trip.
            if hunk.spans.last().is_some_and(|s| s.op == op) {
                return Err(PatchError::NonCanonical { line: number });
            }
            hunk.spans.push(Span {
                op,
                text: decoded.into_owned(),
            });
        }
        if let Some(last) = hunks.last() {
            check_lengths(last, hunk_line)?;
        }
        Ok(Patch { hunks })
    }
}

impl Serialize for Patch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Patch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
