//! Frame-range algebra.
//!
//! Range strings follow `range := expr ("," expr)*` with
//! `expr := INT | INT "-" INT ("x" INT | ":" INT)?`:
//!
//! - `a-b` is inclusive on both ends and counts down when `a > b`.
//! - `a-bxN` walks from `a` towards `b` in steps of `|N|`; a negative `N`
//!   reverses the resulting sequence.
//! - `a-b:N` picks `N` evenly spaced frames between `a` and `b`.
//!
//! A [`FrameSet`] keeps frames in the order the expression produced them.
//! [`FrameSet::normalized`] gives the sorted, de-duplicated form.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{FarmError, Result};

/// Range used by layers when neither the layer nor the outline sets one.
pub const DEFAULT_FRAME_RANGE: &str = "1000-1000";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSet {
    frames: Vec<i64>,
}

fn syntax_error(range: &str, reason: impl Into<String>) -> FarmError {
    FarmError::RangeSyntax {
        range: range.to_string(),
        reason: reason.into(),
    }
}

/// Split a leading (optionally negative) integer off `s`.
fn take_int<'a>(s: &'a str, whole: &str) -> Result<(i64, &'a str)> {
    let bytes = s.as_bytes();
    let mut end = 0;
    if end < bytes.len() && bytes[end] == b'-' {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return Err(syntax_error(whole, format!("expected an integer at '{}'", s)));
    }
    let value = s[..end]
        .parse::<i64>()
        .map_err(|e| syntax_error(whole, e.to_string()))?;
    Ok((value, &s[end..]))
}

/// Most frames a single range string may expand to.
pub const MAX_FRAMES: usize = 1_000_000;

fn too_many(whole: &str) -> FarmError {
    syntax_error(whole, format!("range expands to more than {} frames", MAX_FRAMES))
}

fn stepped(start: i64, end: i64, step: i64, whole: &str) -> Result<Vec<i64>> {
    let magnitude = step.unsigned_abs();
    let span = (i128::from(end) - i128::from(start)).unsigned_abs();
    let count = span / u128::from(magnitude) + 1;
    if count > MAX_FRAMES as u128 {
        return Err(too_many(whole));
    }

    let magnitude = i128::from(magnitude);
    let direction = if start <= end { 1 } else { -1 };
    let mut frames = Vec::with_capacity(count as usize);
    let mut f = i128::from(start);
    for _ in 0..count {
        // Every step stays between start and end, so it fits in i64
        frames.push(i64::try_from(f).map_err(|_| too_many(whole))?);
        f += direction * magnitude;
    }
    if step < 0 {
        frames.reverse();
    }
    Ok(frames)
}

fn spaced(start: i64, end: i64, count: i64, whole: &str) -> Result<Vec<i64>> {
    if count as u64 > MAX_FRAMES as u64 {
        return Err(too_many(whole));
    }
    if count == 1 {
        return Ok(vec![start]);
    }
    let span = (i128::from(end) - i128::from(start)) as f64;
    let mut seen = HashSet::new();
    let mut frames = Vec::new();
    for i in 0..count {
        let offset = (span * i as f64 / (count - 1) as f64).round() as i128;
        let frame = i64::try_from(i128::from(start) + offset)
            .map_err(|_| syntax_error(whole, "frame out of range"))?;
        if seen.insert(frame) {
            frames.push(frame);
        }
    }
    Ok(frames)
}

fn parse_expr(expr: &str, whole: &str) -> Result<Vec<i64>> {
    let (start, rest) = take_int(expr, whole)?;
    if rest.is_empty() {
        return Ok(vec![start]);
    }
    let rest = rest
        .strip_prefix('-')
        .ok_or_else(|| syntax_error(whole, format!("unexpected '{}'", rest)))?;
    let (end, rest) = take_int(rest, whole)?;
    if rest.is_empty() {
        return stepped(start, end, 1, whole);
    }

    let mut chars = rest.chars();
    let op = chars.next();
    let (value, tail) = take_int(chars.as_str(), whole)?;
    if !tail.is_empty() {
        return Err(syntax_error(whole, format!("trailing characters '{}'", tail)));
    }
    match op {
        Some('x') => {
            if value == 0 {
                return Err(syntax_error(whole, "step must not be zero"));
            }
            stepped(start, end, value, whole)
        }
        Some(':') => {
            if value <= 0 {
                return Err(syntax_error(whole, "frame count must be positive"));
            }
            spaced(start, end, value, whole)
        }
        _ => Err(syntax_error(whole, format!("unknown operator in '{}'", rest))),
    }
}

impl FrameSet {
    pub fn new(frames: Vec<i64>) -> Self {
        Self { frames }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a range string. Whitespace around each expression is ignored.
    pub fn parse(range: &str) -> Result<Self> {
        if range.trim().is_empty() {
            return Err(syntax_error(range, "empty range"));
        }
        let mut frames = Vec::new();
        for expr in range.split(',') {
            let expr = expr.trim();
            if expr.is_empty() {
                return Err(syntax_error(range, "empty expression"));
            }
            frames.extend(parse_expr(expr, range)?);
            if frames.len() > MAX_FRAMES {
                return Err(too_many(range));
            }
        }
        Ok(Self { frames })
    }

    pub fn frames(&self) -> &[i64] {
        &self.frames
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.frames.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn first(&self) -> Option<i64> {
        self.frames.first().copied()
    }

    pub fn last(&self) -> Option<i64> {
        self.frames.last().copied()
    }

    pub fn contains(&self, frame: i64) -> bool {
        self.frames.contains(&frame)
    }

    /// Sorted with duplicates removed.
    pub fn normalized(&self) -> Self {
        let mut frames = self.frames.clone();
        frames.sort_unstable();
        frames.dedup();
        Self { frames }
    }

    /// Duplicates removed, first occurrence wins, order kept.
    pub fn deduplicated(&self) -> Self {
        let mut seen = HashSet::new();
        Self {
            frames: self.frames.iter().copied().filter(|f| seen.insert(*f)).collect(),
        }
    }

    /// Every frame of `self` followed by the frames of `other` not yet present.
    pub fn union(&self, other: &FrameSet) -> Self {
        let mut frames = self.deduplicated().frames;
        let mut seen: HashSet<i64> = frames.iter().copied().collect();
        frames.extend(other.frames.iter().copied().filter(|f| seen.insert(*f)));
        Self { frames }
    }

    /// Frames of `self` also present in `other`, in `self`'s order.
    ///
    /// An empty side means "unspecified" and yields the other side unchanged.
    pub fn intersect(&self, other: &FrameSet) -> Self {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let keep: HashSet<i64> = other.frames.iter().copied().collect();
        let mut seen = HashSet::new();
        Self {
            frames: self
                .frames
                .iter()
                .copied()
                .filter(|f| keep.contains(f) && seen.insert(*f))
                .collect(),
        }
    }

    /// Split into consecutive windows of at most `size` frames.
    pub fn chunk(&self, size: usize) -> Vec<FrameSet> {
        let size = size.max(1);
        self.deduplicated()
            .frames
            .chunks(size)
            .map(|c| FrameSet::new(c.to_vec()))
            .collect()
    }

    /// The window of up to `size` frames led by `leader`.
    pub fn local_frame_set(&self, leader: i64, size: usize) -> Result<FrameSet> {
        let frames = self.deduplicated().frames;
        let idx = frames
            .iter()
            .position(|f| *f == leader)
            .ok_or_else(|| FarmError::Layer(format!("Frame {} is outside of the frame range", leader)))?;
        let end = (idx + size.max(1)).min(frames.len());
        Ok(FrameSet::new(frames[idx..end].to_vec()))
    }
}

impl FromStr for FrameSet {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        FrameSet::parse(s)
    }
}

impl From<Vec<i64>> for FrameSet {
    fn from(frames: Vec<i64>) -> Self {
        FrameSet::new(frames)
    }
}

impl fmt::Display for FrameSet {
    /// Compress runs of equal stride, keeping the set's own order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frames = &self.frames;
        let mut parts = Vec::new();
        let mut i = 0;
        while i < frames.len() {
            let start = frames[i];
            let mut j = i;
            let stride = frames
                .get(i + 1)
                .and_then(|next| next.checked_sub(start))
                .filter(|stride| *stride != 0);
            if let Some(stride) = stride {
                while j + 1 < frames.len() && frames[j + 1].checked_sub(frames[j]) == Some(stride) {
                    j += 1;
                }
                let run = j - i + 1;
                let magnitude = stride.unsigned_abs();
                if magnitude == 1 || run >= 3 {
                    let end = frames[j];
                    if magnitude == 1 {
                        parts.push(format!("{}-{}", start, end));
                    } else {
                        parts.push(format!("{}-{}x{}", start, end, magnitude));
                    }
                    i = j + 1;
                    continue;
                }
            }
            parts.push(start.to_string());
            i += 1;
        }
        f.write_str(&parts.join(","))
    }
}
