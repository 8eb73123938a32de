//! Similarity matching between model responses and stored snippets.
//!
//! [`score`] is a Ratcliff/Obershelp ratio over Unicode scalar values:
//! find the longest common block, recurse on both sides of it, and report
//! `2 × matched / (len(a) + len(b))`. There is no junk heuristic, so long
//! responses with many repeated characters are compared in full.
//!
//! The longest-match search is order-sensitive when several blocks tie, so
//! the arguments are put in a canonical order first and the ratio is exactly
//! symmetric.
//!
//! [`attach_supplemental`] only needs to know whether a score clears the
//! threshold. [`score_above`] checks two cheap upper bounds first (length,
//! then character multiset) and runs the full block search only for pairs
//! that could still pass. Callers on an async runtime should run it on the
//! blocking pool.

use super::encode::encode_image_file;
use super::mapping::SupplementalMapping;
use crate::model::ExchangeRecord;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Similarity in `[0, 1]`. Two empty strings are identical.
pub fn score(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let (a, b) = canonical_chars(a, b);
    ratio(matched_chars(&a, &b), a.len() + b.len())
}

/// `Some(score(a, b))` when it is strictly greater than `threshold`.
///
/// Pairs whose length or character counts already rule them out are
/// rejected without the block search; the result is the same as comparing
/// [`score`] directly.
pub fn score_above(a: &str, b: &str, threshold: f64) -> Option<f64> {
    if a == b {
        return (1.0 > threshold).then_some(1.0);
    }
    let (a, b) = canonical_chars(a, b);
    let total = a.len() + b.len();
    if ratio(a.len().min(b.len()), total) <= threshold {
        return None;
    }
    if ratio(common_chars(&a, &b), total) <= threshold {
        return None;
    }
    let similarity = ratio(matched_chars(&a, &b), total);
    (similarity > threshold).then_some(similarity)
}

fn canonical_chars(a: &str, b: &str) -> (Vec<char>, Vec<char>) {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    (first.chars().collect(), second.chars().collect())
}

fn ratio(matched: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (2 * matched) as f64 / total as f64
}

/// Size of the multiset intersection of the two character sequences.
fn common_chars(a: &[char], b: &[char]) -> usize {
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in b {
        *counts.entry(*c).or_default() += 1;
    }
    let mut common = 0;
    for c in a {
        if let Some(n) = counts.get_mut(c) {
            if *n > 0 {
                *n -= 1;
                common += 1;
            }
        }
    }
    common
}

/// Sum of the sizes of all matching blocks.
fn matched_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, c) in b.iter().enumerate() {
        b2j.entry(*c).or_default().push(j);
    }

    let mut runs = RunBuffers::new(b.len());
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, k) = runs.longest_match(a, &b2j, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            pending.push((i + k, ahi, j + k, bhi));
        }
    }
    matched
}

/// Run lengths of the previous and current row, indexed by position in `b`.
/// Only the touched slots are reset, so a search costs what it visits.
struct RunBuffers {
    prev: Vec<usize>,
    row: Vec<usize>,
    prev_touched: Vec<usize>,
    row_touched: Vec<usize>,
}

impl RunBuffers {
    fn new(len: usize) -> Self {
        Self {
            prev: vec![0; len],
            row: vec![0; len],
            prev_touched: Vec::new(),
            row_touched: Vec::new(),
        }
    }

    fn clear_prev(&mut self) {
        for j in self.prev_touched.drain(..) {
            self.prev[j] = 0;
        }
    }

    /// Longest block `a[i..i+k] == b[j..j+k]` inside the given window;
    /// earliest `i`, then earliest `j`, wins ties.
    fn longest_match(
        &mut self,
        a: &[char],
        b2j: &HashMap<char, Vec<usize>>,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> (usize, usize, usize) {
        let (mut best_i, mut best_j, mut best_k) = (alo, blo, 0);
        self.clear_prev();
        for (i, c) in a.iter().enumerate().take(ahi).skip(alo) {
            if let Some(positions) = b2j.get(c) {
                let first = positions.partition_point(|&j| j < blo);
                for &j in positions[first..].iter().take_while(|&&j| j < bhi) {
                    let k = if j > blo { self.prev[j - 1] } else { 0 } + 1;
                    self.row[j] = k;
                    self.row_touched.push(j);
                    if k > best_k {
                        best_i = i + 1 - k;
                        best_j = j + 1 - k;
                        best_k = k;
                    }
                }
            }
            self.clear_prev();
            std::mem::swap(&mut self.prev, &mut self.row);
            std::mem::swap(&mut self.prev_touched, &mut self.row_touched);
        }
        self.clear_prev();
        (best_i, best_j, best_k)
    }
}

/// A mapped image file that could not be attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub detail: String,
}

/// Copy of `record` with the images of every snippet scoring above
/// `threshold` appended after its embedded images, in snippet order.
///
/// Image files that cannot be read are skipped and returned alongside.
pub fn attach_supplemental(
    record: &ExchangeRecord,
    mapping: &SupplementalMapping,
    threshold: f64,
) -> (ExchangeRecord, Vec<SkippedImage>) {
    let mut out = record.clone();
    let mut skipped = Vec::new();
    if mapping.is_empty() || record.model_text.is_empty() {
        return (out, skipped);
    }
    for entry in mapping.entries() {
        let Some(similarity) = score_above(&record.model_text, &entry.snippet, threshold) else {
            continue;
        };
        debug!(
            "Snippet matched (score {:.3}), attaching {} image(s)",
            similarity,
            entry.images.len()
        );
        for mapped in &entry.images {
            match encode_image_file(&mapped.path) {
                Ok(image) => out.model_images.push(match &mapped.description {
                    Some(desc) => image.with_description(desc.clone()),
                    None => image,
                }),
                Err(e) => {
                    warn!(
                        "Skipping supplemental image {}: {}",
                        mapped.path.display(),
                        e
                    );
                    skipped.push(SkippedImage {
                        path: mapped.path.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
    (out, skipped)
}
