//! Byte-range partitioning.
//!
//! Every partition here is exact: slices are disjoint, contiguous, and sum
//! to the partitioned region. Rounding slack always lands in the last slice.

use crate::error::{HcollError, Result};

/// A contiguous byte range `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Slice {
    pub offset: usize,
    pub size: usize,
}

impl Slice {
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Sub-slice relative to this slice's start.
    pub fn sub(&self, offset: usize, size: usize) -> Slice {
        Slice::new(self.offset + offset, size)
    }

    /// Split into `parts` slices of equal size rounded down to `align`;
    /// the last slice takes the remainder.
    pub fn split(&self, parts: usize, align: usize) -> Vec<Slice> {
        if parts == 0 {
            return Vec::new();
        }
        let align = align.max(1);
        let base = (self.size / parts) / align * align;
        let mut out = Vec::with_capacity(parts);
        for i in 0..parts - 1 {
            out.push(self.sub(i * base, base));
        }
        let used = base * (parts - 1);
        out.push(self.sub(used, self.size - used));
        out
    }

    /// Split proportionally to `weights`, each share rounded to nearest and
    /// then down to `align`; the last slice absorbs any shortfall or excess.
    pub fn split_weighted(&self, weights: &[f64], align: usize) -> Result<Vec<Slice>> {
        if weights.is_empty() {
            return Ok(Vec::new());
        }
        let total: f64 = weights.iter().sum();
        if total.is_nan() || total <= 0.0 || weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(HcollError::param(
                "split_weighted",
                format!("weights {weights:?} must be non-negative with a positive sum"),
            ));
        }
        let align = align.max(1);
        let mut out = Vec::with_capacity(weights.len());
        let mut used = 0usize;
        for w in &weights[..weights.len() - 1] {
            let share = (self.size as f64 * w / total + 0.5) as usize;
            let share = (share / align * align).min(self.size - used);
            out.push(self.sub(used, share));
            used += share;
        }
        out.push(self.sub(used, self.size - used));
        Ok(out)
    }
}

/// True when `slices`, sorted by offset, tile `region` with no gap or overlap.
pub fn is_exact_cover(slices: &[Slice], region: Slice) -> bool {
    let mut sorted: Vec<Slice> = slices.to_vec();
    sorted.sort_by_key(|s| (s.offset, s.size));
    let mut cursor = region.offset;
    for s in sorted {
        if s.offset != cursor {
            return false;
        }
        cursor = s.end();
    }
    cursor == region.end()
}
