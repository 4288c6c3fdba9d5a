use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use crate::{SlabError, SlabResult};

/// One axis of an N-D index key: a single index or a strided half-open range.
///
/// Integer selectors mark the axis for squeezing, like indexing an array with
/// a scalar. Bounds may be negative, in which case the axis length is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisKey {
    /// Select a single position along the axis and drop the axis.
    Index(i64),
    /// Select a strided half-open range and keep the axis.
    Slice(SliceSpec),
}

impl AxisKey {
    /// The full, unit-stride range over an axis.
    #[must_use]
    pub fn full() -> Self {
        AxisKey::Slice(SliceSpec::default())
    }

    /// A `[start, stop)` range with unit stride.
    #[must_use]
    pub fn span(start: i64, stop: i64) -> Self {
        AxisKey::Slice(SliceSpec {
            start: Some(start),
            stop: Some(stop),
            step: None,
        })
    }

    /// Replace the step of a range selector. No-op on integer selectors.
    #[must_use]
    pub fn step(self, step: i64) -> Self {
        match self {
            AxisKey::Slice(spec) => AxisKey::Slice(SliceSpec {
                step: Some(step),
                ..spec
            }),
            key @ AxisKey::Index(_) => key,
        }
    }
}

impl From<i64> for AxisKey {
    fn from(idx: i64) -> Self {
        AxisKey::Index(idx)
    }
}

impl From<Range<i64>> for AxisKey {
    fn from(r: Range<i64>) -> Self {
        AxisKey::span(r.start, r.end)
    }
}

impl From<RangeFrom<i64>> for AxisKey {
    fn from(r: RangeFrom<i64>) -> Self {
        AxisKey::Slice(SliceSpec {
            start: Some(r.start),
            stop: None,
            step: None,
        })
    }
}

impl From<RangeTo<i64>> for AxisKey {
    fn from(r: RangeTo<i64>) -> Self {
        AxisKey::Slice(SliceSpec {
            start: None,
            stop: Some(r.end),
            step: None,
        })
    }
}

impl From<RangeFull> for AxisKey {
    fn from(_: RangeFull) -> Self {
        AxisKey::full()
    }
}

/// An under-specified strided range; missing fields take axis-dependent
/// defaults when the key is resolved against a concrete axis length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceSpec {
    /// First selected position; defaults to the start of the traversal.
    pub start: Option<i64>,
    /// Exclusive upper bound; defaults to the end of the traversal.
    pub stop: Option<i64>,
    /// Stride, defaults to 1. Must be nonzero.
    pub step: Option<i64>,
}

impl SliceSpec {
    /// Resolve the spec against an axis of `len` elements.
    ///
    /// Matches the semantics the original slicing protocol borrows from its
    /// host language: negative bounds count from the end, out-of-range
    /// bounds clamp, and a negative step flips the traversal direction (the
    /// resolved `stop` is then exclusive going downward and may be -1).
    pub(crate) fn resolve(&self, len: u64) -> SlabResult<(i64, i64, i64)> {
        let len = i64::try_from(len)
            .map_err(|_| SlabError::InvalidSlice(format!("axis length {len} too large")))?;
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(SlabError::InvalidSlice("step must be nonzero".into()));
        }

        let clamp = |bound: Option<i64>, default: i64, lower: i64, upper: i64| -> i64 {
            let Some(mut b) = bound else {
                return default;
            };
            if b < 0 {
                b += len;
            }
            b.clamp(lower, upper)
        };

        let (start, stop) = if step > 0 {
            (
                clamp(self.start, 0, 0, len),
                clamp(self.stop, len, 0, len),
            )
        } else {
            (
                clamp(self.start, len - 1, -1, len - 1),
                clamp(self.stop, -1, -1, len - 1),
            )
        };
        Ok((start, stop, step))
    }
}

/// A range selector resolved against one inner axis: `[start, stop)` with a
/// positive stride, plus a flag recording whether the caller asked for a
/// bare index (and therefore expects the axis to be squeezed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InnerSel {
    pub start: u64,
    pub stop: u64,
    pub step: u64,
    pub was_int: bool,
}

/// Resolve a key element against an inner axis of `len` elements.
///
/// Inner axes reject negative steps; only the stack axis supports them.
pub(crate) fn resolve_inner(key: &AxisKey, len: u64) -> SlabResult<InnerSel> {
    match key {
        AxisKey::Index(idx) => {
            let pos = resolve_index(*idx, len)?;
            Ok(InnerSel {
                start: pos,
                stop: pos + 1,
                step: 1,
                was_int: true,
            })
        }
        AxisKey::Slice(spec) => {
            let (start, stop, step) = spec.resolve(len)?;
            if step < 0 {
                return Err(SlabError::NegativeStep);
            }
            // start/stop are clamped to [0, len] for positive steps
            Ok(InnerSel {
                start: start as u64,
                stop: (stop.max(start)) as u64,
                step: step as u64,
                was_int: false,
            })
        }
    }
}

/// Resolve a key element against the stack axis into the selected positions
/// (in traversal order) plus the was-int squeeze flag. Negative steps walk
/// the stack backwards.
pub(crate) fn resolve_stack(key: &AxisKey, len: u64) -> SlabResult<(Vec<u64>, bool)> {
    match key {
        AxisKey::Index(idx) => Ok((vec![resolve_index(*idx, len)?], true)),
        AxisKey::Slice(spec) => {
            let (start, stop, step) = spec.resolve(len)?;
            let mut positions = Vec::new();
            let mut pos = start;
            while (step > 0 && pos < stop) || (step < 0 && pos > stop) {
                positions.push(pos as u64);
                pos += step;
            }
            Ok((positions, false))
        }
    }
}

fn resolve_index(idx: i64, len: u64) -> SlabResult<u64> {
    let len_i = i64::try_from(len)
        .map_err(|_| SlabError::InvalidSlice(format!("axis length {len} too large")))?;
    let pos = if idx < 0 { idx + len_i } else { idx };
    if pos < 0 || pos >= len_i {
        return Err(SlabError::InvalidSlice(format!(
            "index {idx} out of bounds for axis of length {len}"
        )));
    }
    Ok(pos as u64)
}

/// An axis selector already resolved against a concrete tile, as consumed by
/// [`Slab::slice`](crate::Slab::slice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileSel {
    /// Take one position and drop the axis.
    Index(u64),
    /// Take a strided `[start, stop)` range and keep the axis.
    Slice {
        /// First position taken.
        start: u64,
        /// Exclusive upper bound.
        stop: u64,
        /// Positive stride.
        step: u64,
    },
}

/// The starting index of a tile along each inner dimension.
///
/// Converts from a scalar (the first inner dimension's offset, zero-filling
/// the rest), from slices and vectors (zero-padded on the right up to the
/// tile rank), or from `()` for the all-zeros origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin(Vec<u64>);

impl Origin {
    /// The components as given, before rank normalization.
    #[must_use]
    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// Expand to exactly `rank` components, zero-padding on the right.
    pub(crate) fn normalize(&self, rank: usize) -> SlabResult<Vec<u64>> {
        if self.0.len() > rank {
            return Err(SlabError::InvalidOrigin {
                origin: self.0.clone(),
                rank,
            });
        }
        let mut full = self.0.clone();
        full.resize(rank, 0);
        Ok(full)
    }
}

impl From<()> for Origin {
    fn from((): ()) -> Self {
        Origin::default()
    }
}

impl From<u64> for Origin {
    fn from(first: u64) -> Self {
        Origin(vec![first])
    }
}

impl From<Vec<u64>> for Origin {
    fn from(components: Vec<u64>) -> Self {
        Origin(components)
    }
}

impl From<&[u64]> for Origin {
    fn from(components: &[u64]) -> Self {
        Origin(components.to_vec())
    }
}

impl<const N: usize> From<[u64; N]> for Origin {
    fn from(components: [u64; N]) -> Self {
        Origin(components.to_vec())
    }
}
