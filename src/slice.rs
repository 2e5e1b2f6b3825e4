//! Logical slices and normalized index regions
//!
//! A [Slice] is what users pass to variable reads and writes: per-axis
//! `start:stop:step` bounds that may be negative or open. Normalization
//! resolves it against a concrete shape into [AxisSpan]s, after which all
//! index math in the crate is non-negative and clamped.

use crate::error::{Error, Result};

/// One axis of a user slice, `start:stop:step` with open and negative bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: i64,
}

impl Slice {
    /// The full axis, `[:]`.
    pub fn all() -> Self {
        Slice {
            start: None,
            stop: None,
            step: 1,
        }
    }

    /// A single index, `[i]` (the axis is kept with length 1).
    pub fn index(i: i64) -> Self {
        Slice {
            start: Some(i),
            stop: Some(i + 1),
            step: 1,
        }
    }

    /// A half-open range, `[start:stop]`.
    pub fn range(start: i64, stop: i64) -> Self {
        Slice {
            start: Some(start),
            stop: Some(stop),
            step: 1,
        }
    }

    /// A strided half-open range, `[start:stop:step]`.
    pub fn stride(start: i64, stop: i64, step: i64) -> Self {
        Slice {
            start: Some(start),
            stop: Some(stop),
            step,
        }
    }
}

/// A normalized span along one axis: `count` indices from `start`, `step` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSpan {
    pub start: usize,
    pub count: usize,
    pub step: usize,
}

impl AxisSpan {
    /// One-past-the-last index touched by the span.
    pub fn end(&self) -> usize {
        if self.count == 0 {
            self.start
        } else {
            self.start + (self.count - 1) * self.step + 1
        }
    }
}

/// A normalized n-dimensional region, one [AxisSpan] per axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    spans: Vec<AxisSpan>,
}

impl Region {
    pub fn new(spans: Vec<AxisSpan>) -> Self {
        Region { spans }
    }

    /// A unit-stride region from inclusive-exclusive bounds.
    pub fn from_bounds(bounds: &[(usize, usize)]) -> Self {
        Region {
            spans: bounds
                .iter()
                .map(|&(start, end)| AxisSpan {
                    start,
                    count: end.saturating_sub(start),
                    step: 1,
                })
                .collect(),
        }
    }

    pub fn spans(&self) -> &[AxisSpan] {
        &self.spans
    }

    /// The shape of the data selected by this region.
    pub fn shape(&self) -> Vec<usize> {
        self.spans.iter().map(|s| s.count).collect()
    }

    pub fn num_elems(&self) -> usize {
        self.spans.iter().map(|s| s.count).product()
    }

    /// Per-axis inclusive-exclusive bounding box of the region.
    pub fn bounding(&self) -> Vec<(usize, usize)> {
        self.spans.iter().map(|s| (s.start, s.end())).collect()
    }

    /// Per-axis start indices.
    pub fn starts(&self) -> Vec<usize> {
        self.spans.iter().map(|s| s.start).collect()
    }
}

/// Resolve a user slice against a variable shape.
///
/// Negative bounds are resolved against the axis length and the result is
/// clamped to `[0, len]`. Steps must be positive; writes additionally require
/// unit steps so that a write maps onto contiguous subarray slabs.
pub fn normalize(slices: &[Slice], shape: &[usize], for_write: bool) -> Result<Vec<AxisSpan>> {
    if slices.len() != shape.len() {
        return Err(Error::SliceRank {
            expected: shape.len(),
            actual: slices.len(),
        });
    }

    let mut spans = Vec::with_capacity(slices.len());
    for (axis, (slice, &len)) in slices.iter().zip(shape.iter()).enumerate() {
        if slice.step <= 0 {
            return Err(Error::InvalidStride {
                axis,
                step: slice.step,
            });
        }
        if for_write && slice.step != 1 {
            return Err(Error::NonUnitStride {
                axis,
                step: slice.step,
            });
        }
        let step = slice.step as usize;

        let resolve = |bound: i64| -> usize {
            let resolved = if bound < 0 { bound + len as i64 } else { bound };
            resolved.clamp(0, len as i64) as usize
        };
        let start = slice.start.map_or(0, resolve);
        let stop = slice.stop.map_or(len, resolve);
        let count = if stop > start {
            (stop - start).div_ceil(step)
        } else {
            0
        };
        spans.push(AxisSpan { start, count, step });
    }
    Ok(spans)
}

/// The output shape of a normalized slice.
pub fn output_shape(spans: &[AxisSpan]) -> Vec<usize> {
    spans.iter().map(|s| s.count).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn full_slice_covers_shape() {
        let spans = normalize(&[Slice::all(), Slice::all()], &[4, 7], false).unwrap();
        assert_eq!(output_shape(&spans), vec![4, 7]);
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans[1].end(), 7);
    }

    #[test]
    fn negative_bounds_resolve_against_length() {
        let spans = normalize(&[Slice::range(-3, -1)], &[10], false).unwrap();
        assert_eq!(spans[0], AxisSpan { start: 7, count: 2, step: 1 });
    }

    #[test]
    fn out_of_range_bounds_clamp() {
        let spans = normalize(&[Slice::range(-99, 99)], &[5], false).unwrap();
        assert_eq!(spans[0], AxisSpan { start: 0, count: 5, step: 1 });
    }

    #[test]
    fn strided_count_rounds_up() {
        let spans = normalize(&[Slice::stride(1, 8, 3)], &[10], false).unwrap();
        // indices 1, 4, 7
        assert_eq!(spans[0], AxisSpan { start: 1, count: 3, step: 3 });
        assert_eq!(spans[0].end(), 8);
    }

    #[test]
    fn write_rejects_non_unit_steps() {
        let err = normalize(&[Slice::stride(0, 4, 2)], &[4], true).unwrap_err();
        assert!(matches!(err, Error::NonUnitStride { axis: 0, step: 2 }));
    }

    #[test]
    fn non_positive_steps_are_rejected() {
        let err = normalize(&[Slice::stride(0, 4, -1)], &[4], false).unwrap_err();
        assert!(matches!(err, Error::InvalidStride { axis: 0, step: -1 }));
    }

    #[test]
    fn rank_mismatch_is_api_misuse() {
        let err = normalize(&[Slice::all()], &[4, 4], false).unwrap_err();
        assert!(matches!(err, Error::SliceRank { expected: 2, actual: 1 }));
    }
}
