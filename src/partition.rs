//! Partition descriptors, the partition matrix, and slice dispatch
//!
//! A partitioned variable's logical shape is tiled by an n-dimensional grid
//! of [Partition]s, one axis per variable dimension. [PartitionMatrix] owns
//! the grid and translates a normalized user slice into per-subarray
//! [IndexEntry] records: the subarray-local source region and the
//! result-local target region of every tile the slice touches.

use serde::{Deserialize, Serialize};

use crate::{
    dimension::AxisKind,
    error::{Error, Result},
    format::StorageFormat,
    slice::{AxisSpan, Region},
};

/// Descriptor of one tile of a partitioned variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Position in the partition grid, one coordinate per axis
    pub index: Vec<usize>,
    /// Inclusive-exclusive bounds of the tile in the logical variable
    pub location: Vec<(usize, usize)>,
    /// Tile shape; always `location[d].1 - location[d].0`
    pub shape: Vec<usize>,
    /// Subarray URI; assigned on first write, absent for untouched tiles
    pub file: Option<String>,
    /// Storage format of the subarray file
    pub format: StorageFormat,
    /// Name of the field variable inside the subarray file
    pub in_variable: String,
}

impl Partition {
    /// Check the shape/location law.
    pub fn is_consistent(&self) -> bool {
        self.index.len() == self.location.len()
            && self.location.len() == self.shape.len()
            && self
                .location
                .iter()
                .zip(&self.shape)
                .all(|(&(start, end), &len)| end >= start && end - start == len)
    }
}

/// One tile's contribution to a slice operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Grid position of the tile
    pub tile: Vec<usize>,
    /// Subarray-local region to read or write (may carry steps on reads)
    pub source: Region,
    /// Result-local region the source maps onto (always unit-stride)
    pub target: Region,
}

/// The n-dimensional grid of partition descriptors tiling one variable
#[derive(Debug, Clone)]
pub struct PartitionMatrix {
    shape: Vec<usize>,
    counts: Vec<usize>,
    bounds: Vec<Vec<(usize, usize)>>,
    cells: Vec<Option<Partition>>,
}

impl PartitionMatrix {
    /// Build the grid for a variable shape and a tile shape.
    ///
    /// Axis lengths that do not divide evenly produce shorter terminal
    /// tiles.
    pub fn new(shape: &[usize], tile: &[usize]) -> Self {
        let mut counts = Vec::with_capacity(shape.len());
        let mut bounds = Vec::with_capacity(shape.len());
        for (&len, &step) in shape.iter().zip(tile.iter()) {
            let mut axis = Vec::new();
            let mut start = 0;
            while start < len {
                let end = (start + step).min(len);
                axis.push((start, end));
                start = end;
            }
            if axis.is_empty() {
                axis.push((0, 0));
            }
            counts.push(axis.len());
            bounds.push(axis);
        }
        let total = counts.iter().product();
        PartitionMatrix {
            shape: shape.to_vec(),
            counts,
            bounds,
            cells: vec![None; total],
        }
    }

    /// Rebuild a grid from a full partition enumeration (the read path).
    pub fn from_partitions(
        shape: &[usize],
        counts: &[usize],
        partitions: Vec<Partition>,
    ) -> Result<Self> {
        let ndims = shape.len();
        if counts.len() != ndims {
            return Err(Error::InternalInvariant(
                "partition grid rank does not match the variable".to_string(),
            ));
        }
        let mut bounds: Vec<Vec<Option<(usize, usize)>>> =
            counts.iter().map(|&c| vec![None; c]).collect();
        let total: usize = counts.iter().product();
        let mut cells: Vec<Option<Partition>> = vec![None; total];

        for part in partitions {
            if !part.is_consistent() || part.index.len() != ndims {
                return Err(Error::InternalInvariant(format!(
                    "inconsistent partition descriptor {:?}",
                    part.index
                )));
            }
            for (d, &i) in part.index.iter().enumerate() {
                if i >= counts[d] {
                    return Err(Error::InternalInvariant(format!(
                        "partition index {:?} outside the grid",
                        part.index
                    )));
                }
                match bounds[d][i] {
                    Some(known) if known != part.location[d] => {
                        return Err(Error::InternalInvariant(format!(
                            "partition {:?} disagrees on axis {d} bounds",
                            part.index
                        )));
                    }
                    _ => bounds[d][i] = Some(part.location[d]),
                }
            }
            let flat = flat_index(counts, &part.index);
            cells[flat] = Some(part);
        }

        let bounds: Vec<Vec<(usize, usize)>> = bounds
            .into_iter()
            .map(|axis| {
                axis.into_iter()
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        Error::InternalInvariant(
                            "partition table does not cover the full grid".to_string(),
                        )
                    })
            })
            .collect::<Result<_>>()?;

        for (d, axis) in bounds.iter().enumerate() {
            let mut expect = 0;
            for &(start, end) in axis {
                if start != expect || end < start {
                    return Err(Error::InternalInvariant(format!(
                        "partition bounds leave a gap on axis {d}"
                    )));
                }
                expect = end;
            }
            if expect != shape[d] {
                return Err(Error::InternalInvariant(format!(
                    "partition bounds do not tile axis {d}"
                )));
            }
        }

        Ok(PartitionMatrix {
            shape: shape.to_vec(),
            counts: counts.to_vec(),
            bounds,
            cells,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Tiles per axis.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn num_tiles(&self) -> usize {
        self.cells.len()
    }

    /// Inclusive-exclusive bounds of one tile.
    pub fn tile_bounds(&self, tile: &[usize]) -> Vec<(usize, usize)> {
        tile.iter()
            .enumerate()
            .map(|(d, &i)| self.bounds[d][i])
            .collect()
    }

    /// The existing descriptor for a tile, if the tile has been touched.
    pub fn cell(&self, tile: &[usize]) -> Option<&Partition> {
        self.cells[flat_index(&self.counts, tile)].as_ref()
    }

    /// The descriptor for a tile, synthesizing an untouched one on demand.
    pub fn descriptor(&self, tile: &[usize], format: StorageFormat, in_variable: &str) -> Partition {
        match self.cell(tile) {
            Some(part) => part.clone(),
            None => {
                let location = self.tile_bounds(tile);
                Partition {
                    index: tile.to_vec(),
                    location: location.clone(),
                    shape: location.iter().map(|&(s, e)| e - s).collect(),
                    file: None,
                    format,
                    in_variable: in_variable.to_string(),
                }
            }
        }
    }

    /// Materialize and return the descriptor for a tile (the write path).
    pub fn ensure_cell(
        &mut self,
        tile: &[usize],
        format: StorageFormat,
        in_variable: &str,
    ) -> &mut Partition {
        let flat = flat_index(&self.counts, tile);
        if self.cells[flat].is_none() {
            let part = self.descriptor(tile, format, in_variable);
            self.cells[flat] = Some(part);
        }
        self.cells[flat].as_mut().unwrap()
    }

    /// Every descriptor in row-major grid order, synthesizing untouched ones.
    pub fn all_descriptors(&self, format: StorageFormat, in_variable: &str) -> Vec<Partition> {
        let mut out = Vec::with_capacity(self.num_tiles());
        let mut tile = vec![0usize; self.counts.len()];
        for _ in 0..self.num_tiles() {
            out.push(self.descriptor(&tile, format, in_variable));
            increment(&mut tile, &self.counts);
        }
        out
    }

    /// Touched descriptors in row-major grid order.
    pub fn touched(&self) -> impl Iterator<Item = &Partition> {
        self.cells.iter().flatten()
    }

    /// Translate a normalized slice into per-tile index entries.
    ///
    /// Entries come out in row-major order over grid indices. Target regions
    /// are pairwise disjoint and their union is exactly the slice's output
    /// region.
    pub fn entries_for(&self, spans: &[AxisSpan]) -> Vec<IndexEntry> {
        // Per axis, the tiles the span grid actually lands in.
        let mut per_axis: Vec<Vec<(usize, AxisSpan, AxisSpan)>> = Vec::with_capacity(spans.len());
        for (d, span) in spans.iter().enumerate() {
            let mut axis = Vec::new();
            if span.count == 0 {
                per_axis.push(axis);
                continue;
            }
            for (i, &(tile_start, tile_end)) in self.bounds[d].iter().enumerate() {
                let lo = tile_start.max(span.start);
                let hi = tile_end.min(span.end());
                if lo >= hi {
                    continue;
                }
                // first span grid point at or above lo
                let rem = (lo - span.start) % span.step;
                let first = if rem == 0 { lo } else { lo + span.step - rem };
                if first >= hi {
                    continue;
                }
                let count = (hi - first).div_ceil(span.step);
                let source = AxisSpan {
                    start: first - tile_start,
                    count,
                    step: span.step,
                };
                let target = AxisSpan {
                    start: (first - span.start) / span.step,
                    count,
                    step: 1,
                };
                axis.push((i, source, target));
            }
            per_axis.push(axis);
        }

        if per_axis.iter().any(Vec::is_empty) {
            return Vec::new();
        }

        // Row-major Cartesian product across axes.
        let mut entries = Vec::new();
        let counts: Vec<usize> = per_axis.iter().map(Vec::len).collect();
        let mut pick = vec![0usize; per_axis.len()];
        let total: usize = counts.iter().product();
        for _ in 0..total {
            let mut tile = Vec::with_capacity(pick.len());
            let mut source = Vec::with_capacity(pick.len());
            let mut target = Vec::with_capacity(pick.len());
            for (d, &p) in pick.iter().enumerate() {
                let (i, src, tgt) = per_axis[d][p];
                tile.push(i);
                source.push(src);
                target.push(tgt);
            }
            entries.push(IndexEntry {
                tile,
                source: Region::new(source),
                target: Region::new(target),
            });
            increment(&mut pick, &counts);
        }
        entries
    }
}

fn flat_index(counts: &[usize], tile: &[usize]) -> usize {
    let mut flat = 0;
    for (d, &i) in tile.iter().enumerate() {
        flat = flat * counts[d] + i;
    }
    flat
}

fn increment(tile: &mut [usize], counts: &[usize]) {
    for d in (0..tile.len()).rev() {
        tile[d] += 1;
        if tile[d] < counts[d] {
            return;
        }
        tile[d] = 0;
    }
}

/// How a variable's tile shape is chosen at creation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileSpec {
    /// Honor this tile shape exactly
    Shape(Vec<usize>),
    /// Split until each tile is at most this many bytes
    MaxBytes(u64),
}

/// Pick a tile shape for a new partitioned variable.
///
/// An explicit shape is honored exactly. A byte bound is met by repeatedly
/// splitting the axis with the longest current tile, preferring the time
/// axis on ties (then the lowest axis index), which keeps tiles near-cubical
/// while spending extra splits on time.
pub fn choose_tile_shape(
    variable: &str,
    shape: &[usize],
    elem_size: usize,
    axes: &[AxisKind],
    spec: &TileSpec,
) -> Result<Vec<usize>> {
    match spec {
        TileSpec::Shape(tile) => {
            if tile.len() != shape.len() {
                return Err(Error::Partitioning {
                    variable: variable.to_string(),
                    detail: format!(
                        "tile shape has {} axes but the variable has {}",
                        tile.len(),
                        shape.len()
                    ),
                });
            }
            for (d, (&t, &len)) in tile.iter().zip(shape.iter()).enumerate() {
                if t == 0 || t > len {
                    return Err(Error::Partitioning {
                        variable: variable.to_string(),
                        detail: format!("tile length {t} on axis {d} exceeds the axis length {len}"),
                    });
                }
            }
            Ok(tile.clone())
        }
        TileSpec::MaxBytes(max) => {
            if *max == 0 {
                return Err(Error::Partitioning {
                    variable: variable.to_string(),
                    detail: "max subarray size must be positive".to_string(),
                });
            }
            let n = shape.len();
            let mut counts = vec![1usize; n];
            let tile_len =
                |counts: &[usize], d: usize| -> usize { shape[d].div_ceil(counts[d].max(1)) };
            loop {
                let bytes: u64 = (0..n)
                    .map(|d| tile_len(&counts, d) as u64)
                    .product::<u64>()
                    * elem_size as u64;
                if bytes <= *max {
                    break;
                }
                let mut best: Option<usize> = None;
                for d in 0..n {
                    if tile_len(&counts, d) <= 1 {
                        continue;
                    }
                    best = match best {
                        None => Some(d),
                        Some(b) => {
                            let (lb, ld) = (tile_len(&counts, b), tile_len(&counts, d));
                            if ld > lb
                                || (ld == lb && axes[d] == AxisKind::T && axes[b] != AxisKind::T)
                            {
                                Some(d)
                            } else {
                                Some(b)
                            }
                        }
                    };
                }
                match best {
                    Some(d) => counts[d] += 1,
                    None => break,
                }
            }
            Ok((0..n).map(|d| tile_len(&counts, d)).collect())
        }
    }
}
