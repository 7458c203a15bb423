//! Exact L2 index over the memory-mapped key table.
//!
//! The index never copies the keys into memory: `keys.bin` is memory-mapped
//! and every query scans the mapped f16 vectors. An optional subset restricts
//! the scan to a list of entry ids; results always carry global entry ids so
//! they can be resolved against the full value table.

use std::cmp::Ordering;
use std::fs::File;
use std::path::{Path, PathBuf};

use half::f16;
use memmap2::Mmap;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{DatastoreError, DatastoreResult};

/// Neighbours for a batch of queries. Both arrays are `[num_queries, k]`,
/// ordered by ascending distance.
#[derive(Debug, Clone)]
pub struct SearchOutput {
    /// Squared L2 distances
    pub distances: Array2<f32>,
    /// Global entry ids
    pub ids: Array2<u64>,
}

/// Brute-force squared-L2 index backed by a memory-mapped f16 key table.
#[derive(Debug)]
pub struct FlatIndex {
    path: PathBuf,
    keys_mmap: Mmap,
    dimension: usize,
    ntotal: usize,
    subset: Option<Vec<usize>>,
}

impl FlatIndex {
    /// Map a key table of `entries` vectors of width `dimension`.
    pub fn open(path: &Path, dimension: usize, entries: usize) -> DatastoreResult<Self> {
        let file = File::open(path).map_err(|e| DatastoreError::io(path, e))?;

        // Memory-map keys (doesn't load into RAM)
        let keys_mmap = unsafe { Mmap::map(&file) }.map_err(|e| DatastoreError::io(path, e))?;

        let expected = entries * dimension * std::mem::size_of::<f16>();
        if keys_mmap.len() != expected {
            return Err(DatastoreError::malformed(
                path,
                format!(
                    "key table has {} bytes, expected {} ({} x {} f16)",
                    keys_mmap.len(),
                    expected,
                    entries,
                    dimension
                ),
            ));
        }
        bytemuck::try_cast_slice::<u8, f16>(&keys_mmap)
            .map_err(|e| DatastoreError::malformed(path, format!("unaligned key table: {}", e)))?;

        log::info!(
            "Mapped key index {:?}: {} entries, dimension {}",
            path,
            entries,
            dimension
        );

        Ok(Self {
            path: path.to_path_buf(),
            keys_mmap,
            dimension,
            ntotal: entries,
            subset: None,
        })
    }

    /// Restrict searches to the given entry ids.
    pub fn with_subset(mut self, ids: &[i64]) -> DatastoreResult<Self> {
        let mut subset = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < 0 || id as usize >= self.ntotal {
                return Err(DatastoreError::SubsetOutOfRange {
                    id,
                    size: self.ntotal,
                });
            }
            subset.push(id as usize);
        }
        log::info!(
            "Restricted index {:?} to a subset of {} / {} entries",
            self.path,
            subset.len(),
            self.ntotal
        );
        self.subset = Some(subset);
        Ok(self)
    }

    /// Number of searchable entries (subset size when a subset is active).
    pub fn len(&self) -> usize {
        self.subset.as_ref().map_or(self.ntotal, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries in the underlying key table.
    pub fn ntotal(&self) -> usize {
        self.ntotal
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn is_subset(&self) -> bool {
        self.subset.is_some()
    }

    fn keys(&self) -> &[f16] {
        // Alignment and length were checked in `open`
        bytemuck::cast_slice(&self.keys_mmap)
    }

    fn key(&self, id: usize) -> &[f16] {
        let start = id * self.dimension;
        &self.keys()[start..start + self.dimension]
    }

    /// Decode a stored key back to f32.
    pub fn reconstruct(&self, id: usize) -> Option<Vec<f32>> {
        if id >= self.ntotal {
            return None;
        }
        Some(self.key(id).iter().map(|v| v.to_f32()).collect())
    }

    /// Find the `k` nearest entries for every row of `queries`.
    ///
    /// Returns `min(k, self.len())` neighbours per query.
    pub fn search(&self, queries: ArrayView2<'_, f32>, k: usize) -> DatastoreResult<SearchOutput> {
        let (num_queries, dim) = queries.dim();
        if dim != self.dimension {
            return Err(DatastoreError::Dimension {
                expected: self.dimension,
                got: dim,
            });
        }

        let k = k.min(self.len());
        let rows: Vec<Vec<(usize, f32)>> = queries
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|query| self.search_one(query, k))
            .collect();

        let mut distances = Array2::<f32>::zeros((num_queries, k));
        let mut ids = Array2::<u64>::zeros((num_queries, k));
        for (row, neighbours) in rows.into_iter().enumerate() {
            for (col, (id, dist)) in neighbours.into_iter().enumerate() {
                distances[[row, col]] = dist;
                ids[[row, col]] = id as u64;
            }
        }

        Ok(SearchOutput { distances, ids })
    }

    fn search_one(&self, query: ArrayView1<'_, f32>, k: usize) -> Vec<(usize, f32)> {
        let query: Vec<f32> = query.iter().copied().collect();

        let mut scores: Vec<(usize, f32)> = match &self.subset {
            Some(ids) => ids
                .iter()
                .map(|&id| (id, squared_l2(&query, self.key(id))))
                .collect(),
            None => (0..self.ntotal)
                .map(|id| (id, squared_l2(&query, self.key(id))))
                .collect(),
        };

        // Partial sort for top-k
        if scores.len() > k {
            scores.select_nth_unstable_by(k, by_distance);
            scores.truncate(k);
        }

        scores.sort_by(by_distance);
        scores
    }
}

fn by_distance(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    a.1.partial_cmp(&b.1)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

/// Squared euclidean distance between an f32 query and an f16 key.
fn squared_l2(query: &[f32], key: &[f16]) -> f32 {
    query
        .iter()
        .zip(key.iter())
        .map(|(q, k)| {
            let d = q - k.to_f32();
            d * d
        })
        .sum()
}
