//! Nearest-neighbour retrieval against a loaded datastore.

use std::sync::Arc;

use kjarni_datastore::Datastore;
use ndarray::{Array3, ArrayView3};

use crate::error::{KnnError, KnnResult};

/// Neighbours found for every query position of one decoding step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    /// Target tokens of the neighbours. Shape: `[batch, seq, k]`.
    pub labels: Array3<u32>,
    /// Squared L2 distances, ascending per position. Shape: `[batch, seq, k]`.
    pub distances: Array3<f32>,
    /// Datastore entry ids. Shape: `[batch, seq, k]`.
    pub indices: Array3<u64>,
}

impl RetrievalResult {
    /// `(batch, seq)` of the queries this result answers.
    pub fn positions(&self) -> (usize, usize) {
        let (b, s, _) = self.labels.dim();
        (b, s)
    }

    /// Neighbours per position.
    pub fn k(&self) -> usize {
        self.labels.dim().2
    }
}

/// Queries one datastore for the `k` nearest keys.
#[derive(Debug)]
pub struct Retriever {
    datastore: Arc<Datastore>,
    k: usize,
}

impl Retriever {
    /// The datastore must already have its index loaded.
    pub fn new(datastore: Arc<Datastore>, k: usize) -> KnnResult<Self> {
        if k == 0 {
            return Err(KnnError::Configuration(
                "retriever k must be at least 1".to_string(),
            ));
        }
        let index = datastore.index()?;
        if index.is_empty() {
            return Err(KnnError::Configuration(format!(
                "datastore {:?} has an empty index",
                datastore.root()
            )));
        }
        log::debug!(
            "Retriever over {:?}: k={}, {} searchable entries",
            datastore.root(),
            k,
            index.len()
        );
        Ok(Self { datastore, k })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.datastore
    }

    /// Retrieve neighbours for `query` of shape `[batch, seq, hidden]`.
    ///
    /// Returns `min(k, index size)` neighbours per position.
    pub fn retrieve(&self, query: ArrayView3<'_, f32>) -> KnnResult<RetrievalResult> {
        let (batch, seq, hidden) = query.dim();
        let expected = self.datastore.index()?.dimension();
        if hidden != expected {
            return Err(KnnError::Dimension(format!(
                "query width {} does not match datastore dimension {}",
                hidden, expected
            )));
        }

        let flat = query
            .to_shape((batch * seq, hidden))
            .map_err(|e| KnnError::Dimension(e.to_string()))?;
        let (output, labels) = self.datastore.search(flat.view(), self.k)?;
        let found = output.ids.ncols();

        let reshape_err = |e: ndarray::ShapeError| KnnError::Dimension(e.to_string());
        Ok(RetrievalResult {
            labels: labels
                .into_shape_with_order((batch, seq, found))
                .map_err(reshape_err)?,
            distances: output
                .distances
                .into_shape_with_order((batch, seq, found))
                .map_err(reshape_err)?,
            indices: output
                .ids
                .into_shape_with_order((batch, seq, found))
                .map_err(reshape_err)?,
        })
    }
}
