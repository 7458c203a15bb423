//! Datastores shared by every decoder of one build run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kjarni_datastore::{Datastore, DatastoreConfig};
use ndarray::{Array2, ArrayView3};

use crate::error::{KnnError, KnnResult};
use crate::ops::{non_pad_mask, select_keys_with_pad_mask};

/// Hands out one writable datastore per path. Clones share the same stores,
/// so decoders built from any clone append into the same tables.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    stores: Arc<Mutex<HashMap<PathBuf, SharedDatastore>>>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the datastore for `path`, creating an empty one on first use.
    pub fn datastore(&self, path: impl AsRef<Path>) -> SharedDatastore {
        let path = path.as_ref();
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(store) = stores.get(path) {
            log::debug!("Reusing build datastore {:?}", path);
            return store.clone();
        }

        log::info!("Creating build datastore {:?}", path);
        let store = SharedDatastore {
            path: path.to_path_buf(),
            inner: Arc::new(Mutex::new(BuildTables {
                datastore: Datastore::create(path),
                pending_vals: Vec::new(),
            })),
        };
        stores.insert(path.to_path_buf(), store.clone());
        store
    }

    /// Number of distinct datastores handed out.
    pub fn len(&self) -> usize {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dump every datastore to disk, ordered by path.
    pub fn finish(&self) -> KnnResult<Vec<(PathBuf, DatastoreConfig)>> {
        let mut stores: Vec<SharedDatastore> = self
            .stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        stores.sort_by(|a, b| a.path.cmp(&b.path));

        stores
            .iter()
            .map(|store| store.dump().map(|config| (store.path.clone(), config)))
            .collect()
    }
}

/// Datastore plus the values of the step whose keys have not arrived yet.
#[derive(Debug)]
struct BuildTables {
    datastore: Datastore,
    pending_vals: Vec<u32>,
}

/// A build datastore shared between decoders and the host driving them.
#[derive(Debug, Clone)]
pub struct SharedDatastore {
    path: PathBuf,
    inner: Arc<Mutex<BuildTables>>,
}

impl SharedDatastore {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BuildTables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entries holding both a key and a value.
    pub fn len(&self) -> usize {
        let tables = self.lock();
        tables.datastore.num_keys().min(tables.datastore.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the target tokens of the next decoding step. Non-pad tokens
    /// are held back as values until [`SharedDatastore::append_keys`] commits
    /// them together with their keys. Returns the number of pending values.
    pub fn record_targets(&self, target: &Array2<u32>, pad_id: u32) -> KnnResult<usize> {
        let mask = non_pad_mask(target.view(), pad_id);
        let vals: Vec<u32> = target
            .iter()
            .zip(mask.iter())
            .filter(|(_, keep)| **keep)
            .map(|(&t, _)| t)
            .collect();

        let mut tables = self.lock();
        if tables.datastore.pad_mask().is_some() {
            return Err(KnnError::StepOrder(format!(
                "datastore {:?}: targets recorded twice without a forward in between",
                self.path
            )));
        }
        let pending = vals.len();
        tables.pending_vals = vals;
        tables.datastore.set_pad_mask(mask);
        Ok(pending)
    }

    /// Append the keys of the positions recorded by
    /// [`SharedDatastore::record_targets`] and commit the pending values with
    /// them. On a shape or width mismatch nothing is written and the recorded
    /// step stays pending.
    pub fn append_keys(&self, keys: ArrayView3<'_, f32>) -> KnnResult<usize> {
        let mut tables = self.lock();
        let mask = tables.datastore.pad_mask().ok_or_else(|| {
            KnnError::StepOrder(format!(
                "no target tokens recorded for datastore {:?} before forward",
                self.path
            ))
        })?;
        let selected = select_keys_with_pad_mask(keys, mask.view())?;

        let dimension = tables.datastore.dimension();
        if dimension != 0 && selected.ncols() != dimension {
            return Err(KnnError::Dimension(format!(
                "datastore {:?} expects keys of width {}, got {}",
                self.path,
                dimension,
                selected.ncols()
            )));
        }

        tables.datastore.take_pad_mask();
        let vals = std::mem::take(&mut tables.pending_vals);
        let added = tables.datastore.add_keys(selected.view())?;
        tables.datastore.add_vals(&vals)?;
        Ok(added)
    }

    /// Write the datastore to its directory. Values of a step that never
    /// reached `append_keys` are not written.
    pub fn dump(&self) -> KnnResult<DatastoreConfig> {
        let mut tables = self.lock();
        if tables.datastore.pad_mask().is_some() {
            log::warn!(
                "Datastore {:?}: dropping {} values recorded without keys",
                self.path,
                tables.pending_vals.len()
            );
        }
        Ok(tables.datastore.dump()?)
    }

    /// Run `f` with the locked datastore.
    pub fn with<R>(&self, f: impl FnOnce(&Datastore) -> R) -> R {
        f(&self.lock().datastore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kjarni_datastore::DatastoreField;
    use ndarray::{array, Array3};
    use tempfile::TempDir;

    #[test]
    fn test_same_path_same_store() {
        let ctx = BuildContext::new();
        let a = ctx.datastore("/tmp/ds");
        let b = ctx.clone().datastore("/tmp/ds");
        let c = ctx.datastore("/tmp/other");

        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_targets_then_keys() {
        let ctx = BuildContext::new();
        let store = ctx.datastore("/tmp/ds");

        let target = array![[5u32, 6, 1], [7, 1, 1]];
        assert_eq!(store.record_targets(&target, 1).unwrap(), 3);

        let keys = Array3::from_shape_fn((2, 3, 4), |(b, s, _)| (b * 3 + s) as f32);
        assert_eq!(store.append_keys(keys.view()).unwrap(), 3);
        assert_eq!(store.len(), 3);

        store.with(|ds| {
            assert_eq!(ds.vals().unwrap(), &[5, 6, 7]);
            let first_cols: Vec<f32> = ds
                .keys()
                .unwrap()
                .chunks(4)
                .map(|row| row[0].to_f32())
                .collect();
            assert_eq!(first_cols, vec![0.0, 1.0, 3.0]);
        });
    }

    #[test]
    fn test_keys_without_targets_is_step_order() {
        let ctx = BuildContext::new();
        let store = ctx.datastore("/tmp/ds");
        assert!(matches!(
            store.append_keys(Array3::zeros((1, 1, 2)).view()),
            Err(KnnError::StepOrder(_))
        ));
    }

    #[test]
    fn test_mask_shape_must_match_keys() {
        let ctx = BuildContext::new();
        let store = ctx.datastore("/tmp/ds");
        store.record_targets(&array![[2u32, 3]], 0).unwrap();
        assert!(matches!(
            store.append_keys(Array3::zeros((1, 3, 2)).view()),
            Err(KnnError::Dimension(_))
        ));
    }

    #[test]
    fn test_values_wait_for_keys() {
        let ctx = BuildContext::new();
        let store = ctx.datastore("/tmp/ds");
        store.record_targets(&array![[4u32, 9]], 0).unwrap();
        store.with(|ds| assert!(ds.vals().unwrap().is_empty()));

        store.append_keys(Array3::ones((1, 2, 3)).view()).unwrap();
        store.with(|ds| {
            assert_eq!(ds.vals().unwrap(), &[4, 9]);
            assert_eq!(ds.num_keys(), 2);
        });
    }

    #[test]
    fn test_recording_twice_is_step_order() {
        let temp = TempDir::new().unwrap();
        let ctx = BuildContext::new();
        let store = ctx.datastore(temp.path().join("ds"));

        store.record_targets(&array![[4u32, 9]], 0).unwrap();
        assert!(matches!(
            store.record_targets(&array![[5u32, 6]], 0),
            Err(KnnError::StepOrder(_))
        ));

        store.append_keys(Array3::ones((1, 2, 3)).view()).unwrap();
        store.with(|ds| assert_eq!(ds.vals().unwrap(), &[4, 9]));
        assert_eq!(ctx.finish().unwrap()[0].1.entries, 2);
    }

    #[test]
    fn test_failed_append_leaves_tables_in_sync() {
        let temp = TempDir::new().unwrap();
        let ctx = BuildContext::new();
        let store = ctx.datastore(temp.path().join("ds"));
        store.record_targets(&array![[4u32, 9]], 0).unwrap();
        store.append_keys(Array3::ones((1, 2, 3)).view()).unwrap();

        store.record_targets(&array![[7u32, 8]], 0).unwrap();
        assert!(matches!(
            store.append_keys(Array3::ones((1, 2, 5)).view()),
            Err(KnnError::Dimension(_))
        ));
        assert!(matches!(
            store.append_keys(Array3::ones((1, 3, 3)).view()),
            Err(KnnError::Dimension(_))
        ));
        store.with(|ds| {
            assert_eq!(ds.num_keys(), 2);
            assert_eq!(ds.vals().unwrap(), &[4, 9]);
        });

        // the recorded step is still pending and commits with valid keys
        assert_eq!(store.append_keys(Array3::zeros((1, 2, 3)).view()).unwrap(), 2);
        store.with(|ds| assert_eq!(ds.vals().unwrap(), &[4, 9, 7, 8]));
        assert_eq!(ctx.finish().unwrap()[0].1.entries, 4);
    }

    #[test]
    fn test_unmatched_targets_are_not_dumped() {
        let temp = TempDir::new().unwrap();
        let ctx = BuildContext::new();
        let store = ctx.datastore(temp.path().join("ds"));
        store.record_targets(&array![[4u32, 9]], 0).unwrap();
        store.append_keys(Array3::ones((1, 2, 3)).view()).unwrap();
        store.record_targets(&array![[7u32]], 0).unwrap();

        let summary = ctx.finish().unwrap();
        assert_eq!(summary[0].1.entries, 2);
    }

    #[test]
    fn test_finish_dumps_every_store() {
        let temp = TempDir::new().unwrap();
        let ctx = BuildContext::new();
        for name in ["b", "a"] {
            let store = ctx.datastore(temp.path().join(name));
            store.record_targets(&array![[4u32, 9]], 0).unwrap();
            store.append_keys(Array3::ones((1, 2, 3)).view()).unwrap();
        }

        let summary = ctx.finish().unwrap();
        assert_eq!(summary.len(), 2);
        assert!(summary[0].0.ends_with("a"));
        assert_eq!(summary[1].1.entries, 2);

        let loaded = Datastore::load(temp.path().join("b"), &[DatastoreField::Vals]).unwrap();
        assert_eq!(loaded.vals().unwrap(), &[4, 9]);
        assert_eq!(loaded.dimension(), 3);
    }
}
