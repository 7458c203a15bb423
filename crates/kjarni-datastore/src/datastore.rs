//! Datastore of decoder hidden states (keys) and target tokens (values).
//!
//! On disk a datastore is a directory:
//!
//! ```text
//! <root>/config.json   DatastoreConfig
//! <root>/keys.bin      [entries, dimension] little-endian f16
//! <root>/vals.bin      [entries] little-endian u32
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use half::f16;
use ndarray::{Array2, ArrayView2};

use crate::config::{DatastoreConfig, TableDType, FORMAT_VERSION};
use crate::error::{DatastoreError, DatastoreResult};
use crate::index::{FlatIndex, SearchOutput};

pub const CONFIG_FILE: &str = "config.json";
pub const KEYS_FILE: &str = "keys.bin";
pub const VALS_FILE: &str = "vals.bin";

/// A table that can be loaded into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatastoreField {
    Keys,
    Vals,
}

impl DatastoreField {
    pub fn name(&self) -> &'static str {
        match self {
            DatastoreField::Keys => "keys",
            DatastoreField::Vals => "vals",
        }
    }
}

/// Key/value datastore with an optional similarity index over the keys.
#[derive(Debug)]
pub struct Datastore {
    root: PathBuf,
    config: DatastoreConfig,
    keys: Option<Vec<f16>>,
    vals: Option<Vec<u32>>,
    pad_mask: Option<Array2<bool>>,
    index: Option<FlatIndex>,
}

impl Datastore {
    /// Create an empty, writable datastore that will be dumped to `root`.
    pub fn create(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            config: DatastoreConfig::default(),
            keys: Some(Vec::new()),
            vals: Some(Vec::new()),
            pad_mask: None,
            index: None,
        }
    }

    /// Open an existing datastore, loading only the requested tables.
    ///
    /// Tables that are not requested stay on disk; the key table is still
    /// reachable through [`Datastore::load_index`].
    pub fn load(root: impl AsRef<Path>, fields: &[DatastoreField]) -> DatastoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let config = read_config(&root)?;

        let keys = if fields.contains(&DatastoreField::Keys) {
            let bytes = read_table(&root.join(KEYS_FILE), config.keys_bytes())?;
            Some(bytemuck::pod_collect_to_vec::<u8, f16>(&bytes))
        } else {
            None
        };

        let vals = if fields.contains(&DatastoreField::Vals) {
            let bytes = read_table(&root.join(VALS_FILE), config.vals_bytes())?;
            Some(bytemuck::pod_collect_to_vec::<u8, u32>(&bytes))
        } else {
            None
        };

        log::info!(
            "Loaded datastore {:?}: {} entries, dimension {}, tables {:?}",
            root,
            config.entries,
            config.dimension,
            fields.iter().map(|f| f.name()).collect::<Vec<_>>()
        );

        Ok(Self {
            root,
            config,
            keys,
            vals,
            pad_mask: None,
            index: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    /// Key width, 0 while nothing has been appended.
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Number of entries in the value table.
    pub fn len(&self) -> usize {
        self.vals.as_ref().map_or(self.config.entries, |v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of vectors in the key table.
    pub fn num_keys(&self) -> usize {
        match (&self.keys, self.config.dimension) {
            (Some(_), 0) => 0,
            (Some(keys), dim) => keys.len() / dim,
            (None, _) => self.config.entries,
        }
    }

    /// Append key vectors, one per row, stored at half precision.
    pub fn add_keys(&mut self, keys: ArrayView2<'_, f32>) -> DatastoreResult<usize> {
        let (rows, dim) = keys.dim();
        if self.keys.is_none() {
            return Err(DatastoreError::TableNotLoaded("keys"));
        }
        if self.config.dimension == 0 {
            self.config.dimension = dim;
        } else if dim != self.config.dimension {
            return Err(DatastoreError::Dimension {
                expected: self.config.dimension,
                got: dim,
            });
        }

        let table = self
            .keys
            .as_mut()
            .ok_or(DatastoreError::TableNotLoaded("keys"))?;
        table.reserve(rows * dim);
        table.extend(keys.iter().map(|&v| f16::from_f32(v)));
        Ok(rows)
    }

    /// Append target token values.
    pub fn add_vals(&mut self, vals: &[u32]) -> DatastoreResult<usize> {
        let table = self
            .vals
            .as_mut()
            .ok_or(DatastoreError::TableNotLoaded("vals"))?;
        table.extend_from_slice(vals);
        Ok(vals.len())
    }

    /// Record which positions of the next key batch are real tokens.
    pub fn set_pad_mask(&mut self, mask: Array2<bool>) {
        self.pad_mask = Some(mask);
    }

    pub fn pad_mask(&self) -> Option<&Array2<bool>> {
        self.pad_mask.as_ref()
    }

    /// Remove and return the recorded pad mask.
    pub fn take_pad_mask(&mut self) -> Option<Array2<bool>> {
        self.pad_mask.take()
    }

    pub fn keys(&self) -> DatastoreResult<&[f16]> {
        self.keys
            .as_deref()
            .ok_or(DatastoreError::TableNotLoaded("keys"))
    }

    pub fn vals(&self) -> DatastoreResult<&[u32]> {
        self.vals
            .as_deref()
            .ok_or(DatastoreError::TableNotLoaded("vals"))
    }

    /// Write both tables and the config to the datastore directory.
    pub fn dump(&mut self) -> DatastoreResult<DatastoreConfig> {
        let keys = self
            .keys
            .as_ref()
            .ok_or(DatastoreError::TableNotLoaded("keys"))?;
        let vals = self
            .vals
            .as_ref()
            .ok_or(DatastoreError::TableNotLoaded("vals"))?;

        let num_keys = if self.config.dimension == 0 {
            0
        } else {
            keys.len() / self.config.dimension
        };
        if num_keys != vals.len() {
            return Err(DatastoreError::incompatible(
                &self.root,
                format!(
                    "key and value tables are out of sync: {} keys, {} values",
                    num_keys,
                    vals.len()
                ),
            ));
        }

        fs::create_dir_all(&self.root).map_err(|e| DatastoreError::io(&self.root, e))?;
        write_table(&self.root.join(KEYS_FILE), bytemuck::cast_slice(keys.as_slice()))?;
        write_table(&self.root.join(VALS_FILE), bytemuck::cast_slice(vals.as_slice()))?;

        self.config.entries = vals.len();
        self.config.created_at = Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );

        let config_path = self.root.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(&self.config)
            .map_err(|e| DatastoreError::malformed(&config_path, e.to_string()))?;
        fs::write(&config_path, json).map_err(|e| DatastoreError::io(&config_path, e))?;

        log::info!(
            "Datastore dumped to {:?}: {} entries, dimension {}",
            self.root,
            self.config.entries,
            self.config.dimension
        );

        Ok(self.config.clone())
    }

    /// Attach a similarity index over the full key table.
    pub fn load_index(&mut self) -> DatastoreResult<()> {
        let index = self.open_index()?;
        self.index = Some(index);
        Ok(())
    }

    /// Attach a similarity index restricted to `ids`.
    pub fn load_index_subset(&mut self, ids: &[i64]) -> DatastoreResult<()> {
        let index = self.open_index()?.with_subset(ids)?;
        if index.is_empty() {
            return Err(DatastoreError::incompatible(&self.root, "subset is empty"));
        }
        self.index = Some(index);
        Ok(())
    }

    fn open_index(&self) -> DatastoreResult<FlatIndex> {
        if self.config.entries == 0 {
            return Err(DatastoreError::incompatible(
                &self.root,
                "datastore has no dumped entries to index",
            ));
        }
        FlatIndex::open(
            &self.root.join(KEYS_FILE),
            self.config.dimension,
            self.config.entries,
        )
    }

    pub fn index(&self) -> DatastoreResult<&FlatIndex> {
        self.index
            .as_ref()
            .ok_or_else(|| DatastoreError::IndexNotLoaded(self.root.clone()))
    }

    /// Search the index and resolve the neighbour values.
    pub fn search(
        &self,
        queries: ArrayView2<'_, f32>,
        k: usize,
    ) -> DatastoreResult<(SearchOutput, Array2<u32>)> {
        let output = self.index()?.search(queries, k)?;
        let vals = self.vals()?;

        let mut labels = Array2::<u32>::zeros(output.ids.dim());
        for (label, &id) in labels.iter_mut().zip(output.ids.iter()) {
            *label = *vals.get(id as usize).ok_or_else(|| {
                DatastoreError::incompatible(
                    &self.root,
                    format!("index entry {} has no value ({} values)", id, vals.len()),
                )
            })?;
        }

        Ok((output, labels))
    }
}

fn read_config(root: &Path) -> DatastoreResult<DatastoreConfig> {
    let path = root.join(CONFIG_FILE);
    let text = fs::read_to_string(&path).map_err(|e| DatastoreError::io(&path, e))?;
    let config: DatastoreConfig =
        serde_json::from_str(&text).map_err(|e| DatastoreError::malformed(&path, e.to_string()))?;

    if config.version != FORMAT_VERSION {
        return Err(DatastoreError::incompatible(
            root,
            format!(
                "format version {} is not supported (expected {})",
                config.version, FORMAT_VERSION
            ),
        ));
    }
    if config.key_dtype != TableDType::F16 || config.val_dtype != TableDType::U32 {
        return Err(DatastoreError::incompatible(
            root,
            format!(
                "unsupported table types: keys {:?}, vals {:?}",
                config.key_dtype, config.val_dtype
            ),
        ));
    }
    Ok(config)
}

fn read_table(path: &Path, expected_bytes: usize) -> DatastoreResult<Vec<u8>> {
    let bytes = fs::read(path).map_err(|e| DatastoreError::io(path, e))?;
    if bytes.len() != expected_bytes {
        return Err(DatastoreError::malformed(
            path,
            format!("expected {} bytes, found {}", expected_bytes, bytes.len()),
        ));
    }
    Ok(bytes)
}

fn write_table(path: &Path, bytes: &[u8]) -> DatastoreResult<()> {
    let file = File::create(path).map_err(|e| DatastoreError::io(path, e))?;
    let mut writer = BufWriter::with_capacity(64 * 1024, file);
    writer
        .write_all(bytes)
        .and_then(|_| writer.flush())
        .map_err(|e| DatastoreError::io(path, e))
}
