use serde::{Deserialize, Serialize};

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Element type of a stored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableDType {
    F16,
    F32,
    U32,
}

impl TableDType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableDType::F16 => "f16",
            TableDType::F32 => "f32",
            TableDType::U32 => "u32",
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            TableDType::F16 => 2,
            TableDType::F32 | TableDType::U32 => 4,
        }
    }
}

/// Datastore metadata stored as `config.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatastoreConfig {
    /// Key vector width (0 until the first key is appended)
    pub dimension: usize,
    /// Number of key/value entries
    pub entries: usize,
    pub key_dtype: TableDType,
    pub val_dtype: TableDType,
    pub created_at: Option<u64>,    // Unix timestamp
    pub version: u32,               // Format version (for future migrations)
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            dimension: 0,
            entries: 0,
            key_dtype: TableDType::F16,
            val_dtype: TableDType::U32,
            created_at: None,
            version: FORMAT_VERSION,
        }
    }
}

impl DatastoreConfig {
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    /// Expected size of `keys.bin` in bytes
    pub fn keys_bytes(&self) -> usize {
        self.entries * self.dimension * self.key_dtype.size_in_bytes()
    }

    /// Expected size of `vals.bin` in bytes
    pub fn vals_bytes(&self) -> usize {
        self.entries * self.val_dtype.size_in_bytes()
    }
}
