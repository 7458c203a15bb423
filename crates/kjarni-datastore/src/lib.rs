//! kjarni-datastore: key/value storage for kNN-augmented decoding
//!
//! Keys are decoder hidden states stored at half precision, values are the
//! target tokens that followed them. An exact L2 index over the memory-mapped
//! key table answers nearest-neighbour queries.

mod config;
mod datastore;
mod error;
mod index;
mod subset;

pub use config::{DatastoreConfig, TableDType, FORMAT_VERSION};
pub use datastore::{Datastore, DatastoreField, CONFIG_FILE, KEYS_FILE, VALS_FILE};
pub use error::{DatastoreError, DatastoreResult};
pub use index::{FlatIndex, SearchOutput};
pub use subset::read_subset_ids;
