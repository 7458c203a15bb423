//! kjarni-knnmt: k-nearest-neighbour augmented translation decoding
//!
//! Wraps a base decoder so that each step either grows a datastore of hidden
//! states or retrieves neighbours from one or more datastores and blends
//! their distribution into the model's own.

pub mod args;
pub mod combiner;
pub mod config;
pub mod config_loader;
pub mod decoder;
pub mod error;
pub mod ops;
pub mod retriever;

pub use args::KnnArgs;
pub use combiner::{CombineExtra, Combiner};
pub use config::{KeyType, KnnConfig, KnnMode, SourceSlot};
pub use config_loader::{load_knn_config, CONFIG_FILE_NAME};
pub use decoder::{
    BuildContext, CpuFeatureDecoder, DecoderExtra, DecoderFeatures, DecoderOutput, EncoderOut,
    ForwardOptions, IncrementalState, KnnDecoder, KnnStep, SharedDatastore,
};
pub use error::{KnnError, KnnResult};
pub use retriever::{RetrievalResult, Retriever};

pub use kjarni_datastore as datastore;
