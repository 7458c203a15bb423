//! Subset id files.
//!
//! A subset file lists the datastore entry ids an index should be restricted
//! to. Two encodings are accepted: a JSON array (`[0, 4, 17]`) or plain text
//! with ids separated by whitespace or commas.

use std::fs;
use std::path::Path;

use crate::error::{DatastoreError, DatastoreResult};

/// Read a subset id file.
pub fn read_subset_ids(path: impl AsRef<Path>) -> DatastoreResult<Vec<i64>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| DatastoreError::io(path, e))?;
    parse_subset_ids(&contents).map_err(|reason| DatastoreError::malformed(path, reason))
}

fn parse_subset_ids(contents: &str) -> Result<Vec<i64>, String> {
    let trimmed = contents.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON id list: {}", e));
    }

    trimmed
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| format!("'{}' is not an integer entry id", s))
        })
        .collect()
}
