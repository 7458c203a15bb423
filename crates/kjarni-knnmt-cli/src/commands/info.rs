//! Datastore summary

use std::path::Path;

use anyhow::{anyhow, Result};
use kjarni_datastore::{Datastore, CONFIG_FILE, KEYS_FILE, VALS_FILE};
use serde::Serialize;

use super::util::human_bytes;

#[derive(Debug, Serialize)]
pub struct DatastoreInfo {
    pub path: String,
    pub entries: usize,
    pub dimension: usize,
    pub key_dtype: String,
    pub val_dtype: String,
    pub version: u32,
    pub created_at: Option<u64>,
    pub size_bytes: u64,
}

pub fn run(path: &str, format: &str) -> Result<()> {
    let info = describe(Path::new(path))?;
    let output = match format {
        "json" => format!("{}\n", serde_json::to_string_pretty(&info)?),
        "text" => format_info_text(&info),
        _ => return Err(anyhow!("Unknown format: '{}'. Use: json, text", format)),
    };
    print!("{}", output);
    Ok(())
}

/// Read a datastore's config and measure its files without loading tables.
pub fn describe(path: &Path) -> Result<DatastoreInfo> {
    let datastore = Datastore::load(path, &[])?;
    let config = datastore.config();

    let size_bytes: u64 = [CONFIG_FILE, KEYS_FILE, VALS_FILE]
        .iter()
        .filter_map(|name| std::fs::metadata(path.join(name)).ok())
        .map(|meta| meta.len())
        .sum();

    Ok(DatastoreInfo {
        path: path.display().to_string(),
        entries: config.entries,
        dimension: config.dimension,
        key_dtype: config.key_dtype.as_str().to_string(),
        val_dtype: config.val_dtype.as_str().to_string(),
        version: config.version,
        created_at: config.created_at,
        size_bytes,
    })
}

fn format_info_text(info: &DatastoreInfo) -> String {
    let mut output = String::new();
    output.push_str(&format!("Datastore:  {}\n", info.path));
    output.push_str(&format!("Entries:    {}\n", info.entries));
    output.push_str(&format!("Dimension:  {}\n", info.dimension));
    output.push_str(&format!("Keys:       {}\n", info.key_dtype));
    output.push_str(&format!("Values:     {}\n", info.val_dtype));
    output.push_str(&format!("Version:    {}\n", info.version));
    output.push_str(&format!("Size:       {}\n", human_bytes(info.size_bytes)));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn test_describe() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("ds");
        let mut store = Datastore::create(&root);
        store.add_keys(array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]].view()).unwrap();
        store.add_vals(&[10, 20]).unwrap();
        store.dump().unwrap();

        let info = describe(&root).unwrap();
        assert_eq!(info.entries, 2);
        assert_eq!(info.dimension, 3);
        assert_eq!(info.key_dtype, "f16");
        assert_eq!(info.val_dtype, "u32");
        assert!(info.size_bytes >= 2 * 3 * 2 + 2 * 4);

        let text = format_info_text(&info);
        assert!(text.contains("Entries:    2"));
    }

    #[test]
    fn test_describe_missing() {
        let temp = TempDir::new().unwrap();
        assert!(describe(&temp.path().join("nope")).is_err());
    }
}
