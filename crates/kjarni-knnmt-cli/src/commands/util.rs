use anyhow::{anyhow, Result};
use ndarray::Array2;

/// Parse `"0.1,0.2;0.3,0.4"` into one query row per `;`-separated vector.
pub fn parse_queries(input: &str) -> Result<Array2<f32>> {
    let rows: Vec<Vec<f32>> = input
        .split(';')
        .map(str::trim)
        .filter(|row| !row.is_empty())
        .map(|row| {
            row.split(',')
                .map(|v| {
                    v.trim()
                        .parse::<f32>()
                        .map_err(|e| anyhow!("Invalid query value '{}': {}", v.trim(), e))
                })
                .collect::<Result<Vec<f32>>>()
        })
        .collect::<Result<_>>()?;

    let width = rows
        .first()
        .map(|r| r.len())
        .ok_or_else(|| anyhow!("No query vector provided."))?;
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(anyhow!(
            "Query vectors must have the same width: expected {}, found {}",
            width,
            bad.len()
        ));
    }

    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((flat.len() / width, width), flat)?)
}

/// Format a byte count for display.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
