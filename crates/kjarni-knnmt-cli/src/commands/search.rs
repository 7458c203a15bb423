//! Nearest-neighbour search against a datastore

use std::path::Path;

use anyhow::{anyhow, Result};
use kjarni_knnmt::decoder::open_for_inference;
use serde::Serialize;

use super::util::parse_queries;

/// One neighbour of one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbour {
    pub query: usize,
    pub rank: usize,
    pub id: u64,
    pub label: u32,
    pub distance: f32,
}

pub fn run(
    path: &str,
    query: &str,
    top_k: usize,
    subset_path: Option<&str>,
    format: &str,
) -> Result<()> {
    let results = search(Path::new(path), query, top_k, subset_path.map(Path::new))?;
    let output = format_results(&results, format)?;
    print!("{}", output);
    Ok(())
}

pub fn search(
    path: &Path,
    query: &str,
    top_k: usize,
    subset_path: Option<&Path>,
) -> Result<Vec<Neighbour>> {
    if top_k == 0 {
        return Err(anyhow!("-k must be at least 1"));
    }
    let queries = parse_queries(query)?;
    let datastore = open_for_inference(path, subset_path)?;
    let (output, labels) = datastore.search(queries.view(), top_k)?;

    let mut results = Vec::with_capacity(output.ids.len());
    for (q, ((ids, dists), labels)) in output
        .ids
        .outer_iter()
        .zip(output.distances.outer_iter())
        .zip(labels.outer_iter())
        .enumerate()
    {
        for (rank, ((&id, &distance), &label)) in
            ids.iter().zip(dists.iter()).zip(labels.iter()).enumerate()
        {
            results.push(Neighbour {
                query: q,
                rank,
                id,
                label,
                distance,
            });
        }
    }
    Ok(results)
}

fn format_results(results: &[Neighbour], format: &str) -> Result<String> {
    match format {
        "json" => format_results_json(results),
        "jsonl" => format_results_jsonl(results),
        "text" => Ok(format_results_text(results)),
        _ => Err(anyhow!(
            "Unknown format: '{}'. Use: json, jsonl, text",
            format
        )),
    }
}

fn format_results_json(results: &[Neighbour]) -> Result<String> {
    Ok(format!("{}\n", serde_json::to_string_pretty(results)?))
}

fn format_results_jsonl(results: &[Neighbour]) -> Result<String> {
    let mut output = String::new();
    for r in results {
        output.push_str(&serde_json::to_string(r)?);
        output.push('\n');
    }
    Ok(output)
}

fn format_results_text(results: &[Neighbour]) -> String {
    let mut output = String::new();
    for r in results {
        output.push_str(&format!(
            "{}\t{}\t{:.4}\t{}\t{}\n",
            r.query, r.rank, r.distance, r.id, r.label
        ));
    }
    output
}
