//! Python extension module `_nodemap_core`.
//!
//! File-level operations return plain dicts built by round-tripping through
//! `json.loads`, so callers get the same shapes as the files on disk.

use std::path::Path;

use chrono::Utc;
use pyo3::prelude::*;
use pyo3::wrap_pyfunction;
use serde::Serialize;
use serde_json::Value;

use crate::config::ScoringPolicy;
use crate::mapping::{scoring, signature, url, Augmenter, MappingBuilder};
use crate::models::parse_timestamp;
use crate::validate;

fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let json_str = serde_json::to_string(value)
        .map_err(|e| pyo3::exceptions::PyRuntimeError::new_err(e.to_string()))?;
    let json_module = py.import("json")?;
    json_module
        .call_method1("loads", (json_str,))
        .map(|o| o.into())
}

#[pyfunction]
pub fn normalize_repository_url(repo_url: &str) -> String {
    url::normalize_repository_url(repo_url)
}

#[pyfunction]
pub fn is_supported_repo_url(repo_url: &str) -> bool {
    url::is_supported_repo_url(repo_url)
}

#[pyfunction]
pub fn generate_manager_package_id(normalized_url: &str) -> String {
    url::generate_manager_package_id(normalized_url)
}

/// Normalized descriptor for an `input_types` JSON document.
#[pyfunction]
pub fn normalize_input_signature(input_types_json: &str) -> String {
    let value = serde_json::from_str(input_types_json).unwrap_or(Value::Null);
    signature::normalize_input_signature(&value)
}

#[pyfunction]
#[pyo3(signature = (downloads, github_stars, latest_release=None))]
pub fn package_score(downloads: u64, github_stars: u64, latest_release: Option<&str>) -> f64 {
    let policy = ScoringPolicy::default();
    scoring::popularity(downloads, github_stars, &policy)
        * scoring::recency_multiplier(latest_release.and_then(parse_timestamp), Utc::now(), &policy)
}

#[pyfunction]
pub fn build_mappings(py: Python<'_>, cache_path: &str, output_path: &str) -> PyResult<PyObject> {
    let stats = MappingBuilder::new(ScoringPolicy::default())
        .build_file(Path::new(cache_path), Path::new(output_path))?;
    to_py(py, &stats)
}

#[pyfunction]
#[pyo3(signature = (mappings_path, community_path, output_path=None))]
pub fn augment_mappings(
    py: Python<'_>,
    mappings_path: &str,
    community_path: &str,
    output_path: Option<&str>,
) -> PyResult<PyObject> {
    let output = Path::new(output_path.unwrap_or(mappings_path));
    let stats = Augmenter::new(ScoringPolicy::default()).augment_file(
        Path::new(mappings_path),
        Path::new(community_path),
        output,
    )?;
    to_py(py, &stats)
}

#[pyfunction]
pub fn validate_files(py: Python<'_>, cache_path: &str, mappings_path: &str) -> PyResult<PyObject> {
    let report = validate::validate_files(Path::new(cache_path), Path::new(mappings_path));
    to_py(py, &report)
}

#[pymodule]
fn _nodemap_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("SIGNATURE_SEPARATOR", crate::models::SIGNATURE_SEPARATOR)?;
    m.add("WILDCARD_SIGNATURE", crate::models::WILDCARD_SIGNATURE)?;

    m.add_function(wrap_pyfunction!(normalize_repository_url, m)?)?;
    m.add_function(wrap_pyfunction!(is_supported_repo_url, m)?)?;
    m.add_function(wrap_pyfunction!(generate_manager_package_id, m)?)?;
    m.add_function(wrap_pyfunction!(normalize_input_signature, m)?)?;
    m.add_function(wrap_pyfunction!(package_score, m)?)?;

    m.add_function(wrap_pyfunction!(build_mappings, m)?)?;
    m.add_function(wrap_pyfunction!(augment_mappings, m)?)?;
    m.add_function(wrap_pyfunction!(validate_files, m)?)?;
    Ok(())
}
