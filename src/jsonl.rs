use std::{fs, path::Path};

use anyhow::{Context as AnyhowContext, Result};
use serde::de::DeserializeOwned;

/// Parses a file holding a sequence of JSON objects separated by arbitrary
/// whitespace (compact one-per-line or pretty-printed blocks, blank lines
/// allowed). Fails with the file path plus the line/column of the first
/// malformed or incomplete record.
pub fn read_seq<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_seq(&text).with_context(|| format!("Invalid record in {}", path.display()))
}

pub fn parse_seq<T: DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<T>()
        .collect::<Result<Vec<_>, _>>()
        .context("Unable to parse JSON record sequence")
}
