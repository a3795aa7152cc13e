//! Purpose: Load the patient records file into a `Store`.
//! Exports: `load`, `from_json_str`, `DEFAULT_DATA_PATH`.
//! Role: Startup-time loader; the only fallible I/O in the crate besides HTTP.
//! Invariants: Root must be a JSON object whose values are objects.
//! Invariants: Identifier and attribute order follow the file.

use std::path::Path;

use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::store::Store;

pub const DEFAULT_DATA_PATH: &str = "patients.json";

pub fn load(path: &Path) -> Result<Store, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read data file")
            .with_path(path)
            .with_source(err)
    })?;
    from_json_str(&text).map_err(|err| err.with_path(path))
}

pub fn from_json_str(text: &str) -> Result<Store, Error> {
    let root: Value = serde_json::from_str(text).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("data file is not valid JSON")
            .with_source(err)
    })?;
    let Value::Object(root) = root else {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("data file root must be a JSON object keyed by patient id"));
    };
    let mut entries: Vec<(String, Record)> = Vec::with_capacity(root.len());
    for (id, value) in root {
        let attributes: Map<String, Value> = match value {
            Value::Object(attributes) => attributes,
            _ => {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("record {id:?} is not a JSON object")));
            }
        };
        entries.push((id, Record::new(attributes)));
    }
    Ok(Store::from_entries(entries))
}
