//! Purpose: Hold the immutable identifier -> record mapping loaded at startup.
//! Exports: `Store`.
//! Role: Backing collection for get-all and get-by-id; iteration order feeds queries.
//! Invariants: Identifiers are unique; a repeated identifier keeps its first position
//! and its last value.
//! Invariants: No method takes `&mut self` after construction.

use std::collections::HashMap;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use super::error::{Error, ErrorKind};
use super::record::Record;

pub(crate) const NOT_FOUND_MESSAGE: &str = "Patient not found";

#[derive(Clone, Debug, Default)]
pub struct Store {
    entries: Vec<(String, Record)>,
    positions: HashMap<String, usize>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store in iteration order of `entries`.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Record)>,
        K: Into<String>,
    {
        let mut store = Self::new();
        for (id, record) in entries {
            let id = id.into();
            match store.positions.get(&id) {
                Some(&index) => store.entries[index].1 = record,
                None => {
                    store.positions.insert(id.clone(), store.entries.len());
                    store.entries.push((id, record));
                }
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.entries.iter().map(|(id, record)| (id.as_str(), record))
    }

    /// Every record keyed by identifier, in store order.
    pub fn get_all(&self) -> &Self {
        self
    }

    pub fn get_by_id(&self, id: &str) -> Result<&Record, Error> {
        self.positions
            .get(id)
            .map(|&index| &self.entries[index].1)
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message(NOT_FOUND_MESSAGE))
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (id, record) in self.iter() {
            map.insert(id.to_string(), record.to_value());
        }
        Value::Object(map)
    }
}

impl Serialize for Store {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, record) in &self.entries {
            map.serialize_entry(id, record)?;
        }
        map.end()
    }
}
