//! Purpose: Model one patient record as an open attribute bag with typed views.
//! Exports: `Record`, `Field`.
//! Role: Value type held by the store; filters and sort keys read through it.
//! Invariants: The attribute bag round-trips verbatim (order and JSON types preserved).
//! Invariants: A recognized attribute of the wrong JSON type reads as absent in typed views.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The attributes the query engine knows how to filter and sort on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Field {
    Name,
    Age,
    City,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Name, Field::Age, Field::City];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Age => "age",
            Field::City => "city",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .into_iter()
            .find(|field| field.as_str() == value)
            .ok_or(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    attributes: Map<String, Value>,
}

impl Record {
    pub fn new(attributes: Map<String, Value>) -> Self {
        Self { attributes }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(Field::Name.as_str()).and_then(Value::as_str)
    }

    pub fn city(&self) -> Option<&str> {
        self.get(Field::City.as_str()).and_then(Value::as_str)
    }

    /// Integral JSON numbers only; `30.0` reads as 30, `"30"` reads as absent.
    pub fn age(&self) -> Option<i64> {
        let Some(Value::Number(number)) = self.get(Field::Age.as_str()) else {
            return None;
        };
        if let Some(age) = number.as_i64() {
            return Some(age);
        }
        let float = number.as_f64()?;
        if float.fract() == 0.0 && float >= i64::MIN as f64 && float <= i64::MAX as f64 {
            Some(float as i64)
        } else {
            None
        }
    }

    /// Textual sort key for `field`; a missing attribute sorts as the empty string.
    pub fn sort_key(&self, field: Field) -> String {
        match self.get(field.as_str()) {
            None => String::new(),
            Some(value) => stringify(value),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.attributes.clone())
    }
}

impl From<Map<String, Value>> for Record {
    fn from(attributes: Map<String, Value>) -> Self {
        Self::new(attributes)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
