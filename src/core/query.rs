//! Purpose: Filter-and-sort over the record store.
//! Exports: `Query`, `SortOrder`.
//! Role: The only non-trivial read path; a pure function of (store, query).
//! Invariants: Validation order is sort_by, then order, then empty result.
//! Invariants: Empty sort_by/order values are treated as not supplied.
//! Invariants: Filters are exact and conjunctive; absent filters match everything.
//! Invariants: Sorting compares stringified values and is stable in both directions.
//! Notes: Stringified comparison puts age "10" before "9"; this matches the
//! established behavior of the service and is kept on purpose.

use std::str::FromStr;

use super::error::{Error, ErrorKind};
use super::record::{Field, Record};
use super::store::Store;

pub const INVALID_SORT_FIELD_MESSAGE: &str = "Invalid sort_by field";
pub const INVALID_ORDER_MESSAGE: &str = "Invalid order";
pub const NO_MATCH_MESSAGE: &str = "No patients found matching the query";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(()),
        }
    }
}

/// Raw query inputs. `sort_by` and `order` stay unparsed so that validation
/// happens in one place with a fixed precedence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub name: Option<String>,
    pub age: Option<i64>,
    pub city: Option<String>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_age(mut self, age: i64) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_sort_by(mut self, sort_by: impl Into<String>) -> Self {
        self.sort_by = Some(sort_by.into());
        self
    }

    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    /// Checks `sort_by` and `order` without scanning a store.
    pub fn validate(&self) -> Result<(), Error> {
        self.parse_sort().map(|_| ())
    }

    /// Empty `sort_by` or `order` values read as absent.
    fn parse_sort(&self) -> Result<Option<(Field, SortOrder)>, Error> {
        let field = match non_empty(self.sort_by.as_deref()) {
            None => None,
            Some(raw) => Some(raw.parse::<Field>().map_err(|_| {
                let fields: Vec<String> = Field::ALL.iter().map(Field::to_string).collect();
                Error::new(ErrorKind::InvalidSortField)
                    .with_message(INVALID_SORT_FIELD_MESSAGE)
                    .with_hint(format!("Use one of: {}.", fields.join(", ")))
            })?),
        };
        let order = match non_empty(self.order.as_deref()) {
            None => SortOrder::Asc,
            Some(raw) => raw.parse::<SortOrder>().map_err(|_| {
                Error::new(ErrorKind::InvalidOrder)
                    .with_message(INVALID_ORDER_MESSAGE)
                    .with_hint("Use asc or desc.")
            })?,
        };
        Ok(field.map(|field| (field, order)))
    }

    fn matches(&self, record: &Record) -> bool {
        self.name
            .as_deref()
            .is_none_or(|name| record.name() == Some(name))
            && self.age.is_none_or(|age| record.age() == Some(age))
            && self
                .city
                .as_deref()
                .is_none_or(|city| record.city() == Some(city))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

impl Store {
    pub fn filter_and_sort(&self, query: &Query) -> Result<Vec<&Record>, Error> {
        let sort = query.parse_sort()?;

        let mut results: Vec<&Record> = self
            .iter()
            .map(|(_, record)| record)
            .filter(|record| query.matches(record))
            .collect();

        if let Some((field, order)) = sort {
            let mut keyed: Vec<(String, &Record)> = results
                .into_iter()
                .map(|record| (record.sort_key(field), record))
                .collect();
            match order {
                SortOrder::Asc => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
                SortOrder::Desc => keyed.sort_by(|a, b| b.0.cmp(&a.0)),
            }
            results = keyed.into_iter().map(|(_, record)| record).collect();
        }

        if results.is_empty() {
            return Err(Error::new(ErrorKind::NoMatch).with_message(NO_MATCH_MESSAGE));
        }
        Ok(results)
    }
}
