//! # Filter Restriction Module
//!
//! This module reconciles the filters a client puts on its query with the
//! filter restrictions baked into its scoped key at issuance time.
//!
//! ## Rules
//!
//! A request filter survives only when the scoped key holds a filter on the same
//! property that grants it:
//!
//! - `eq` restriction: the request must use `eq` with the exact same value
//! - `in` restriction: a request `eq` value must be a member of the set, a request
//!   `in` list must be a subset of it, any other operator is dropped
//! - any other restriction: the request must use the same operator and value
//!
//! Scoped filters that the surviving request filters do not mention are appended,
//! so a client can narrow its key but never widen it.
//!
//! ## Usage
//!
//! ```rust
//! use crate::filters::{parse_requested_filters, restrict_filters};
//!
//! let requested = parse_requested_filters(r#"[{"property_name":"x","operator":"eq","property_value":"2"}]"#)?;
//! let merged = restrict_filters(scoped.filters().unwrap_or(&[]), &requested);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Comparison operator of a query filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    Eq,
    In,
    /// Any operator the upstream understands that carries no special merge rule
    Other(String),
}

impl FilterOperator {
    pub fn as_str(&self) -> &str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::In => "in",
            FilterOperator::Other(name) => name,
        }
    }
}

impl From<&str> for FilterOperator {
    fn from(s: &str) -> Self {
        match s {
            "eq" => FilterOperator::Eq,
            "in" => FilterOperator::In,
            other => FilterOperator::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FilterOperator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FilterOperator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(FilterOperator::from(name.as_str()))
    }
}

/// A single property/operator/value restriction on an analytics query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub property_name: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub property_value: Value,
}

#[cfg(test)]
impl Filter {
    pub fn new(property_name: &str, operator: FilterOperator, property_value: Value) -> Self {
        Self {
            property_name: property_name.to_string(),
            operator,
            property_value,
        }
    }

    pub fn eq(property_name: &str, property_value: Value) -> Self {
        Self::new(property_name, FilterOperator::Eq, property_value)
    }

    pub fn is_in(property_name: &str, property_values: Vec<Value>) -> Self {
        Self::new(property_name, FilterOperator::In, Value::Array(property_values))
    }
}

impl Filter {
    /// JSON form as sent to the upstream service
    pub fn to_value(&self) -> Value {
        json!({
            "property_name": self.property_name,
            "operator": self.operator.as_str(),
            "property_value": self.property_value,
        })
    }
}

/// Errors raised while reading the `filters` query parameter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterParseError {
    InvalidJson(String),
    NotAnArray,
    InvalidFilter { index: usize, reason: String },
}

impl fmt::Display for FilterParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterParseError::InvalidJson(msg) => write!(f, "filters are not valid JSON: {}", msg),
            FilterParseError::NotAnArray => write!(f, "filters must be a JSON array"),
            FilterParseError::InvalidFilter { index, reason } => {
                write!(f, "filter at index {} is invalid: {}", index, reason)
            }
        }
    }
}

impl std::error::Error for FilterParseError {}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Parse a JSON array of filters
pub fn parse_filters(raw: &str) -> Result<Vec<Filter>, FilterParseError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| FilterParseError::InvalidJson(e.to_string()))?;
    filters_from_value(value)
}

/// Read filters out of an already decoded JSON value
pub fn filters_from_value(value: Value) -> Result<Vec<Filter>, FilterParseError> {
    let Value::Array(items) = value else {
        return Err(FilterParseError::NotAnArray);
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value::<Filter>(item).map_err(|e| FilterParseError::InvalidFilter {
                index,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Parse the `filters` a client put on its query
///
/// The text must still be a JSON array, but elements that are not filters are
/// dropped: they could never match a scoped filter anyway.
pub fn parse_requested_filters(raw: &str) -> Result<Vec<Filter>, FilterParseError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| FilterParseError::InvalidJson(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(FilterParseError::NotAnArray);
    };

    Ok(items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<Filter>(item) {
            Ok(filter) => Some(filter),
            Err(e) => {
                debug!("Dropping request filter at index {}: {}", index, e);
                None
            }
        })
        .collect())
}

/// Serialize filters the way the upstream expects them in the query string
pub fn to_query_value(filters: &[Filter]) -> String {
    Value::Array(filters.iter().map(Filter::to_value).collect()).to_string()
}

/// Check whether a scoped filter grants the requested filter
pub fn is_permitted(scoped: &Filter, requested: &Filter) -> bool {
    match (&scoped.operator, &requested.operator) {
        (FilterOperator::Eq, FilterOperator::Eq) => {
            same_value(&scoped.property_value, &requested.property_value)
        }
        (FilterOperator::Eq, _) => false,
        (FilterOperator::In, FilterOperator::Eq) => {
            is_member(&scoped.property_value, &requested.property_value)
        }
        (FilterOperator::In, FilterOperator::In) => match &requested.property_value {
            Value::Array(values) => values
                .iter()
                .all(|value| is_member(&scoped.property_value, value)),
            _ => false,
        },
        (FilterOperator::In, _) => false,
        (scoped_operator, requested_operator) => {
            scoped_operator == requested_operator
                && same_value(&scoped.property_value, &requested.property_value)
        }
    }
}

/// Narrow the requested filters to what the scoped filters allow, then re-apply
/// every scoped filter the request did not address
pub fn restrict_filters(scoped: &[Filter], requested: &[Filter]) -> Vec<Filter> {
    let mut merged: Vec<Filter> = requested
        .iter()
        .filter(|requested_filter| {
            scoped
                .iter()
                .find(|s| s.property_name == requested_filter.property_name)
                .is_some_and(|s| is_permitted(s, requested_filter))
        })
        .cloned()
        .collect();

    let covered: HashSet<String> = merged.iter().map(|f| f.property_name.clone()).collect();
    merged.extend(
        scoped
            .iter()
            .filter(|s| !covered.contains(&s.property_name))
            .cloned(),
    );

    merged
}

///////////////////////////////////////////////////////////////////////////////
//****                       Private Functions                           ****//
///////////////////////////////////////////////////////////////////////////////

fn is_member(set: &Value, value: &Value) -> bool {
    matches!(set, Value::Array(items) if items.iter().any(|item| same_value(item, value)))
}

/// JSON equality where numbers compare by value, so `1` and `1.0` match
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
