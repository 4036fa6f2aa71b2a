use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod config;

pub const DEFAULT_PAGE_SKIP: i64 = 0;
pub const DEFAULT_PAGE_LIMIT: i64 = 100;

/// Named data parameters bound to a plan. Ordered by name.
pub type Parameters = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("unknown relationship direction '{0}' (expected outgoing, incoming or both)")]
    UnknownDirection(String),
    #[error("unknown filter operator '{0}'")]
    UnknownOperator(String),
    #[error("malformed query specification: {0}")]
    Malformed(String),
}

/// Traversal direction of a relationship step, relative to the origin node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
    Both,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
            Direction::Both => "both",
        }
    }
}

impl FromStr for Direction {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outgoing" | "out" => Ok(Direction::Outgoing),
            "incoming" | "in" => Ok(Direction::Incoming),
            "both" | "bidirectional" | "undirected" => Ok(Direction::Both),
            _ => Err(SpecError::UnknownDirection(s.to_string())),
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "String", try_from = "String")]
pub enum FilterOperator {
    #[default]
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Lt => "<",
            FilterOperator::Le => "<=",
            FilterOperator::Gt => ">",
            FilterOperator::Ge => ">=",
            FilterOperator::Contains => "CONTAINS",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" => Ok(FilterOperator::Eq),
            "<" => Ok(FilterOperator::Lt),
            "<=" => Ok(FilterOperator::Le),
            ">" => Ok(FilterOperator::Gt),
            ">=" => Ok(FilterOperator::Ge),
            other if other.eq_ignore_ascii_case("contains") => Ok(FilterOperator::Contains),
            other => Err(SpecError::UnknownOperator(other.to_string())),
        }
    }
}

impl TryFrom<String> for FilterOperator {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilterOperator> for String {
    fn from(op: FilterOperator) -> Self {
        op.as_str().to_string()
    }
}

/// A comparison against a single property of the origin node.
///
/// Accepts either `{"operator": ">=", "value": 3}` or a bare value, which
/// means equality. A missing or null value makes the filter a no-op.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Filter {
    pub operator: FilterOperator,
    pub value: Option<Value>,
}

impl Filter {
    pub fn new(operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            operator,
            value: Some(value.into()),
        }
    }

    /// Value to bind, or `None` when the filter should be dropped.
    pub fn effective_value(&self) -> Option<&Value> {
        self.value.as_ref().filter(|v| !v.is_null())
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match raw {
            Value::Object(mut map) if map.contains_key("operator") || map.contains_key("value") => {
                let operator = match map.remove("operator") {
                    Some(Value::String(op)) => op.parse().map_err(serde::de::Error::custom)?,
                    Some(Value::Null) | None => FilterOperator::Eq,
                    Some(other) => {
                        return Err(serde::de::Error::custom(SpecError::UnknownOperator(
                            other.to_string(),
                        )))
                    }
                };
                Ok(Filter {
                    operator,
                    value: map.remove("value"),
                })
            }
            bare => Ok(Filter {
                operator: FilterOperator::Eq,
                value: Some(bare),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipPattern {
    #[serde(rename = "type", alias = "rel_type")]
    pub rel_type: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default, alias = "target_type")]
    pub target_label: Option<String>,
}

impl RelationshipPattern {
    pub fn new(rel_type: impl Into<String>, direction: Direction) -> Self {
        Self {
            rel_type: rel_type.into(),
            direction,
            target_label: None,
        }
    }

    pub fn to_label(mut self, label: impl Into<String>) -> Self {
        self.target_label = Some(label.into());
        self
    }
}

fn default_skip() -> i64 { DEFAULT_PAGE_SKIP }
fn default_limit() -> i64 { DEFAULT_PAGE_LIMIT }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    #[serde(default = "default_skip")]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            skip: DEFAULT_PAGE_SKIP,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Declarative description of a graph query.
///
/// Labels, relationship types and property keys are structural identifiers
/// that end up in plan text; values are only ever bound as parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuerySpec {
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub relationships: Vec<RelationshipPattern>,
    #[serde(default)]
    pub filters: BTreeMap<String, Filter>,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_search: Option<String>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a spec coming from an API payload.
    pub fn from_json(value: Value) -> Result<Self, SpecError> {
        let mut spec: QuerySpec =
            serde_json::from_value(value).map_err(|e| SpecError::Malformed(e.to_string()))?;
        spec.dedup_entity_types();
        Ok(spec)
    }

    pub fn entity_type(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        if !self.entity_types.contains(&label) {
            self.entity_types.push(label);
        }
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn filter(mut self, key: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), Filter::new(operator, value));
        self
    }

    pub fn relationship(mut self, pattern: RelationshipPattern) -> Self {
        self.relationships.push(pattern);
        self
    }

    pub fn paginate(mut self, skip: i64, limit: i64) -> Self {
        self.pagination = Pagination { skip, limit };
        self
    }

    pub fn text_search(mut self, text: impl Into<String>) -> Self {
        self.text_search = Some(text.into());
        self
    }

    // Keeps the first occurrence of each label.
    fn dedup_entity_types(&mut self) {
        let mut seen = Vec::with_capacity(self.entity_types.len());
        self.entity_types.retain(|label| {
            if seen.contains(label) {
                false
            } else {
                seen.push(label.clone());
                true
            }
        });
    }
}
