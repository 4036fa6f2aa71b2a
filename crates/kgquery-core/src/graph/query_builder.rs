// Query Plan Builder - turns a declarative QuerySpec into Cypher traversal text
// Labels, relationship types and keys are interpolated; values are always bound as parameters

use crate::error::QueryError;
use kgquery_common::config::{DEFAULT_FULLTEXT_INDEX, DEFAULT_MAX_PAGE_LIMIT};
use kgquery_common::{Direction, Pagination, Parameters, QuerySpec};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Binding name of the anchor node in every generated plan.
pub const ORIGIN_BINDING: &str = "e";

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Entity labels the knowledge graph ships indexes for.
pub const KNOWN_ENTITY_TYPES: [&str; 6] =
    ["Document", "Concept", "Symbol", "Algorithm", "Implementation", "Domain"];

/// Per-label list of indexed properties, most selective first.
#[derive(Debug, Clone)]
pub struct IndexHints {
    by_label: HashMap<String, Vec<String>>,
}

impl IndexHints {
    pub fn new(by_label: HashMap<String, Vec<String>>) -> Self {
        Self { by_label }
    }

    pub fn empty() -> Self {
        Self { by_label: HashMap::new() }
    }

    pub fn with_label<I, S>(mut self, label: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by_label
            .insert(label.into(), properties.into_iter().map(Into::into).collect());
        self
    }

    pub fn indexed(&self, label: &str) -> &[String] {
        self.by_label.get(label).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for IndexHints {
    /// Mirrors the indexes created for the knowledge graph schema: every
    /// entity type indexes `name`, `knowledge_tier` and `created_at`, plus a
    /// few type-specific ones.
    fn default() -> Self {
        let mut by_label = HashMap::new();
        for label in KNOWN_ENTITY_TYPES {
            let mut props = vec![
                "name".to_string(),
                "knowledge_tier".to_string(),
                "created_at".to_string(),
            ];
            match label {
                "Symbol" => props.push("latex".to_string()),
                "Document" => props.extend(["year".to_string(), "authors".to_string()]),
                "Concept" => props.push("domain".to_string()),
                _ => {}
            }
            by_label.insert(label.to_string(), props);
        }
        Self { by_label }
    }
}

/// How the anchor of a plan reaches its first nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    AllNodes,
    LabelScan { labels: Vec<String> },
    IndexSeek { label: String, property: String },
    Fulltext { index: String },
}

/// A generated plan. Lives for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub text: String,
    pub parameters: Parameters,
    /// Names projected by the RETURN clause, origin first.
    pub bindings: Vec<String>,
    pub access_path: AccessPath,
}

impl QueryPlan {
    /// One-line summary for logs and `explain` output.
    pub fn describe(&self) -> String {
        let access = match &self.access_path {
            AccessPath::AllNodes => "AllNodesScan".to_string(),
            AccessPath::LabelScan { labels } => format!("NodeByLabelScan({})", labels.join(":")),
            AccessPath::IndexSeek { label, property } => format!("NodeIndexSeek({}.{})", label, property),
            AccessPath::Fulltext { index } => format!("FulltextSearch({})", index),
        };
        format!(
            "{} -> Project(DISTINCT {}) [params={}]",
            access,
            self.bindings.join(", "),
            self.parameters.len()
        )
    }
}

/// Deterministic QuerySpec -> QueryPlan translation. No I/O, no state.
#[derive(Debug, Clone)]
pub struct QueryPlanBuilder {
    index_hints: IndexHints,
    max_limit: i64,
    fulltext_index: String,
}

impl Default for QueryPlanBuilder {
    fn default() -> Self {
        Self::new(IndexHints::default(), DEFAULT_MAX_PAGE_LIMIT)
    }
}

impl QueryPlanBuilder {
    pub fn new(index_hints: IndexHints, max_limit: i64) -> Self {
        Self {
            index_hints,
            max_limit,
            fulltext_index: DEFAULT_FULLTEXT_INDEX.to_string(),
        }
    }

    pub fn with_fulltext_index(mut self, index: impl Into<String>) -> Self {
        self.fulltext_index = index.into();
        self
    }

    pub fn max_limit(&self) -> i64 {
        self.max_limit
    }

    pub fn build(&self, spec: &QuerySpec) -> Result<QueryPlan, QueryError> {
        self.check_identifiers(spec)?;
        let (skip, limit) = self.page(&spec.pagination)?;

        if let Some(text) = &spec.text_search {
            return self.build_fulltext(spec, text, skip, limit);
        }

        let labels = unique_labels(&spec.entity_types);
        let promoted = self.promoted_predicate(&labels, spec);

        let mut parameters = Parameters::new();
        let mut lines = Vec::new();

        // Anchor: (e:A:B {indexed: $p_indexed})
        let mut anchor = format!("({}", ORIGIN_BINDING);
        for label in &labels {
            anchor.push(':');
            anchor.push_str(label);
        }
        if let Some((_, property)) = promoted {
            let name = property_param(property);
            let _ = write!(anchor, " {{{}: ${}}}", property, name);
            parameters.insert(name, spec.properties[property].clone());
        }
        anchor.push(')');
        lines.push(format!("MATCH {}", anchor));

        let mut conditions = Vec::new();
        for (key, value) in &spec.properties {
            if promoted.map_or(false, |(_, p)| p == key.as_str()) {
                continue;
            }
            let name = property_param(key);
            conditions.push(format!("{}.{} = ${}", ORIGIN_BINDING, key, name));
            parameters.insert(name, value.clone());
        }
        for (key, filter) in &spec.filters {
            let Some(value) = filter.effective_value() else {
                continue;
            };
            let name = filter_param(key);
            conditions.push(format!(
                "{}.{} {} ${}",
                ORIGIN_BINDING,
                key,
                filter.operator.as_str(),
                name
            ));
            parameters.insert(name, value.clone());
        }
        if !conditions.is_empty() {
            lines.push(format!("WHERE {}", conditions.join(" AND ")));
        }

        let mut bindings = vec![ORIGIN_BINDING.to_string()];
        for (i, rel) in spec.relationships.iter().enumerate() {
            let rel_binding = format!("r{}", i);
            let related_binding = format!("related{}", i);
            let target = rel
                .target_label
                .as_deref()
                .map(|label| format!(":{}", label))
                .unwrap_or_default();
            let pattern = match rel.direction {
                Direction::Outgoing => format!(
                    "({})-[{}:{}]->({}{})",
                    ORIGIN_BINDING, rel_binding, rel.rel_type, related_binding, target
                ),
                Direction::Incoming => format!(
                    "({})<-[{}:{}]-({}{})",
                    ORIGIN_BINDING, rel_binding, rel.rel_type, related_binding, target
                ),
                Direction::Both => format!(
                    "({})-[{}:{}]-({}{})",
                    ORIGIN_BINDING, rel_binding, rel.rel_type, related_binding, target
                ),
            };
            lines.push(format!("OPTIONAL MATCH {}", pattern));
            bindings.push(rel_binding);
            bindings.push(related_binding);
        }

        lines.push(format!("RETURN DISTINCT {}", bindings.join(", ")));
        lines.push(page_clause(skip, &limit.to_string()));

        let access_path = match (promoted, labels.is_empty()) {
            (Some((label, property)), _) => AccessPath::IndexSeek {
                label: label.to_string(),
                property: property.to_string(),
            },
            (None, true) => AccessPath::AllNodes,
            (None, false) => AccessPath::LabelScan {
                labels: labels.iter().map(|l| l.to_string()).collect(),
            },
        };

        Ok(QueryPlan {
            text: lines.join("\n"),
            parameters,
            bindings,
            access_path,
        })
    }

    fn build_fulltext(
        &self,
        spec: &QuerySpec,
        text: &str,
        skip: i64,
        limit: i64,
    ) -> Result<QueryPlan, QueryError> {
        sanitize("fulltext index", &self.fulltext_index)?;

        let labels = unique_labels(&spec.entity_types);
        let mut parameters = Parameters::new();
        parameters.insert("search_text".to_string(), Value::String(text.to_string()));
        parameters.insert("limit".to_string(), Value::from(limit));

        let mut condition = "score > 0".to_string();
        if !labels.is_empty() {
            condition.push_str(" AND any(label IN labels(node) WHERE label IN $entity_types)");
            parameters.insert(
                "entity_types".to_string(),
                Value::Array(labels.iter().map(|l| Value::String(l.to_string())).collect()),
            );
        }

        let lines = [
            format!(
                "CALL db.index.fulltext.queryNodes('{}', $search_text)",
                self.fulltext_index
            ),
            "YIELD node, score".to_string(),
            format!("WHERE {}", condition),
            format!("RETURN node AS {}, score", ORIGIN_BINDING),
            "ORDER BY score DESC".to_string(),
            page_clause(skip, "$limit"),
        ];

        Ok(QueryPlan {
            text: lines.join("\n"),
            parameters,
            bindings: vec![ORIGIN_BINDING.to_string(), "score".to_string()],
            access_path: AccessPath::Fulltext {
                index: self.fulltext_index.clone(),
            },
        })
    }

    /// First (label, property) pair where the property is both requested and
    /// indexed, scanning labels in spec order then each label's hint order.
    fn promoted_predicate<'a>(
        &'a self,
        labels: &[&'a str],
        spec: &QuerySpec,
    ) -> Option<(&'a str, &'a str)> {
        if labels.is_empty() || spec.properties.is_empty() {
            return None;
        }
        labels.iter().find_map(|label| {
            self.index_hints
                .indexed(label)
                .iter()
                .find(|prop| spec.properties.contains_key(prop.as_str()))
                .map(|prop| (*label, prop.as_str()))
        })
    }

    fn page(&self, pagination: &Pagination) -> Result<(i64, i64), QueryError> {
        if pagination.skip < 0 {
            return Err(QueryError::invalid(format!(
                "skip must be non-negative, got {}",
                pagination.skip
            )));
        }
        let limit = pagination.limit.min(self.max_limit);
        if limit <= 0 {
            return Err(QueryError::invalid(format!(
                "limit must be positive, got {} (ceiling {})",
                pagination.limit, self.max_limit
            )));
        }
        Ok((pagination.skip, limit))
    }

    fn check_identifiers(&self, spec: &QuerySpec) -> Result<(), QueryError> {
        for label in &spec.entity_types {
            sanitize("entity type", label)?;
        }
        for rel in &spec.relationships {
            sanitize("relationship type", &rel.rel_type)?;
            if let Some(target) = &rel.target_label {
                sanitize("target label", target)?;
            }
        }
        for key in spec.properties.keys() {
            sanitize("property key", key)?;
        }
        for key in spec.filters.keys() {
            sanitize("filter key", key)?;
        }
        Ok(())
    }
}

/// Rejects anything that is not a plain identifier before it is spliced
/// into plan text.
pub fn sanitize(kind: &str, identifier: &str) -> Result<(), QueryError> {
    if IDENTIFIER_RE.is_match(identifier) {
        Ok(())
    } else {
        Err(QueryError::invalid(format!(
            "illegal {} '{}': must match [A-Za-z_][A-Za-z0-9_]*",
            kind, identifier
        )))
    }
}

fn unique_labels(entity_types: &[String]) -> Vec<&str> {
    let mut labels: Vec<&str> = Vec::with_capacity(entity_types.len());
    for label in entity_types {
        if !labels.contains(&label.as_str()) {
            labels.push(label);
        }
    }
    labels
}

fn property_param(key: &str) -> String {
    format!("p_{}", key)
}

fn filter_param(key: &str) -> String {
    format!("f_{}", key)
}

fn page_clause(skip: i64, limit: &str) -> String {
    if skip > 0 {
        format!("SKIP {} LIMIT {}", skip, limit)
    } else {
        format!("LIMIT {}", limit)
    }
}
