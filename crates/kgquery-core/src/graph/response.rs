// Response shapes - the caller picks one representation up front

use super::optimizer::QueryOutcome;
use super::query_builder::ORIGIN_BINDING;
use kgquery_common::Parameters;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Deduplicated entities and relationships.
    #[default]
    Graph,
    /// The generated plan and its parameters; nothing is executed.
    Plan,
    /// Rows exactly as the engine returned them.
    Records,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Graph {
        entities: Vec<Value>,
        relationships: Vec<Value>,
        query_time: f64,
    },
    Plan {
        plan: String,
        parameters: Parameters,
        query_time: f64,
    },
    Records {
        records: Vec<Value>,
        query_time: f64,
    },
}

impl QueryResponse {
    pub fn from_outcome(format: OutputFormat, outcome: &QueryOutcome) -> Self {
        match format {
            OutputFormat::Graph => Self::graph(outcome),
            OutputFormat::Records => Self::records(outcome),
            OutputFormat::Plan => QueryResponse::Plan {
                plan: outcome.plan.clone(),
                parameters: outcome.parameters.clone(),
                query_time: outcome.elapsed_secs,
            },
        }
    }

    pub fn records(outcome: &QueryOutcome) -> Self {
        QueryResponse::Records {
            records: outcome.rows.as_ref().clone(),
            query_time: outcome.elapsed_secs,
        }
    }

    /// Folds rows of `e, r0, related0, ...` bindings into unique entities and
    /// relationships. Relationships get `from_entity_id` / `to_entity_id`
    /// taken from the `id` of the nodes on either side.
    pub fn graph(outcome: &QueryOutcome) -> Self {
        let steps = relationship_steps(&outcome.bindings);
        let mut entities: Vec<Value> = Vec::new();
        let mut relationships: Vec<Value> = Vec::new();

        for row in outcome.rows.iter() {
            let Some(row) = row.as_object() else {
                continue;
            };

            let origin = non_null(row, ORIGIN_BINDING);
            if let Some(origin) = origin {
                let mut entity = origin.clone();
                if let (Some(score), Value::Object(map)) = (non_null(row, "score"), &mut entity) {
                    map.insert("search_score".to_string(), score.clone());
                }
                push_unique(&mut entities, entity);
            }

            for (rel_binding, related_binding) in &steps {
                let related = non_null(row, related_binding);
                if let Some(related) = related {
                    push_unique(&mut entities, related.clone());
                }

                let Some(Value::Object(rel)) = non_null(row, rel_binding) else {
                    continue;
                };
                let mut rel = rel.clone();
                if let Some(id) = origin.and_then(|o| o.get("id")) {
                    rel.insert("from_entity_id".to_string(), id.clone());
                }
                if let Some(id) = related.and_then(|r| r.get("id")) {
                    rel.insert("to_entity_id".to_string(), id.clone());
                }
                push_unique(&mut relationships, Value::Object(rel));
            }
        }

        QueryResponse::Graph {
            entities,
            relationships,
            query_time: outcome.elapsed_secs,
        }
    }

    pub fn query_time(&self) -> f64 {
        match self {
            QueryResponse::Graph { query_time, .. }
            | QueryResponse::Plan { query_time, .. }
            | QueryResponse::Records { query_time, .. } => *query_time,
        }
    }
}

fn relationship_steps(bindings: &[String]) -> Vec<(String, String)> {
    (0..)
        .map(|i| (format!("r{}", i), format!("related{}", i)))
        .take_while(|(rel, _)| bindings.iter().any(|b| b == rel))
        .collect()
}

fn non_null<'a>(row: &'a Map<String, Value>, binding: &str) -> Option<&'a Value> {
    row.get(binding).filter(|v| !v.is_null())
}

fn push_unique(items: &mut Vec<Value>, item: Value) {
    if !items.contains(&item) {
        items.push(item);
    }
}
