// Graph Query Module Exports
//
// Declarative QuerySpec -> parameterized plan, normalized cache keys, an LRU
// result cache and per-key metrics. The engine itself sits behind QueryRunner.

pub mod query_builder;
pub mod normalizer;
pub mod cache;
pub mod metrics;
pub mod optimizer;
pub mod response;

pub use query_builder::{AccessPath, IndexHints, QueryPlan, QueryPlanBuilder};
pub use normalizer::CacheKeyNormalizer;
pub use cache::{CacheConfig, CacheStats, ResultCache};
pub use metrics::{QueryMetricSample, QueryMetrics};
pub use optimizer::{ExecuteOptions, PlanExplanation, QueryOptimizer, QueryOutcome, QueryRunner};
pub use response::{OutputFormat, QueryResponse};
