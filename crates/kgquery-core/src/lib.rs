pub mod error;
pub mod graph;

pub use error::QueryError;
pub use graph::{ExecuteOptions, OutputFormat, QueryOptimizer, QueryOutcome, QueryResponse, QueryRunner};

// Re-export common types for convenience
pub use kgquery_common::{
    config::KgQueryConfig, Direction, Filter, FilterOperator, Pagination, Parameters, QuerySpec,
    RelationshipPattern,
};
