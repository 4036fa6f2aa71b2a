// Query Optimizer - plan, cache lookup, timed execution, instrumentation
// Owns the result cache and the metrics table; the engine is reached through
// a QueryRunner supplied per call.

use super::cache::{CacheConfig, CacheStats, ResultCache};
use super::metrics::{preview, QueryMetricSample, QueryMetrics};
use super::normalizer::CacheKeyNormalizer;
use super::query_builder::{IndexHints, QueryPlan, QueryPlanBuilder};
use super::response::{OutputFormat, QueryResponse};
use crate::error::QueryError;
use async_trait::async_trait;
use kgquery_common::config::KgQueryConfig;
use kgquery_common::{Parameters, QuerySpec};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// Executes a finished plan against the graph engine.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run(&self, plan: String, parameters: Parameters) -> anyhow::Result<Vec<Value>>;
}

#[async_trait]
impl<F, Fut> QueryRunner for F
where
    F: Fn(String, Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<Value>>> + Send + 'static,
{
    async fn run(&self, plan: String, parameters: Parameters) -> anyhow::Result<Vec<Value>> {
        (self)(plan, parameters).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Skip both the lookup and the store. Metrics are still recorded.
    pub bypass_cache: bool,
    /// Overrides the configured row ceiling for this call.
    pub max_cacheable_rows: Option<usize>,
}

impl ExecuteOptions {
    pub fn bypass() -> Self {
        Self {
            bypass_cache: true,
            ..Self::default()
        }
    }

    pub fn max_cacheable_rows(mut self, rows: usize) -> Self {
        self.max_cacheable_rows = Some(rows);
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub rows: Arc<Vec<Value>>,
    /// Engine time for a fresh run; 0 on a cache hit.
    pub elapsed_secs: f64,
    pub cache_hit: bool,
    pub cache_key: String,
    pub slow: bool,
    /// Plan text sent to the engine, hints applied.
    pub plan: String,
    pub parameters: Parameters,
    /// Projection bindings of the plan, in RETURN order.
    pub bindings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanExplanation {
    /// Plan text as it would be sent, hints applied.
    pub plan: String,
    pub parameters: Parameters,
    pub cache_key: String,
    pub summary: String,
}

/// Shared entry point for graph reads.
///
/// Cloning is cheap and every clone sees the same cache and metrics.
#[derive(Clone)]
pub struct QueryOptimizer {
    builder: Arc<QueryPlanBuilder>,
    pub(crate) cache: Arc<ResultCache<Arc<Vec<Value>>>>,
    metrics: Arc<QueryMetrics>,
    slow_query_threshold_secs: f64,
    max_cacheable_rows: Option<usize>,
    plan_preview_len: usize,
}

impl QueryOptimizer {
    pub fn new(config: &KgQueryConfig) -> Self {
        let hints = match &config.index_hints {
            Some(table) => IndexHints::new(table.clone()),
            None => IndexHints::default(),
        };
        let optimizer = &config.optimizer;
        let builder = QueryPlanBuilder::new(hints, optimizer.max_page_limit)
            .with_fulltext_index(optimizer.fulltext_index.clone());

        Self {
            builder: Arc::new(builder),
            cache: Arc::new(ResultCache::new(CacheConfig::from(config.cache.clone()))),
            metrics: Arc::new(QueryMetrics::new(
                optimizer.metrics_capacity,
                optimizer.parameter_preview_len,
                optimizer.plan_preview_len,
            )),
            slow_query_threshold_secs: optimizer.slow_query_threshold_secs,
            max_cacheable_rows: optimizer.max_cacheable_rows,
            plan_preview_len: optimizer.plan_preview_len,
        }
    }

    pub fn builder(&self) -> &QueryPlanBuilder {
        &self.builder
    }

    /// Builds, looks up, runs and records one query.
    ///
    /// The cache key is taken from the plan before hints are spliced in, so
    /// hinted and unhinted calls share entries. The cache lock is never held
    /// while the runner is awaited.
    pub async fn execute<R>(
        &self,
        spec: &QuerySpec,
        hints: &[String],
        options: ExecuteOptions,
        runner: &R,
    ) -> Result<QueryOutcome, QueryError>
    where
        R: QueryRunner + ?Sized,
    {
        let plan = self.builder.build(spec)?;
        let executed = CacheKeyNormalizer::apply_hints(&plan.text, hints);
        let key = CacheKeyNormalizer::key(&plan.text, &plan.parameters);

        self.metrics.touch(&key, &plan.text);

        let mut use_cache = !options.bypass_cache;
        if use_cache {
            match self.cache.get(&key).await {
                Ok(Some(rows)) => {
                    return Ok(QueryOutcome {
                        rows,
                        elapsed_secs: 0.0,
                        cache_hit: true,
                        cache_key: key,
                        slow: false,
                        plan: executed,
                        parameters: plan.parameters,
                        bindings: plan.bindings,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Cache lookup failed, running uncached: {}", e);
                    use_cache = false;
                }
            }
        }

        let started = Instant::now();
        let result = runner.run(executed.clone(), plan.parameters.clone()).await;
        let elapsed = started.elapsed().as_secs_f64();

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                self.metrics.record_failure(&key, &plan.text, elapsed);
                tracing::error!("Query error ({:.2}s): {:#}", elapsed, e);
                return Err(QueryError::execution(elapsed, e));
            }
        };

        let slow = elapsed > self.slow_query_threshold_secs;
        if slow {
            tracing::warn!(
                "Slow query ({:.2}s): {}...",
                elapsed,
                preview(&plan.text, self.plan_preview_len).replace('\n', " ")
            );
        }
        self.metrics.record_success(&key, &plan.text, elapsed, &plan.parameters, slow);

        let rows = Arc::new(rows);
        if use_cache {
            let ceiling = options.max_cacheable_rows.or(self.max_cacheable_rows);
            match ceiling {
                Some(max) if rows.len() > max => {
                    tracing::debug!("Result too large to cache ({} rows)", rows.len());
                }
                _ => {
                    if let Err(e) = self.cache.set(key.clone(), rows.clone()).await {
                        tracing::warn!("Cache store failed, result not cached: {}", e);
                    }
                }
            }
        }

        Ok(QueryOutcome {
            rows,
            elapsed_secs: elapsed,
            cache_hit: false,
            cache_key: key,
            slow,
            plan: executed,
            parameters: plan.parameters,
            bindings: plan.bindings,
        })
    }

    /// Runs with default options and shapes the rows. `Plan` never reaches
    /// the runner.
    pub async fn query<R>(
        &self,
        spec: &QuerySpec,
        format: OutputFormat,
        runner: &R,
    ) -> Result<QueryResponse, QueryError>
    where
        R: QueryRunner + ?Sized,
    {
        if format == OutputFormat::Plan {
            let plan = self.builder.build(spec)?;
            return Ok(QueryResponse::Plan {
                plan: plan.text,
                parameters: plan.parameters,
                query_time: 0.0,
            });
        }

        let outcome = self.execute(spec, &[], ExecuteOptions::default(), runner).await?;
        Ok(QueryResponse::from_outcome(format, &outcome))
    }

    pub fn explain(&self, spec: &QuerySpec, hints: &[String]) -> Result<PlanExplanation, QueryError> {
        let plan = self.builder.build(spec)?;
        let summary = plan.describe();
        let QueryPlan { text, parameters, .. } = plan;
        let cache_key = CacheKeyNormalizer::key(&text, &parameters);
        Ok(PlanExplanation {
            plan: CacheKeyNormalizer::apply_hints(&text, hints),
            parameters,
            cache_key,
            summary,
        })
    }

    /// Keys with at least one successful run, slowest average first.
    pub fn metrics(&self, limit: usize) -> Vec<QueryMetricSample> {
        self.metrics.slowest(limit)
    }

    pub fn metric(&self, key: &str) -> Option<QueryMetricSample> {
        self.metrics.get(key)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgquery_common::{Direction, FilterOperator, RelationshipPattern};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn optimizer() -> QueryOptimizer {
        QueryOptimizer::new(&KgQueryConfig::default())
    }

    fn symbol_spec(name: &str) -> QuerySpec {
        QuerySpec::new().entity_type("Symbol").property("name", json!(name))
    }

    struct CountingRunner {
        calls: AtomicUsize,
        rows: Vec<Value>,
    }

    impl CountingRunner {
        fn new(rows: Vec<Value>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                rows,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryRunner for CountingRunner {
        async fn run(&self, _plan: String, _parameters: Parameters) -> anyhow::Result<Vec<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.clone())
        }
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let opt = optimizer();
        let runner = CountingRunner::new(vec![json!({"e": {"id": "s1"}})]);
        let spec = symbol_spec("alpha");

        let first = opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap();
        let second = opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.cache_key, second.cache_key);
        assert_eq!(second.rows, first.rows);
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_bypass_runs_every_time_and_still_records_metrics() {
        let opt = optimizer();
        let runner = CountingRunner::new(vec![json!(1)]);
        let spec = symbol_spec("alpha");

        let outcome = opt.execute(&spec, &[], ExecuteOptions::bypass(), &runner).await.unwrap();
        opt.execute(&spec, &[], ExecuteOptions::bypass(), &runner).await.unwrap();

        assert_eq!(runner.calls(), 2);
        assert!(opt.cache.is_empty().await);
        assert_eq!(opt.metric(&outcome.cache_key).unwrap().count, 2);
        assert_eq!(opt.cache_stats().await.total_requests, 0);
    }

    #[tokio::test]
    async fn test_hints_reach_runner_but_not_key() {
        let opt = optimizer();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let runner = move |plan: String, _params: Parameters| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(plan);
                Ok::<_, anyhow::Error>(vec![json!(1)])
            }
        };
        let spec = symbol_spec("alpha");
        let hints = vec!["INDEX e:Symbol(name)".to_string()];

        let hinted = opt.execute(&spec, &hints, ExecuteOptions::default(), &runner).await.unwrap();
        let plain = opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap();

        assert_eq!(hinted.cache_key, plain.cache_key);
        assert!(plain.cache_hit);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("MATCH USING INDEX e:Symbol(name) (e:Symbol"));
    }

    #[tokio::test]
    async fn test_labels_differing_in_case_are_cached_apart() {
        let opt = optimizer();
        let runner = |plan: String, _params: Parameters| async move {
            Ok::<_, anyhow::Error>(vec![json!({ "plan": plan })])
        };

        let title = opt
            .execute(&QuerySpec::new().entity_type("Set"), &[], ExecuteOptions::default(), &runner)
            .await
            .unwrap();
        let upper = opt
            .execute(&QuerySpec::new().entity_type("SET"), &[], ExecuteOptions::default(), &runner)
            .await
            .unwrap();

        assert!(!upper.cache_hit);
        assert_ne!(title.cache_key, upper.cache_key);
        assert!(upper.rows[0]["plan"].as_str().unwrap().starts_with("MATCH (e:SET)"));
        assert_eq!(opt.cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let opt = optimizer();
        let runner = |_plan: String, _params: Parameters| async {
            Err::<Vec<Value>, anyhow::Error>(anyhow::anyhow!("engine unavailable"))
        };
        let spec = symbol_spec("alpha");

        for _ in 0..2 {
            let err = opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap_err();
            assert!(matches!(err, QueryError::ExecutionFailure { .. }));
            assert!(err.to_string().contains("engine unavailable"));
        }

        assert!(opt.cache.is_empty().await);
        let key = opt.explain(&spec, &[]).unwrap().cache_key;
        let sample = opt.metric(&key).unwrap();
        assert_eq!(sample.errors, 2);
        assert_eq!(sample.count, 0);
        assert!(opt.metrics(10).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_spec_never_reaches_runner() {
        let opt = optimizer();
        let runner = CountingRunner::new(vec![]);
        let spec = QuerySpec::new().entity_type("Symbol; DROP").paginate(0, 10);

        let err = opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap_err();
        assert!(err.is_invalid_specification());
        assert_eq!(runner.calls(), 0);
        assert!(opt.metrics.is_empty());
    }

    #[tokio::test]
    async fn test_cache_fault_fails_open() {
        let opt = optimizer();
        let runner = CountingRunner::new(vec![json!(1)]);
        let spec = symbol_spec("alpha");

        opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap();
        opt.cache.corrupt_recency_index().await;

        let outcome = opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap();
        assert!(!outcome.cache_hit);
        assert_eq!(runner.calls(), 2);
        // The faulted call does not repopulate; the next one does.
        assert!(opt.cache.is_empty().await);
        opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap();
        assert_eq!(opt.cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_per_call_row_ceiling() {
        let opt = optimizer();
        let runner = CountingRunner::new(vec![json!(1), json!(2), json!(3)]);
        let spec = symbol_spec("alpha");

        let options = ExecuteOptions::default().max_cacheable_rows(2);
        opt.execute(&spec, &[], options, &runner).await.unwrap();
        assert!(opt.cache.is_empty().await);

        opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap();
        assert_eq!(opt.cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_execution_leaves_no_trace() {
        let opt = optimizer();
        let runner = |_plan: String, _params: Parameters| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, anyhow::Error>(vec![json!(1)])
        };
        let spec = symbol_spec("alpha");

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            opt.execute(&spec, &[], ExecuteOptions::default(), &runner),
        )
        .await;
        assert!(timed_out.is_err());

        assert!(opt.cache.is_empty().await);
        let key = opt.explain(&spec, &[]).unwrap().cache_key;
        let sample = opt.metric(&key).unwrap();
        assert_eq!(sample.count, 0);
        assert_eq!(sample.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_query_is_flagged() {
        let opt = optimizer();
        let runner = |_plan: String, _params: Parameters| async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Ok::<_, anyhow::Error>(vec![])
        };

        let outcome = opt
            .execute(&symbol_spec("alpha"), &[], ExecuteOptions::default(), &runner)
            .await
            .unwrap();
        assert!(outcome.slow);
        assert_eq!(opt.metric(&outcome.cache_key).unwrap().slow_count, 1);
    }

    #[tokio::test]
    async fn test_explain_matches_execute_key() {
        let opt = optimizer();
        let spec = QuerySpec::new()
            .entity_type("Concept")
            .filter("year", FilterOperator::Ge, json!(2020))
            .relationship(RelationshipPattern::new("RELATED_TO", Direction::Both));
        let runner = CountingRunner::new(vec![]);

        let explained = opt.explain(&spec, &["SCAN e:Concept".to_string()]).unwrap();
        let outcome = opt.execute(&spec, &[], ExecuteOptions::default(), &runner).await.unwrap();

        assert_eq!(explained.cache_key, outcome.cache_key);
        assert!(explained.plan.contains("USING SCAN e:Concept"));
        assert_eq!(explained.parameters["f_year"], json!(2020));
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_plan_format_does_not_execute() {
        let opt = optimizer();
        let runner = CountingRunner::new(vec![]);

        let response = opt.query(&symbol_spec("alpha"), OutputFormat::Plan, &runner).await.unwrap();
        let QueryResponse::Plan { plan, parameters, .. } = response else {
            panic!("expected plan response");
        };
        assert!(plan.starts_with("MATCH (e:Symbol {name: $p_name})"));
        assert_eq!(parameters["p_name"], json!("alpha"));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_clear_and_reset() {
        let opt = optimizer();
        let runner = CountingRunner::new(vec![json!(1)]);
        opt.execute(&symbol_spec("alpha"), &[], ExecuteOptions::default(), &runner).await.unwrap();

        opt.clear_cache().await;
        opt.reset_metrics();

        assert_eq!(opt.cache_stats().await.size, 0);
        assert!(opt.metrics(10).is_empty());
    }
}
