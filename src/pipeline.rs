use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    collector::{
        AssetParams, Collector, CollectorError, CollectorResult, CollectorSpec,
        executor::BoundedExecutor,
        sources::{
            gis::GisCollector, land_registry::LandRegistryCollector, listings::ListingsCollector,
            permit_registry::PermitRegistryCollector,
        },
    },
    config::Config,
    notify::{
        self, SubscriberRegistry,
        dispatcher::{HttpDeliverer, NotificationDispatcher},
    },
    observability::metrics::Metrics,
    store::dao::EnrichmentSink,
};

pub(crate) mod persist;
pub mod record;

use record::RunRecord;

/// 1ソース分の実行ポリシーとアダプタの束。
struct SourceBinding {
    spec: CollectorSpec,
    collector: Arc<dyn Collector>,
}

/// Core enrichment orchestrator: one run for one asset across all
/// configured collectors.
///
/// A run is never aborted by a single source's failure. Collector
/// invocations execute on worker tasks under bounded concurrency, but their
/// results are consumed back on this run loop only, so the run record needs
/// no locking.
pub struct EnrichmentPipeline {
    sources: Vec<SourceBinding>,
    executor: BoundedExecutor,
    sink: Arc<dyn EnrichmentSink>,
    subscribers: Arc<dyn SubscriberRegistry>,
    dispatcher: NotificationDispatcher,
    metrics: Arc<Metrics>,
    collector_concurrency: usize,
}

/// Builder pattern for constructing [`EnrichmentPipeline`].
pub struct EnrichmentPipelineBuilder {
    sources: Vec<SourceBinding>,
    sink: Option<Arc<dyn EnrichmentSink>>,
    subscribers: Option<Arc<dyn SubscriberRegistry>>,
    dispatcher: Option<NotificationDispatcher>,
    metrics: Option<Arc<Metrics>>,
    collector_concurrency: usize,
}

impl EnrichmentPipeline {
    /// 設定から本番構成（4ソース + HTTP配送）のパイプラインを組み立てる。
    ///
    /// # Errors
    /// いずれかのソースクライアントまたは配送クライアントの構築に
    /// 失敗した場合はエラーを返す。
    pub fn new(
        config: &Config,
        sink: Arc<dyn EnrichmentSink>,
        subscribers: Arc<dyn SubscriberRegistry>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let cap = config.backoff_cap_ms();
        let deliverer = Arc::new(HttpDeliverer::new()?);
        let dispatcher = NotificationDispatcher::new(deliverer, Arc::clone(&metrics));

        Ok(Self::builder()
            .with_source(
                CollectorSpec::from_settings("listings", config.listings(), cap),
                Arc::new(ListingsCollector::new(config.listings())?),
            )
            .with_source(
                CollectorSpec::from_settings("gis", config.gis(), cap),
                Arc::new(GisCollector::new(config.gis())?),
            )
            .with_source(
                CollectorSpec::from_settings("land_registry", config.land_registry(), cap),
                Arc::new(LandRegistryCollector::new(config.land_registry())?),
            )
            .with_source(
                CollectorSpec::from_settings("permit_registry", config.permit_registry(), cap),
                Arc::new(PermitRegistryCollector::new(config.permit_registry())?),
            )
            .with_collector_concurrency(config.collector_max_concurrency().get())
            .with_sink(sink)
            .with_subscribers(subscribers)
            .with_dispatcher(dispatcher)
            .with_metrics(metrics)
            .build())
    }

    #[must_use]
    pub fn builder() -> EnrichmentPipelineBuilder {
        EnrichmentPipelineBuilder::new()
    }

    /// Execute one enrichment run for one asset.
    ///
    /// The caller always receives a [`RunRecord`]; partial source failures
    /// degrade its classification but never surface as errors. Persistence
    /// and notification failures are recovered here and only logged.
    #[instrument(skip_all, fields(asset_id = %params.asset_id()))]
    pub async fn run(&self, params: AssetParams) -> RunRecord {
        let started_wall = Utc::now();
        let started = Instant::now();
        self.metrics.run_started();
        debug!(
            address = %params.address_line(),
            source_count = self.sources.len(),
            "enrichment run started"
        );

        // 購読ルールはランの先頭で一度だけスナップショットする。以降に
        // 追加されたルールはこのランには影響しない。
        let rules = match self.subscribers.list_active_rules().await {
            Ok(rules) => rules,
            Err(error) => {
                warn!(
                    error = ?error,
                    "subscriber registry unavailable, run continues without notifications"
                );
                Vec::new()
            }
        };

        let results = self.collect_all(&params).await;
        let record = RunRecord::assemble(params, results, started_wall, Utc::now());
        let completeness = record.completeness();
        self.metrics
            .record_run(completeness.as_str(), started.elapsed());
        info!(
            completeness = %completeness,
            succeeded = record.succeeded_sources().len(),
            failed = record.failed_sources().len(),
            "collection finished"
        );

        match persist::persist_run(self.sink.as_ref(), &record).await {
            Ok(outcome) => debug!(
                record_id = %outcome.record_id,
                sources_stored = outcome.sources_stored,
                entities_stored = outcome.entities_stored,
                "run persisted"
            ),
            Err(error) => {
                self.metrics.record_persist_failure();
                warn!(
                    error = ?error,
                    "persistence sink failed, run result is unaffected"
                );
            }
        }

        let tasks = notify::matching_tasks(&rules, &record);
        if !tasks.is_empty() {
            let summary = self.dispatcher.submit(tasks).await;
            debug!(
                delivered = summary.delivered,
                failed = summary.failed,
                "notifications dispatched"
            );
        }

        self.metrics.run_finished();
        record
    }

    /// 全ソースを有界並行で起動し、結果をソース名のマップに集約する。
    async fn collect_all(&self, params: &AssetParams) -> BTreeMap<String, CollectorResult> {
        let semaphore = Arc::new(Semaphore::new(self.collector_concurrency));
        let mut handles = Vec::with_capacity(self.sources.len());

        for binding in &self.sources {
            let spec = binding.spec.clone();
            let collector = Arc::clone(&binding.collector);
            let executor = self.executor.clone();
            let params = params.clone();
            let semaphore = Arc::clone(&semaphore);

            handles.push((
                binding.spec.name(),
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("collector semaphore should not be closed");
                    executor.invoke(&spec, collector, &params).await
                }),
            ));
        }

        // 取り込みはランループ上でのみ行う。1ソースの遅延・失敗は他の
        // ソースの結果に影響しない。
        let mut results = BTreeMap::new();
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(
                        source = name,
                        error = ?join_error,
                        "collector task failed to join"
                    );
                    Err(CollectorError::Remote("collector task panicked".into()))
                }
            };
            results.insert(name.to_string(), result);
        }
        results
    }
}

impl EnrichmentPipelineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            sink: None,
            subscribers: None,
            dispatcher: None,
            metrics: None,
            collector_concurrency: 4,
        }
    }

    #[must_use]
    pub fn with_source(mut self, spec: CollectorSpec, collector: Arc<dyn Collector>) -> Self {
        self.sources.push(SourceBinding { spec, collector });
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EnrichmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_subscribers(mut self, subscribers: Arc<dyn SubscriberRegistry>) -> Self {
        self.subscribers = Some(subscribers);
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_collector_concurrency(mut self, concurrency: usize) -> Self {
        self.collector_concurrency = concurrency.max(1);
        self
    }

    /// # Panics
    /// シンク・レジストリ・ディスパッチャ・メトリクスのいずれかが
    /// 未設定の場合はパニックする。
    #[must_use]
    pub fn build(self) -> EnrichmentPipeline {
        let metrics = self
            .metrics
            .unwrap_or_else(|| panic!("metrics must be configured before build"));

        EnrichmentPipeline {
            sources: self.sources,
            executor: BoundedExecutor::new(Arc::clone(&metrics)),
            sink: self
                .sink
                .unwrap_or_else(|| panic!("sink must be configured before build")),
            subscribers: self
                .subscribers
                .unwrap_or_else(|| panic!("subscriber registry must be configured before build")),
            dispatcher: self
                .dispatcher
                .unwrap_or_else(|| panic!("dispatcher must be configured before build")),
            metrics,
            collector_concurrency: self.collector_concurrency,
        }
    }
}

impl Default for EnrichmentPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use prometheus::Registry;
    use serde_json::Value;
    use uuid::Uuid;

    use crate::collector::SourcePayload;
    use crate::notify::dispatcher::NotificationDeliverer;
    use crate::notify::{ChannelSpec, NotificationTask, RuleCriteria, SubscriberRule};
    use crate::pipeline::record::Completeness;
    use crate::util::retry::RetryDelay;

    use super::*;

    struct InstantCollector;

    #[async_trait]
    impl Collector for InstantCollector {
        fn validate(&self, _params: &AssetParams) -> bool {
            true
        }

        async fn collect(&self, _params: AssetParams) -> CollectorResult {
            let mut payload = SourcePayload::new();
            payload.insert("ok".into(), serde_json::json!(true));
            Ok(payload)
        }
    }

    struct HangingCollector;

    #[async_trait]
    impl Collector for HangingCollector {
        fn validate(&self, _params: &AssetParams) -> bool {
            true
        }

        async fn collect(&self, _params: AssetParams) -> CollectorResult {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(SourcePayload::new())
        }
    }

    struct FailingCollector;

    #[async_trait]
    impl Collector for FailingCollector {
        fn validate(&self, _params: &AssetParams) -> bool {
            true
        }

        async fn collect(&self, _params: AssetParams) -> CollectorResult {
            Err(CollectorError::Unavailable("registry is down".into()))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        primary_records: AtomicUsize,
        attached_sources: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EnrichmentSink for MemorySink {
        async fn store_primary_record(&self, _params: &AssetParams) -> Result<Uuid> {
            self.primary_records.fetch_add(1, Ordering::SeqCst);
            Ok(Uuid::new_v4())
        }

        async fn attach_source_result(
            &self,
            _record_id: Uuid,
            source: &str,
            _payload: &SourcePayload,
        ) -> Result<()> {
            self.attached_sources
                .lock()
                .expect("sink log lock")
                .push(source.to_string());
            Ok(())
        }

        async fn attach_derived_entity(
            &self,
            _record_id: Uuid,
            _kind: &str,
            _rows: &[Value],
        ) -> Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EnrichmentSink for FailingSink {
        async fn store_primary_record(&self, _params: &AssetParams) -> Result<Uuid> {
            anyhow::bail!("database is unreachable")
        }

        async fn attach_source_result(
            &self,
            _record_id: Uuid,
            _source: &str,
            _payload: &SourcePayload,
        ) -> Result<()> {
            anyhow::bail!("database is unreachable")
        }

        async fn attach_derived_entity(
            &self,
            _record_id: Uuid,
            _kind: &str,
            _rows: &[Value],
        ) -> Result<()> {
            anyhow::bail!("database is unreachable")
        }
    }

    struct StaticRegistry {
        rules: Vec<SubscriberRule>,
    }

    #[async_trait]
    impl SubscriberRegistry for StaticRegistry {
        async fn list_active_rules(&self) -> Result<Vec<SubscriberRule>> {
            Ok(self.rules.clone())
        }
    }

    struct BrokenRegistry;

    #[async_trait]
    impl SubscriberRegistry for BrokenRegistry {
        async fn list_active_rules(&self) -> Result<Vec<SubscriberRule>> {
            anyhow::bail!("registry query failed")
        }
    }

    #[derive(Default)]
    struct RecordingDeliverer {
        delivered: Mutex<Vec<Uuid>>,
        fail_for: Option<Uuid>,
    }

    #[async_trait]
    impl NotificationDeliverer for RecordingDeliverer {
        async fn deliver(&self, task: &NotificationTask) -> Result<()> {
            if self.fail_for == Some(task.rule_id) {
                anyhow::bail!("channel rejected delivery");
            }
            self.delivered
                .lock()
                .expect("delivery log lock")
                .push(task.rule_id);
            Ok(())
        }
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(&Arc::new(Registry::new())).expect("metrics register"))
    }

    fn spec(name: &'static str, timeout_ms: u64) -> CollectorSpec {
        CollectorSpec::new(
            name,
            Duration::from_millis(timeout_ms),
            0,
            RetryDelay::new(Duration::ZERO, Duration::ZERO),
        )
    }

    fn params() -> AssetParams {
        AssetParams::new(Uuid::new_v4(), "Dorpsstraat", Some("12".into()), "Utrecht")
            .expect("valid params")
    }

    fn match_all() -> RuleCriteria {
        RuleCriteria {
            city: None,
            street: None,
            require_complete: false,
            min_succeeded: 0,
        }
    }

    fn rule(rule_id: Uuid) -> SubscriberRule {
        SubscriberRule {
            rule_id,
            label: "watcher".into(),
            criteria: match_all(),
            channel: ChannelSpec::Webhook {
                endpoint: "http://localhost:1/hook".into(),
            },
        }
    }

    fn pipeline_with(
        sources: Vec<(CollectorSpec, Arc<dyn Collector>)>,
        sink: Arc<dyn EnrichmentSink>,
        subscribers: Arc<dyn SubscriberRegistry>,
        deliverer: Arc<dyn NotificationDeliverer>,
        metrics: Arc<Metrics>,
    ) -> EnrichmentPipeline {
        let mut builder = EnrichmentPipeline::builder();
        for (spec, collector) in sources {
            builder = builder.with_source(spec, collector);
        }
        builder
            .with_sink(sink)
            .with_subscribers(subscribers)
            .with_dispatcher(NotificationDispatcher::new(deliverer, Arc::clone(&metrics)))
            .with_metrics(metrics)
            .build()
    }

    #[tokio::test]
    async fn one_blocked_source_never_poisons_the_others() {
        let pipeline = pipeline_with(
            vec![
                (spec("listings", 40), Arc::new(HangingCollector)),
                (spec("gis", 500), Arc::new(InstantCollector)),
            ],
            Arc::new(MemorySink::default()),
            Arc::new(StaticRegistry { rules: Vec::new() }),
            Arc::new(RecordingDeliverer::default()),
            metrics(),
        );

        let started = Instant::now();
        let record = pipeline.run(params()).await;

        assert!(
            started.elapsed() < Duration::from_secs(5),
            "run must be bounded by the timeout budget, not the hang"
        );
        assert_eq!(record.results().len(), 2);
        assert!(record.results()["gis"].is_ok(), "gis result must be present and correct");
        assert!(matches!(
            record.results()["listings"],
            Err(CollectorError::Timeout(_))
        ));
        assert_eq!(record.completeness(), Completeness::PartialFailure);
    }

    #[tokio::test]
    async fn successful_sources_are_persisted_and_failed_ones_skipped() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = pipeline_with(
            vec![
                (spec("gis", 500), Arc::new(InstantCollector)),
                (spec("land_registry", 500), Arc::new(FailingCollector)),
            ],
            Arc::clone(&sink) as Arc<dyn EnrichmentSink>,
            Arc::new(StaticRegistry { rules: Vec::new() }),
            Arc::new(RecordingDeliverer::default()),
            metrics(),
        );

        let record = pipeline.run(params()).await;

        assert_eq!(record.completeness(), Completeness::PartialFailure);
        assert_eq!(sink.primary_records.load(Ordering::SeqCst), 1);
        assert_eq!(
            *sink.attached_sources.lock().expect("sink log lock"),
            vec!["gis".to_string()]
        );
    }

    #[tokio::test]
    async fn sink_failure_never_fails_the_run() {
        let pipeline = pipeline_with(
            vec![(spec("gis", 500), Arc::new(InstantCollector))],
            Arc::new(FailingSink),
            Arc::new(StaticRegistry { rules: Vec::new() }),
            Arc::new(RecordingDeliverer::default()),
            metrics(),
        );

        let record = pipeline.run(params()).await;

        assert_eq!(record.completeness(), Completeness::Complete);
    }

    #[tokio::test]
    async fn broken_registry_degrades_to_no_notifications() {
        let deliverer = Arc::new(RecordingDeliverer::default());
        let pipeline = pipeline_with(
            vec![(spec("gis", 500), Arc::new(InstantCollector))],
            Arc::new(MemorySink::default()),
            Arc::new(BrokenRegistry),
            Arc::clone(&deliverer) as Arc<dyn NotificationDeliverer>,
            metrics(),
        );

        let record = pipeline.run(params()).await;

        assert_eq!(record.completeness(), Completeness::Complete);
        assert!(deliverer.delivered.lock().expect("delivery log lock").is_empty());
    }

    #[tokio::test]
    async fn matching_subscribers_are_notified_despite_one_failing_channel() {
        let failing = Uuid::new_v4();
        let healthy_a = Uuid::new_v4();
        let healthy_b = Uuid::new_v4();
        let deliverer = Arc::new(RecordingDeliverer {
            delivered: Mutex::new(Vec::new()),
            fail_for: Some(failing),
        });
        let pipeline = pipeline_with(
            vec![(spec("gis", 500), Arc::new(InstantCollector))],
            Arc::new(MemorySink::default()),
            Arc::new(StaticRegistry {
                rules: vec![rule(healthy_a), rule(failing), rule(healthy_b)],
            }),
            Arc::clone(&deliverer) as Arc<dyn NotificationDeliverer>,
            metrics(),
        );

        let record = pipeline.run(params()).await;

        assert_eq!(record.completeness(), Completeness::Complete);
        let mut delivered = deliverer
            .delivered
            .lock()
            .expect("delivery log lock")
            .clone();
        delivered.sort();
        let mut expected = vec![healthy_a, healthy_b];
        expected.sort();
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn rerunning_with_identical_behavior_is_idempotent() {
        let metrics = metrics();
        let pipeline = pipeline_with(
            vec![
                (spec("gis", 500), Arc::new(InstantCollector)),
                (spec("land_registry", 500), Arc::new(FailingCollector)),
            ],
            Arc::new(MemorySink::default()),
            Arc::new(StaticRegistry { rules: Vec::new() }),
            Arc::new(RecordingDeliverer::default()),
            metrics,
        );

        let first = pipeline.run(params()).await;
        let second = pipeline.run(params()).await;

        assert_eq!(first.completeness(), second.completeness());
        let first_keys: Vec<_> = first.results().keys().cloned().collect();
        let second_keys: Vec<_> = second.results().keys().cloned().collect();
        assert_eq!(first_keys, second_keys);
    }
}
