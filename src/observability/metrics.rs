/// Prometheusメトリクス定義。
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramVec, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry,
};
use std::sync::Arc;
use std::time::Duration;

/// メトリクスコレクター。
///
/// コレクター系の計測は `source` ラベル、通知系は `channel` ラベルで分類する。
#[derive(Debug, Clone)]
pub struct Metrics {
    collector_success: CounterVec,
    collector_failure: CounterVec,
    collector_retries: CounterVec,
    collector_latency: HistogramVec,

    runs_total: CounterVec,
    run_duration: Histogram,
    persist_failures: Counter,

    notification_delivered: CounterVec,
    notification_failure: CounterVec,

    active_runs: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同一レジストリへ二重登録した場合は [`prometheus::Error`] を返す。
    pub fn new(registry: &Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            collector_success: register_counter_vec_with_registry!(
                "collector_success_total",
                "Total number of successful collector invocations",
                &["source"],
                registry
            )?,
            collector_failure: register_counter_vec_with_registry!(
                "collector_failure_total",
                "Total number of collector invocations that exhausted all attempts",
                &["source"],
                registry
            )?,
            collector_retries: register_counter_vec_with_registry!(
                "collector_retries_total",
                "Total number of collector attempt retries",
                &["source"],
                registry
            )?,
            collector_latency: register_histogram_vec_with_registry!(
                "collector_latency_seconds",
                "Latency of individual collector attempts",
                &["source"],
                registry
            )?,
            runs_total: register_counter_vec_with_registry!(
                "enrich_runs_total",
                "Total number of enrichment runs by completeness outcome",
                &["outcome"],
                registry
            )?,
            run_duration: register_histogram_with_registry!(
                "enrich_run_duration_seconds",
                "Duration of entire enrichment runs",
                registry
            )?,
            persist_failures: register_counter_with_registry!(
                "enrich_persist_failures_total",
                "Number of persistence sink calls that failed",
                registry
            )?,
            notification_delivered: register_counter_vec_with_registry!(
                "notification_delivered_total",
                "Number of notifications delivered by channel kind",
                &["channel"],
                registry
            )?,
            notification_failure: register_counter_vec_with_registry!(
                "notification_failure_total",
                "Number of notification deliveries that failed by channel kind",
                &["channel"],
                registry
            )?,
            active_runs: register_gauge_with_registry!(
                "enrich_active_runs",
                "Number of currently active enrichment runs",
                registry
            )?,
        })
    }

    pub fn record_collector_success(&self, source: &str) {
        self.collector_success.with_label_values(&[source]).inc();
    }

    pub fn record_collector_failure(&self, source: &str) {
        self.collector_failure.with_label_values(&[source]).inc();
    }

    pub fn record_collector_retry(&self, source: &str) {
        self.collector_retries.with_label_values(&[source]).inc();
    }

    pub fn observe_collector_latency(&self, source: &str, elapsed: Duration) {
        self.collector_latency
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_run(&self, outcome: &str, elapsed: Duration) {
        self.runs_total.with_label_values(&[outcome]).inc();
        self.run_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.inc();
    }

    pub fn record_notification_delivered(&self, channel: &str) {
        self.notification_delivered
            .with_label_values(&[channel])
            .inc();
    }

    pub fn record_notification_failure(&self, channel: &str) {
        self.notification_failure
            .with_label_values(&[channel])
            .inc();
    }

    pub fn run_started(&self) {
        self.active_runs.inc();
    }

    pub fn run_finished(&self) {
        self.active_runs.dec();
    }

    #[cfg(test)]
    pub(crate) fn collector_success_value(&self, source: &str) -> f64 {
        self.collector_success.with_label_values(&[source]).get()
    }

    #[cfg(test)]
    pub(crate) fn collector_failure_value(&self, source: &str) -> f64 {
        self.collector_failure.with_label_values(&[source]).get()
    }

    #[cfg(test)]
    pub(crate) fn collector_latency_samples(&self, source: &str) -> u64 {
        self.collector_latency
            .with_label_values(&[source])
            .get_sample_count()
    }

    #[cfg(test)]
    pub(crate) fn notification_failure_value(&self, channel: &str) -> f64 {
        self.notification_failure.with_label_values(&[channel]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_counted_independently() {
        let registry = Arc::new(Registry::new());
        let metrics = Metrics::new(&registry).expect("metrics register");

        metrics.record_collector_success("listings");
        metrics.record_collector_success("listings");
        metrics.record_collector_failure("gis");
        metrics.observe_collector_latency("listings", Duration::from_millis(120));

        assert!((metrics.collector_success_value("listings") - 2.0).abs() < f64::EPSILON);
        assert!((metrics.collector_success_value("gis")).abs() < f64::EPSILON);
        assert!((metrics.collector_failure_value("gis") - 1.0).abs() < f64::EPSILON);
        assert_eq!(metrics.collector_latency_samples("listings"), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Arc::new(Registry::new());
        let _metrics = Metrics::new(&registry).expect("first registration succeeds");

        assert!(
            Metrics::new(&registry).is_err(),
            "second registration against the same registry must fail"
        );
    }
}
