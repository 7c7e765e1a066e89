use std::sync::Arc;
use std::time::Instant;

use tokio::time::{sleep, timeout};
use tracing::{Instrument, error, info_span, warn};

use crate::observability::metrics::Metrics;

use super::{AssetParams, Collector, CollectorError, CollectorResult, CollectorSpec};

/// Runs a single collector call under a hard wall-clock timeout and a fixed
/// retry budget, reporting every outcome to the metrics sink.
///
/// A timed-out worker is abandoned, not cancelled: the spawned task keeps
/// running against the external source, but its join handle is dropped, so
/// its eventual result is discarded and never reaches the run record or the
/// counters a second time.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    metrics: Arc<Metrics>,
}

impl BoundedExecutor {
    #[must_use]
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    /// Invoke `collector` under the policy of `spec`.
    ///
    /// Returns the first successful payload, or the failure of the last
    /// attempt once the budget is exhausted. Never panics and never lets a
    /// collector fault escape as anything but a [`CollectorError`].
    pub async fn invoke(
        &self,
        spec: &CollectorSpec,
        collector: Arc<dyn Collector>,
        params: &AssetParams,
    ) -> CollectorResult {
        if !collector.validate(params) {
            // Validate失敗は試行前に短絡する。レイテンシ観測は行わない。
            warn!(
                source = spec.name(),
                asset_id = %params.asset_id(),
                "collector rejected params during validation"
            );
            self.metrics.record_collector_failure(spec.name());
            return Err(CollectorError::InvalidInput(format!(
                "{} rejected asset params",
                spec.name()
            )));
        }

        let mut last_failure: Option<CollectorError> = None;

        for attempt in 0..=spec.retries() {
            match self
                .run_attempt(spec, Arc::clone(&collector), params.clone(), attempt)
                .await
            {
                Ok(payload) => {
                    self.metrics.record_collector_success(spec.name());
                    return Ok(payload);
                }
                Err(failure) => {
                    warn!(
                        source = spec.name(),
                        attempt,
                        kind = %failure.kind(),
                        error = %failure,
                        "collector attempt failed"
                    );
                    last_failure = Some(failure);

                    if attempt < spec.retries() {
                        self.metrics.record_collector_retry(spec.name());
                        let delay = spec.retry_delay().delay_for_attempt(attempt + 1);
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                    }
                }
            }
        }

        self.metrics.record_collector_failure(spec.name());
        Err(last_failure
            .unwrap_or_else(|| CollectorError::Remote("no attempts were executed".into())))
    }

    async fn run_attempt(
        &self,
        spec: &CollectorSpec,
        collector: Arc<dyn Collector>,
        params: AssetParams,
        attempt: u32,
    ) -> CollectorResult {
        let span = info_span!("collector_attempt", source = spec.name(), attempt);

        async {
            let started = Instant::now();
            let worker = tokio::spawn(async move { collector.collect(params).await });
            let raced = timeout(spec.timeout(), worker).await;
            self.metrics
                .observe_collector_latency(spec.name(), started.elapsed());

            match raced {
                // Deadline won: drop the handle, the worker keeps running
                // detached and its eventual result is discarded.
                Err(_elapsed) => Err(CollectorError::Timeout(spec.timeout())),
                Ok(Err(join_error)) => {
                    let message = if join_error.is_panic() {
                        "collector worker panicked".to_string()
                    } else {
                        format!("collector worker failed to join: {join_error}")
                    };
                    error!(source = spec.name(), attempt, message, "collector fault");
                    Err(CollectorError::Remote(message))
                }
                Ok(Ok(result)) => result,
            }
        }
        .instrument(span)
        .await
    }
}
