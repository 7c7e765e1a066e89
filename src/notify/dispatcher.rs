//! Concurrent notification delivery, isolated from the collection path.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::observability::metrics::Metrics;

use super::{ChannelSpec, NotificationTask};

/// 同時配送ワーカー数の上限。タスク数がこれ未満の場合はタスク数まで縮む。
pub const MAX_DELIVERY_WORKERS: usize = 4;

/// 通知配送のポート。実装はチャンネルごとの配送手段を隠蔽する。
#[async_trait]
pub trait NotificationDeliverer: Send + Sync {
    /// # Errors
    /// 配送に失敗した場合はエラーを返す。失敗は呼び出し側で個別に
    /// 捕捉され、他のタスクの配送へは影響しない。
    async fn deliver(&self, task: &NotificationTask) -> Result<()>;
}

/// Webhook/Slack チャンネルへHTTP POSTで配送する本番実装。
#[derive(Debug, Clone)]
pub struct HttpDeliverer {
    client: Client,
}

impl HttpDeliverer {
    /// # Errors
    /// HTTPクライアントの構築に失敗した場合はエラーを返す。
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(3))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build notification HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationDeliverer for HttpDeliverer {
    async fn deliver(&self, task: &NotificationTask) -> Result<()> {
        match &task.channel {
            ChannelSpec::Webhook { endpoint } => {
                self.client
                    .post(endpoint)
                    .json(&task.snapshot)
                    .send()
                    .await
                    .context("webhook request failed")?
                    .error_for_status()
                    .context("webhook endpoint returned error status")?;
            }
            ChannelSpec::Slack { webhook_url } => {
                let text = format!(
                    "Enrichment for {} finished: {} ({} ok / {} failed)",
                    task.snapshot.address_line,
                    task.snapshot.completeness,
                    task.snapshot.succeeded.len(),
                    task.snapshot.failed.len(),
                );
                self.client
                    .post(webhook_url)
                    .json(&serde_json::json!({ "text": text }))
                    .send()
                    .await
                    .context("slack webhook request failed")?
                    .error_for_status()
                    .context("slack webhook returned error status")?;
            }
        }
        Ok(())
    }
}

/// `submit` 1回分の配送結果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
}

/// 配送タスクをチャンネルへ届けるディスパッチャ。
///
/// 収集パスと直列化しないことが契約：1チャンネルの失敗・遅延が他の
/// 配送やラン本体を妨げてはならない。`submit` はすべてのタスクの試行が
/// 完了した時点で返る（配送自体は並列）。
pub struct NotificationDispatcher {
    deliverer: Arc<dyn NotificationDeliverer>,
    metrics: Arc<Metrics>,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(deliverer: Arc<dyn NotificationDeliverer>, metrics: Arc<Metrics>) -> Self {
        Self { deliverer, metrics }
    }

    /// すべてのタスクを配送し、試行が終わるまで待つ。決して失敗を
    /// 伝播しない。
    pub async fn submit(&self, tasks: Vec<NotificationTask>) -> DispatchSummary {
        match tasks.len() {
            0 => DispatchSummary::default(),
            // 単一タスクはプールを立てずにインライン配送する
            1 => {
                let mut summary = DispatchSummary::default();
                if let Some(task) = tasks.into_iter().next() {
                    self.deliver_one(&task, &mut summary).await;
                }
                summary
            }
            n => {
                let workers = MAX_DELIVERY_WORKERS.min(n);
                let semaphore = Arc::new(Semaphore::new(workers));
                let mut handles = Vec::with_capacity(n);

                for task in tasks {
                    let deliverer = Arc::clone(&self.deliverer);
                    let semaphore = Arc::clone(&semaphore);
                    handles.push(tokio::spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .expect("dispatch semaphore should not be closed");
                        let kind = task.channel.kind();
                        let outcome = deliverer.deliver(&task).await;
                        (task, kind, outcome)
                    }));
                }

                // すべての配送試行の完了を待つ（同期ジョインポイント）
                let outcomes = futures::future::join_all(handles).await;

                let mut summary = DispatchSummary::default();
                for outcome in outcomes {
                    match outcome {
                        Ok((task, kind, Ok(()))) => {
                            debug!(
                                rule_id = %task.rule_id,
                                channel = kind,
                                "notification delivered"
                            );
                            self.metrics.record_notification_delivered(kind);
                            summary.delivered += 1;
                        }
                        Ok((task, kind, Err(error))) => {
                            warn!(
                                rule_id = %task.rule_id,
                                channel = kind,
                                error = ?error,
                                "notification delivery failed"
                            );
                            self.metrics.record_notification_failure(kind);
                            summary.failed += 1;
                        }
                        Err(join_error) => {
                            warn!(error = ?join_error, "notification delivery task panicked");
                            self.metrics.record_notification_failure("unknown");
                            summary.failed += 1;
                        }
                    }
                }
                summary
            }
        }
    }

    async fn deliver_one(&self, task: &NotificationTask, summary: &mut DispatchSummary) {
        let kind = task.channel.kind();
        match self.deliverer.deliver(task).await {
            Ok(()) => {
                debug!(rule_id = %task.rule_id, channel = kind, "notification delivered");
                self.metrics.record_notification_delivered(kind);
                summary.delivered += 1;
            }
            Err(error) => {
                warn!(
                    rule_id = %task.rule_id,
                    channel = kind,
                    error = ?error,
                    "notification delivery failed"
                );
                self.metrics.record_notification_failure(kind);
                summary.failed += 1;
            }
        }
    }
}
