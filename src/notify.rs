use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::record::{Completeness, RunRecord};

pub mod dispatcher;

/// 購読ルール。外部の購読者レジストリが所有し、ランごとに読み取り
/// スナップショットとして取得される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRule {
    pub rule_id: Uuid,
    pub label: String,
    pub criteria: RuleCriteria,
    pub channel: ChannelSpec,
}

/// ルールの一致条件。
///
/// 省略されたフィールドは「常に一致」として扱う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCriteria {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub require_complete: bool,
    #[serde(default)]
    pub min_succeeded: usize,
}

impl RuleCriteria {
    /// ランの結果がこの条件に一致するかを評価する。
    #[must_use]
    pub fn matches(&self, record: &RunRecord) -> bool {
        let params = record.params();

        if let Some(city) = &self.city {
            if !params.city().eq_ignore_ascii_case(city) {
                return false;
            }
        }
        if let Some(street) = &self.street {
            if !params.street().eq_ignore_ascii_case(street) {
                return false;
            }
        }
        if self.require_complete && record.completeness() != Completeness::Complete {
            return false;
        }
        record.succeeded_sources().len() >= self.min_succeeded
    }
}

/// 通知の配送先チャンネル。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelSpec {
    Webhook { endpoint: String },
    Slack { webhook_url: String },
}

impl ChannelSpec {
    /// メトリクスラベル用のチャンネル種別。
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Webhook { .. } => "webhook",
            Self::Slack { .. } => "slack",
        }
    }
}

/// 配送用に切り出したランの不変スナップショット。
///
/// 生きた `RunRecord` への参照を持たないため、配送の遅延や再試行が
/// オーケストレーターの結果と絡むことはない。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub asset_id: Uuid,
    pub address_line: String,
    pub completeness: Completeness,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl RunSnapshot {
    #[must_use]
    pub fn of(record: &RunRecord) -> Self {
        Self {
            asset_id: record.asset_id(),
            address_line: record.params().address_line(),
            completeness: record.completeness(),
            succeeded: record.succeeded_sources(),
            failed: record.failed_sources(),
            finished_at: record.finished_at(),
        }
    }
}

/// 1購読者への1回分の配送タスク。作成・配送・破棄のライフサイクルを
/// 持ち、オーケストレーターへの逆参照は持たない。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationTask {
    pub rule_id: Uuid,
    pub label: String,
    pub channel: ChannelSpec,
    pub snapshot: RunSnapshot,
}

impl NotificationTask {
    #[must_use]
    pub fn for_rule(rule: &SubscriberRule, record: &RunRecord) -> Self {
        Self {
            rule_id: rule.rule_id,
            label: rule.label.clone(),
            channel: rule.channel.clone(),
            snapshot: RunSnapshot::of(record),
        }
    }
}

/// 購読者レジストリのポート。ランごとに一度だけ読み取られる。
#[async_trait]
pub trait SubscriberRegistry: Send + Sync {
    /// # Errors
    /// レジストリへの問い合わせに失敗した場合はエラーを返す。
    async fn list_active_rules(&self) -> anyhow::Result<Vec<SubscriberRule>>;
}

/// 評価対象のルール集合からランに一致する配送タスクを構築する。
#[must_use]
pub fn matching_tasks(rules: &[SubscriberRule], record: &RunRecord) -> Vec<NotificationTask> {
    rules
        .iter()
        .filter(|rule| rule.criteria.matches(record))
        .map(|rule| NotificationTask::for_rule(rule, record))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::collector::{AssetParams, CollectorError};

    use super::*;

    fn record(succeed: &[&str], fail: &[&str]) -> RunRecord {
        let params = AssetParams::new(Uuid::new_v4(), "Dorpsstraat", None, "Utrecht")
            .expect("valid params");
        let mut results = BTreeMap::new();
        for source in succeed {
            results.insert(
                (*source).to_string(),
                Ok(crate::collector::SourcePayload::new()),
            );
        }
        for source in fail {
            results.insert(
                (*source).to_string(),
                Err(CollectorError::Remote("down".into())),
            );
        }
        let now = Utc::now();
        RunRecord::assemble(params, results, now, now)
    }

    fn rule(criteria: RuleCriteria) -> SubscriberRule {
        SubscriberRule {
            rule_id: Uuid::new_v4(),
            label: "watcher".into(),
            criteria,
            channel: ChannelSpec::Webhook {
                endpoint: "http://localhost:1/hook".into(),
            },
        }
    }

    #[test]
    fn empty_criteria_match_any_run() {
        let criteria = RuleCriteria {
            city: None,
            street: None,
            require_complete: false,
            min_succeeded: 0,
        };
        assert!(criteria.matches(&record(&[], &["gis"])));
    }

    #[test]
    fn city_criteria_are_case_insensitive() {
        let criteria = RuleCriteria {
            city: Some("utrecht".into()),
            street: None,
            require_complete: false,
            min_succeeded: 0,
        };
        assert!(criteria.matches(&record(&["gis"], &[])));

        let elsewhere = RuleCriteria {
            city: Some("Amsterdam".into()),
            ..criteria
        };
        assert!(!elsewhere.matches(&record(&["gis"], &[])));
    }

    #[test]
    fn require_complete_rejects_partial_runs() {
        let criteria = RuleCriteria {
            city: None,
            street: None,
            require_complete: true,
            min_succeeded: 0,
        };
        assert!(criteria.matches(&record(&["gis", "listings"], &[])));
        assert!(!criteria.matches(&record(&["gis"], &["listings"])));
    }

    #[test]
    fn min_succeeded_counts_successful_sources() {
        let criteria = RuleCriteria {
            city: None,
            street: None,
            require_complete: false,
            min_succeeded: 2,
        };
        assert!(criteria.matches(&record(&["gis", "listings"], &["permits"])));
        assert!(!criteria.matches(&record(&["gis"], &["permits"])));
    }

    #[test]
    fn matching_tasks_snapshot_the_run() {
        let rules = vec![
            rule(RuleCriteria {
                city: None,
                street: None,
                require_complete: false,
                min_succeeded: 0,
            }),
            rule(RuleCriteria {
                city: Some("Amsterdam".into()),
                street: None,
                require_complete: false,
                min_succeeded: 0,
            }),
        ];
        let record = record(&["gis"], &["listings"]);

        let tasks = matching_tasks(&rules, &record);

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].snapshot.succeeded, vec!["gis".to_string()]);
        assert_eq!(tasks[0].snapshot.failed, vec!["listings".to_string()]);
        assert_eq!(
            tasks[0].snapshot.completeness,
            Completeness::PartialFailure
        );
    }

    #[test]
    fn channel_spec_round_trips_through_json() {
        let channel = ChannelSpec::Slack {
            webhook_url: "https://hooks.example.com/T000/B000".into(),
        };
        let encoded = serde_json::to_value(&channel).expect("encodes");
        assert_eq!(encoded["type"], "slack");
        let decoded: ChannelSpec = serde_json::from_value(encoded).expect("decodes");
        assert_eq!(decoded, channel);
        assert_eq!(decoded.kind(), "slack");
    }
}
