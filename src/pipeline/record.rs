use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::collector::{AssetParams, CollectorResult};

/// Completeness classification of one enrichment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// Every source reported success.
    Complete,
    /// At least one source failed and at least one succeeded.
    PartialFailure,
    /// Every source failed (and at least one source ran).
    TotalFailure,
}

impl Completeness {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::PartialFailure => "partial_failure",
            Self::TotalFailure => "total_failure",
        }
    }
}

impl fmt::Display for Completeness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 1回のランの集約結果。
///
/// ランループだけが書き込み、全ソースの報告が揃った時点で不変になる。
/// 結果はソース名をキーとするマップであり、完了順序は観測されない。
#[derive(Debug, Clone)]
pub struct RunRecord {
    params: AssetParams,
    results: BTreeMap<String, CollectorResult>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl RunRecord {
    /// 全ソースの報告が揃った時点でレコードを組み立てる。
    #[must_use]
    pub fn assemble(
        params: AssetParams,
        results: BTreeMap<String, CollectorResult>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            params,
            results,
            started_at,
            finished_at,
        }
    }

    #[must_use]
    pub fn asset_id(&self) -> Uuid {
        self.params.asset_id()
    }

    #[must_use]
    pub fn params(&self) -> &AssetParams {
        &self.params
    }

    #[must_use]
    pub fn results(&self) -> &BTreeMap<String, CollectorResult> {
        &self.results
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// 成功したソース名の一覧（キー順）。
    #[must_use]
    pub fn succeeded_sources(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// 失敗したソース名の一覧（キー順）。
    #[must_use]
    pub fn failed_sources(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// ランの完全性分類を導出する。
    ///
    /// ソースが空のランは「全ソース成功」が空虚に成立するため
    /// `Complete` に分類される。
    #[must_use]
    pub fn completeness(&self) -> Completeness {
        let failed = self.results.values().filter(|r| r.is_err()).count();
        if failed == 0 {
            Completeness::Complete
        } else if failed == self.results.len() {
            Completeness::TotalFailure
        } else {
            Completeness::PartialFailure
        }
    }
}
