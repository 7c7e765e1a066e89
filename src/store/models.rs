use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::collector::AssetParams;

/// enrichment_records テーブルの1行。
#[derive(Debug, Clone)]
pub(crate) struct EnrichmentRecordRow {
    pub(crate) record_id: Uuid,
    pub(crate) asset_id: Uuid,
    pub(crate) street: String,
    pub(crate) house_number: Option<String>,
    pub(crate) city: String,
    pub(crate) created_at: DateTime<Utc>,
}

impl EnrichmentRecordRow {
    /// ラン開始時のアセットパラメータから新しい主レコード行を起こす。
    pub(crate) fn new(params: &AssetParams) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            asset_id: params.asset_id(),
            street: params.street().to_string(),
            house_number: params.house_number().map(ToString::to_string),
            city: params.city().to_string(),
            created_at: Utc::now(),
        }
    }
}

/// enrichment_source_results テーブルの1行。
#[derive(Debug, Clone)]
pub(crate) struct SourceResultRow {
    pub(crate) record_id: Uuid,
    pub(crate) source: String,
    pub(crate) payload: Value,
    pub(crate) collected_at: DateTime<Utc>,
}

/// enrichment_derived_entities テーブルの1行。
///
/// `ordinal` はソース応答配列内での位置。`(record_id, kind, ordinal)` が
/// 主キーで、再実行時の添付は上書きに収束する。
#[derive(Debug, Clone)]
pub(crate) struct DerivedEntityRow {
    pub(crate) record_id: Uuid,
    pub(crate) kind: String,
    pub(crate) ordinal: i32,
    pub(crate) row: Value,
}
