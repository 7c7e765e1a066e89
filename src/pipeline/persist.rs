use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::store::dao::EnrichmentSink;

use super::record::RunRecord;

/// ペイロード内でこのキーに配列が載っていた場合、行単位の派生
/// エンティティとして保存する。キーがそのままエンティティ種別になる。
pub(crate) const DERIVED_ENTITY_KEYS: [&str; 2] = ["transactions", "permits"];

/// 永続化ステップの結果。
#[derive(Debug, Clone, Copy)]
pub(crate) struct PersistOutcome {
    pub(crate) record_id: Uuid,
    pub(crate) sources_stored: usize,
    pub(crate) entities_stored: usize,
}

/// ランレコードをシンクポート経由で保存する。
///
/// 失敗したソースはスキップされる。シンク呼び出しのエラーは呼び出し元
/// （ランループ）で捕捉され、ランの結果には影響しない。
pub(crate) async fn persist_run(
    sink: &dyn EnrichmentSink,
    record: &RunRecord,
) -> Result<PersistOutcome> {
    let record_id = sink
        .store_primary_record(record.params())
        .await
        .context("failed to store primary record")?;

    let mut sources_stored = 0;
    let mut entities_stored = 0;

    for (source, result) in record.results() {
        let Ok(payload) = result else {
            debug!(
                record_id = %record_id,
                source = %source,
                "skipping failed source during persistence"
            );
            continue;
        };

        sink.attach_source_result(record_id, source, payload)
            .await
            .with_context(|| format!("failed to attach result for source {source}"))?;
        sources_stored += 1;

        for key in DERIVED_ENTITY_KEYS {
            if let Some(Value::Array(rows)) = payload.get(key) {
                if rows.is_empty() {
                    continue;
                }
                sink.attach_derived_entity(record_id, key, rows)
                    .await
                    .with_context(|| format!("failed to attach {key} rows from {source}"))?;
                entities_stored += rows.len();
            }
        }
    }

    Ok(PersistOutcome {
        record_id,
        sources_stored,
        entities_stored,
    })
}
