use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::collector::{AssetParams, SourcePayload};
use crate::notify::{ChannelSpec, RuleCriteria, SubscriberRegistry, SubscriberRule};

use super::models::{DerivedEntityRow, EnrichmentRecordRow, SourceResultRow};

/// 永続化シンクのポート。
///
/// オーケストレーターはランごとにこの3操作だけを呼ぶ。スキーマと
/// トランザクション保証はシンク実装が所有する。
#[async_trait]
pub trait EnrichmentSink: Send + Sync {
    /// 主レコードを保存し、そのIDを返す。
    ///
    /// # Errors
    /// 保存に失敗した場合はエラーを返す。
    async fn store_primary_record(&self, params: &AssetParams) -> Result<Uuid>;

    /// ソース1件分の結果ペイロードを主レコードに紐付ける。
    ///
    /// # Errors
    /// 保存に失敗した場合はエラーを返す。
    async fn attach_source_result(
        &self,
        record_id: Uuid,
        source: &str,
        payload: &SourcePayload,
    ) -> Result<()>;

    /// ソースのペイロードから抽出した行集合（取引・許認可など）を
    /// 派生エンティティとして紐付ける。
    ///
    /// # Errors
    /// 保存に失敗した場合はエラーを返す。
    async fn attach_derived_entity(
        &self,
        record_id: Uuid,
        kind: &str,
        rows: &[Value],
    ) -> Result<()>;
}

/// Postgres実装。各操作は独立した1トランザクションで、冪等な
/// アップサートにより再実行が収束する。
#[derive(Debug, Clone)]
pub struct EnrichmentDao {
    pool: PgPool,
}

impl EnrichmentDao {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 接続性チェック（readinessプローブ用）。
    ///
    /// # Errors
    /// データベースに到達できない場合はエラーを返す。
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("enrich_db ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl EnrichmentSink for EnrichmentDao {
    async fn store_primary_record(&self, params: &AssetParams) -> Result<Uuid> {
        let row = EnrichmentRecordRow::new(params);

        sqlx::query(
            r"
            INSERT INTO enrichment_records
                (record_id, asset_id, street, house_number, city, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (record_id) DO NOTHING
            ",
        )
        .bind(row.record_id)
        .bind(row.asset_id)
        .bind(&row.street)
        .bind(&row.house_number)
        .bind(&row.city)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert enrichment record")?;

        Ok(row.record_id)
    }

    async fn attach_source_result(
        &self,
        record_id: Uuid,
        source: &str,
        payload: &SourcePayload,
    ) -> Result<()> {
        let row = SourceResultRow {
            record_id,
            source: source.to_string(),
            payload: Value::Object(payload.clone()),
            collected_at: Utc::now(),
        };

        sqlx::query(
            r"
            INSERT INTO enrichment_source_results
                (record_id, source, payload, collected_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (record_id, source)
            DO UPDATE SET payload = EXCLUDED.payload, collected_at = EXCLUDED.collected_at
            ",
        )
        .bind(row.record_id)
        .bind(&row.source)
        .bind(Json(&row.payload))
        .bind(row.collected_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to attach source result for {source}"))?;

        Ok(())
    }

    async fn attach_derived_entity(
        &self,
        record_id: Uuid,
        kind: &str,
        rows: &[Value],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin derived entity transaction")?;

        for (ordinal, value) in rows.iter().enumerate() {
            let row = DerivedEntityRow {
                record_id,
                kind: kind.to_string(),
                ordinal: i32::try_from(ordinal).unwrap_or(i32::MAX),
                row: value.clone(),
            };

            sqlx::query(
                r"
                INSERT INTO enrichment_derived_entities
                    (record_id, kind, ordinal, data)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (record_id, kind, ordinal)
                DO UPDATE SET data = EXCLUDED.data
                ",
            )
            .bind(row.record_id)
            .bind(&row.kind)
            .bind(row.ordinal)
            .bind(Json(&row.row))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to attach derived entity of kind {kind}"))?;
        }

        tx.commit()
            .await
            .context("failed to commit derived entities")?;

        Ok(())
    }
}

#[async_trait]
impl SubscriberRegistry for EnrichmentDao {
    async fn list_active_rules(&self) -> Result<Vec<SubscriberRule>> {
        let rows = sqlx::query(
            r"
            SELECT rule_id, label, criteria, channel
            FROM enrichment_subscribers
            WHERE active
            ORDER BY rule_id
            ",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load subscriber rules")?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let rule_id: Uuid = row.try_get("rule_id").context("rule_id column")?;
            let label: String = row.try_get("label").context("label column")?;
            let Json(criteria): Json<RuleCriteria> =
                row.try_get("criteria").context("criteria column")?;
            let Json(channel): Json<ChannelSpec> =
                row.try_get("channel").context("channel column")?;
            rules.push(SubscriberRule {
                rule_id,
                label,
                criteria,
                channel,
            });
        }

        Ok(rules)
    }
}
