/// 政府取引登記簿（売買履歴・鑑定評価）の照会クライアント。
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use crate::collector::{
    AssetParams, Collector, CollectorError, CollectorResult, SourcePayload,
    sources::classify_transport_error,
};
use crate::config::SourceSettings;

/// 取引履歴と直近の鑑定評価額を照会するコレクター。
///
/// 返却される `transactions` 配列は永続化時に派生エンティティとして
/// 行単位で保存される。
#[derive(Debug, Clone)]
pub struct LandRegistryCollector {
    client: Client,
    base_url: Url,
    budget: std::time::Duration,
}

impl LandRegistryCollector {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合はエラーを返す。
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.timeout)
            .build()
            .context("failed to build land registry HTTP client")?;

        let base_url = Url::parse(&settings.base_url).context("invalid land registry base URL")?;

        Ok(Self {
            client,
            base_url,
            budget: settings.timeout,
        })
    }
}

#[async_trait]
impl Collector for LandRegistryCollector {
    fn validate(&self, params: &AssetParams) -> bool {
        // 登記簿は通り名でインデックスされている
        !params.street().is_empty()
    }

    async fn collect(&self, params: AssetParams) -> CollectorResult {
        let mut url = self
            .base_url
            .join("v1/transactions")
            .map_err(|e| CollectorError::InvalidInput(e.to_string()))?;

        {
            let mut query_pairs = url.query_pairs_mut();
            query_pairs.append_pair("street", params.street());
            if !params.city().is_empty() {
                query_pairs.append_pair("city", params.city());
            }
            if let Some(number) = params.house_number() {
                query_pairs.append_pair("house_number", number);
            }
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, self.budget))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectorError::Remote(format!(
                "land registry returned status {status}"
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            CollectorError::Remote(format!("undecodable land registry response: {e}"))
        })?;

        let transactions = body
            .get("transactions")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();

        debug!(
            asset_id = %params.asset_id(),
            transaction_count = transactions.len(),
            "land registry query completed"
        );

        let mut payload = SourcePayload::new();
        payload.insert(
            "transactions".into(),
            serde_json::Value::Array(transactions),
        );
        if let Some(appraisal) = body.get("latest_appraisal") {
            payload.insert("latest_appraisal".into(), appraisal.clone());
        }
        Ok(payload)
    }
}
