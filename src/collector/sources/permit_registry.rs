/// 都市計画当局の許認可登録簿クライアント。
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use crate::collector::{
    AssetParams, Collector, CollectorError, CollectorResult, SourcePayload,
    sources::classify_transport_error,
};
use crate::config::SourceSettings;

/// 建築許可・用途変更などの計画文書を照会するコレクター。
#[derive(Debug, Clone)]
pub struct PermitRegistryCollector {
    client: Client,
    base_url: Url,
    budget: std::time::Duration,
}

impl PermitRegistryCollector {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合はエラーを返す。
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.timeout)
            .build()
            .context("failed to build permit registry HTTP client")?;

        let base_url =
            Url::parse(&settings.base_url).context("invalid permit registry base URL")?;

        Ok(Self {
            client,
            base_url,
            budget: settings.timeout,
        })
    }
}

#[async_trait]
impl Collector for PermitRegistryCollector {
    fn validate(&self, params: &AssetParams) -> bool {
        !params.city().is_empty()
    }

    async fn collect(&self, params: AssetParams) -> CollectorResult {
        let mut url = self
            .base_url
            .join("v1/permits")
            .map_err(|e| CollectorError::InvalidInput(e.to_string()))?;

        {
            let mut query_pairs = url.query_pairs_mut();
            query_pairs.append_pair("city", params.city());
            if !params.street().is_empty() {
                query_pairs.append_pair("street", params.street());
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
                "permit registry returned status {status}"
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            CollectorError::Remote(format!("undecodable permit registry response: {e}"))
        })?;

        let permits = body
            .get("permits")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();

        debug!(
            asset_id = %params.asset_id(),
            permit_count = permits.len(),
            "permit registry query completed"
        );

        let mut payload = SourcePayload::new();
        payload.insert("permits".into(), serde_json::Value::Array(permits));
        Ok(payload)
    }
}
