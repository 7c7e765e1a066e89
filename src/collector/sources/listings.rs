/// 物件リスティングサイトの検索APIクライアント。
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use crate::collector::{
    AssetParams, Collector, CollectorError, CollectorResult, SourcePayload,
    sources::classify_transport_error,
};
use crate::config::SourceSettings;

/// リスティング検索を担当するコレクター。
///
/// 上流のリスティングプロキシは住所検索を受け取り、正規化済みの
/// 物件オブジェクトの配列を返す。DOM解析はプロキシ側の責務。
#[derive(Debug, Clone)]
pub struct ListingsCollector {
    client: Client,
    base_url: Url,
    budget: std::time::Duration,
}

impl ListingsCollector {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合はエラーを返す。
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.timeout)
            .build()
            .context("failed to build listings HTTP client")?;

        let base_url = Url::parse(&settings.base_url).context("invalid listings base URL")?;

        Ok(Self {
            client,
            base_url,
            budget: settings.timeout,
        })
    }
}

#[async_trait]
impl Collector for ListingsCollector {
    fn validate(&self, params: &AssetParams) -> bool {
        // 番地なしでは検索結果が広すぎるため、通りと市の両方を要求する
        !params.street().is_empty() && !params.city().is_empty()
    }

    async fn collect(&self, params: AssetParams) -> CollectorResult {
        let mut url = self
            .base_url
            .join("v1/listings/search")
            .map_err(|e| CollectorError::InvalidInput(e.to_string()))?;

        {
            let mut query_pairs = url.query_pairs_mut();
            query_pairs.append_pair("street", params.street());
            query_pairs.append_pair("city", params.city());
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
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::Remote(format!(
                "listings search returned status {status}: {body}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CollectorError::Remote(format!("undecodable listings response: {e}")))?;

        let listings = body
            .get("listings")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();

        debug!(
            asset_id = %params.asset_id(),
            listing_count = listings.len(),
            "listings search completed"
        );

        let mut payload = SourcePayload::new();
        payload.insert("listing_count".into(), serde_json::json!(listings.len()));
        payload.insert("listings".into(), serde_json::Value::Array(listings));
        Ok(payload)
    }
}
