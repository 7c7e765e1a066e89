/// 自治体GISサービスの区画照会クライアント。
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use crate::collector::{
    AssetParams, Collector, CollectorError, CollectorResult, SourcePayload,
    sources::classify_transport_error,
};
use crate::config::SourceSettings;

/// 区画ジオメトリとゾーニング属性を照会するコレクター。
///
/// GISサーバーはWFS風のフィーチャ照会を提供する。ジオメトリの中身は
/// このワーカーにとって不透明で、そのまま記録に添付される。
#[derive(Debug, Clone)]
pub struct GisCollector {
    client: Client,
    base_url: Url,
    budget: std::time::Duration,
}

impl GisCollector {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合はエラーを返す。
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.timeout)
            .build()
            .context("failed to build GIS HTTP client")?;

        let base_url = Url::parse(&settings.base_url).context("invalid GIS base URL")?;

        Ok(Self {
            client,
            base_url,
            budget: settings.timeout,
        })
    }
}

#[async_trait]
impl Collector for GisCollector {
    fn validate(&self, params: &AssetParams) -> bool {
        // フィーチャ照会は市単位のレイヤーを跨げない
        !params.city().is_empty()
    }

    async fn collect(&self, params: AssetParams) -> CollectorResult {
        let mut url = self
            .base_url
            .join("features")
            .map_err(|e| CollectorError::InvalidInput(e.to_string()))?;

        {
            let mut query_pairs = url.query_pairs_mut();
            query_pairs.append_pair("layer", "parcels");
            query_pairs.append_pair("city", params.city());
            if !params.street().is_empty() {
                query_pairs.append_pair("street", params.street());
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
                "GIS feature query returned status {status}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CollectorError::Remote(format!("undecodable GIS response: {e}")))?;

        let features = body
            .get("features")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();

        debug!(
            asset_id = %params.asset_id(),
            feature_count = features.len(),
            "GIS feature query completed"
        );

        let mut payload = SourcePayload::new();
        payload.insert("feature_count".into(), serde_json::json!(features.len()));
        payload.insert("features".into(), serde_json::Value::Array(features));
        if let Some(crs) = body.get("crs") {
            payload.insert("crs".into(), crs.clone());
        }
        Ok(payload)
    }
}
