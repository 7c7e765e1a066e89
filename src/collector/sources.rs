/// ソース別アダプタ。
///
/// 各アダプタは外部データソースへの薄いHTTPグルーであり、ベンダー固有の
/// マークアップ解釈やセッション処理は上流のサービスに任せる。ここでの
/// 責務は構造化リクエストの発行と、トランスポート障害の分類のみ。
pub mod gis;
pub mod land_registry;
pub mod listings;
pub mod permit_registry;

use std::time::Duration;

use super::CollectorError;

/// reqwestのトランスポートエラーを収集エラー種別へ分類する。
///
/// - リクエストタイムアウト → `Timeout`
/// - 接続・名前解決の失敗 → `Unavailable`
/// - それ以外（ステータス・デコード等） → `Remote`
pub(crate) fn classify_transport_error(
    error: &reqwest::Error,
    budget: Duration,
) -> CollectorError {
    if error.is_timeout() {
        return CollectorError::Timeout(budget);
    }
    if error.is_connect() {
        return CollectorError::Unavailable(error.to_string());
    }
    CollectorError::Remote(error.to_string())
}
