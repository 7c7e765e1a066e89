use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Tracing サブスクライバを一度だけ初期化する。
///
/// `OTEL_EXPORTER_OTLP_ENDPOINT` 環境変数が設定されている場合、OTLP
/// エクスポーターを使用してスパンを送信する。設定がない場合は標準の
/// fmtレイヤーのみ（コンソール出力）となる。どちらを選んでも収集動作
/// そのものは変わらず、スパンの送信先だけが変わる。
///
/// # Errors
/// サブスクライバの初期化に失敗した場合はエラーを返す。
pub fn init() -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).json();

        let otel_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        if let Some(endpoint) = otel_endpoint {
            match init_tracer(&endpoint) {
                Ok(tracer) => {
                    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt_layer)
                        .with(otel_layer)
                        .try_init()
                        .map_err(|e: tracing_subscriber::util::TryInitError| {
                            Error::msg(e.to_string())
                        })?;
                    info!(
                        otel_enabled = true,
                        endpoint = %endpoint,
                        "tracing initialized with OpenTelemetry"
                    );
                }
                Err(e) => {
                    // OTLP初期化に失敗してもトレーシング自体は止めない
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt_layer)
                        .try_init()
                        .map_err(|e: tracing_subscriber::util::TryInitError| {
                            Error::msg(e.to_string())
                        })?;
                    info!(
                        otel_enabled = false,
                        error = %e,
                        "tracing initialized without OpenTelemetry (init failed)"
                    );
                }
            }
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e: tracing_subscriber::util::TryInitError| Error::msg(e.to_string()))?;
            info!(otel_enabled = false, "standard tracing initialized");
        }

        Ok::<(), Error>(())
    })?;
    Ok(())
}

/// OTLPエクスポーター経由でOpenTelemetryトレーサーを初期化する。
///
/// サンプリング比率は `OTEL_SAMPLING_RATIO` 環境変数で制御（デフォルト1.0）。
///
/// # Errors
/// トレーサーの初期化に失敗した場合はエラーを返す。
fn init_tracer(endpoint: &str) -> Result<SdkTracer> {
    let sampling_ratio = std::env::var("OTEL_SAMPLING_RATIO")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(1.0);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", "enrich-worker"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer("enrich-worker");

    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}
