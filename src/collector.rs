use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::SourceSettings;
use crate::util::retry::RetryDelay;

pub mod executor;
pub mod sources;

/// Source-specific result payload, opaque to the orchestrator.
pub type SourcePayload = serde_json::Map<String, serde_json::Value>;

/// Outcome of a single collector invocation.
pub type CollectorResult = Result<SourcePayload, CollectorError>;

/// Immutable input to one enrichment run.
///
/// Constructed through [`AssetParams::new`], which enforces the structural
/// invariant that at least one of street and city is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetParams {
    asset_id: Uuid,
    street: String,
    house_number: Option<String>,
    city: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("asset params must carry a non-empty street or city")]
pub struct InvalidAssetParams;

impl AssetParams {
    /// # Errors
    /// Returns [`InvalidAssetParams`] when both street and city are empty
    /// after trimming.
    pub fn new(
        asset_id: Uuid,
        street: impl Into<String>,
        house_number: Option<String>,
        city: impl Into<String>,
    ) -> Result<Self, InvalidAssetParams> {
        let street = street.into().trim().to_string();
        let city = city.into().trim().to_string();
        if street.is_empty() && city.is_empty() {
            return Err(InvalidAssetParams);
        }
        let house_number = house_number
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(Self {
            asset_id,
            street,
            house_number,
            city,
        })
    }

    #[must_use]
    pub fn asset_id(&self) -> Uuid {
        self.asset_id
    }

    #[must_use]
    pub fn street(&self) -> &str {
        &self.street
    }

    #[must_use]
    pub fn house_number(&self) -> Option<&str> {
        self.house_number.as_deref()
    }

    #[must_use]
    pub fn city(&self) -> &str {
        &self.city
    }

    /// 住所1行表記（ログ・通知スナップショット用）。
    #[must_use]
    pub fn address_line(&self) -> String {
        let mut line = String::new();
        if !self.street.is_empty() {
            line.push_str(&self.street);
            if let Some(number) = &self.house_number {
                line.push(' ');
                line.push_str(number);
            }
        }
        if !self.city.is_empty() {
            if !line.is_empty() {
                line.push_str(", ");
            }
            line.push_str(&self.city);
        }
        line
    }
}

/// Static per-source execution policy.
#[derive(Debug, Clone)]
pub struct CollectorSpec {
    name: &'static str,
    timeout: Duration,
    retries: u32,
    retry_delay: RetryDelay,
}

impl CollectorSpec {
    #[must_use]
    pub fn new(name: &'static str, timeout: Duration, retries: u32, retry_delay: RetryDelay) -> Self {
        debug_assert!(!timeout.is_zero(), "collector timeout must be positive");
        Self {
            name,
            timeout,
            retries,
            retry_delay,
        }
    }

    /// 設定値から実行ポリシーを組み立てる。
    #[must_use]
    pub fn from_settings(name: &'static str, settings: &SourceSettings, backoff_cap_ms: u64) -> Self {
        Self::new(
            name,
            settings.timeout,
            settings.retries,
            RetryDelay::new(settings.retry_delay, Duration::from_millis(backoff_cap_ms)),
        )
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    #[must_use]
    pub fn retry_delay(&self) -> RetryDelay {
        self.retry_delay
    }
}

/// Failure classification for a collector invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Timeout,
    RemoteError,
    Unavailable,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Timeout => "timeout",
            Self::RemoteError => "remote_error",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collector signals inability to produce data as a value, never as an
/// unhandled fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("collection timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote source error: {0}")]
    Remote(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl CollectorError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Remote(_) => ErrorKind::RemoteError,
            Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

/// Uniform contract every external data source satisfies.
///
/// `collect` owns its params, shares no mutable state across invocations and
/// is safe to run on any worker task. Implementations classify their own
/// transport failures; panics are folded into `RemoteError` at the executor
/// boundary.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Cheap synchronous precondition check, invoked before any attempt.
    fn validate(&self, params: &AssetParams) -> bool;

    /// The potentially slow, externally-rate-limited call.
    ///
    /// # Errors
    /// Returns a classified [`CollectorError`] when the source cannot
    /// produce data.
    async fn collect(&self, params: AssetParams) -> CollectorResult;
}
