/// 指数バックオフ+ジッター付き再試行遅延。
///
/// AWS推奨のFull Jitter戦略を実装します。
use std::time::Duration;

use rand::Rng;

/// ソースごとの再試行遅延ポリシー。
///
/// `base` は1回目の再試行上限、以降は指数的に伸び `cap` で頭打ちになる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelay {
    base: Duration,
    cap: Duration,
}

impl RetryDelay {
    /// 新しい再試行遅延ポリシーを作成する。
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// 指定された試行回数に対する遅延時間を計算する（Full Jitter戦略）。
    ///
    /// # Arguments
    /// * `attempt` - 完了した試行回数（0から開始、0は遅延なし）
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);

        // 指数バックオフ: base * 2^(attempt-1)、上限でキャップ
        let exponent = (attempt - 1).min(63);
        let exponential_ms = base_ms.saturating_mul(1_u64 << exponent);
        let capped_ms = exponential_ms.min(cap_ms);

        // Full Jitter: random(0, capped)
        let jittered_ms = if capped_ms > 0 {
            rand::rng().random_range(0..=capped_ms)
        } else {
            0
        };

        Duration::from_millis(jittered_ms)
    }
}
