use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Sentinel for "no usable pH reading".
pub const PH_UNKNOWN: f64 = -1.0;

/// Latest pH as seen by the acquisition task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhState {
    /// Either a reading known good within the staleness window, or
    /// [`PH_UNKNOWN`].
    pub last_reading: f64,
    pub last_good_at: Option<Instant>,
}

impl Default for PhState {
    fn default() -> Self {
        Self {
            last_reading: PH_UNKNOWN,
            last_good_at: None,
        }
    }
}

/// What a failed read falls back to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhFallback {
    /// The last good reading is still inside the staleness window.
    Cached(f64),
    Unknown,
}

/// Shared pH cell.  Written only by the acquisition task; read by the
/// balance scheduler and telemetry.
#[derive(Debug, Clone, Default)]
pub struct SharedPh(Arc<RwLock<PhState>>);

impl SharedPh {
    pub async fn latest(&self) -> f64 {
        self.0.read().await.last_reading
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> PhState {
        *self.0.read().await
    }

    pub async fn record_good(&self, reading: f64, at: Instant) {
        let mut st = self.0.write().await;
        st.last_reading = reading;
        st.last_good_at = Some(at);
    }

    /// Apply the staleness policy after a failed read at `now`.
    pub async fn record_failure(&self, now: Instant, window: Duration) -> PhFallback {
        let mut st = self.0.write().await;
        let fresh = st
            .last_good_at
            .is_some_and(|t| now.saturating_duration_since(t) < window);
        if fresh && st.last_reading != PH_UNKNOWN {
            PhFallback::Cached(st.last_reading)
        } else {
            st.last_reading = PH_UNKNOWN;
            PhFallback::Unknown
        }
    }
}
