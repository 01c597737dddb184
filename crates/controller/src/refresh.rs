//! Periodic water refresh: run the pump with every valve closed so the
//! reservoir (and the pH probe sitting in it) sees circulated solution.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::info;

use crate::params::Params;
use crate::relay::{Actuator, Relay};
use crate::telemetry::TelemetryClient;

pub struct WaterRefreshCycle {
    period: Duration,
    duration: Duration,
    next_due: Instant,
    valve_count: usize,
    actuator: Arc<dyn Actuator>,
    telemetry: Arc<TelemetryClient>,
}

impl WaterRefreshCycle {
    pub fn new(
        params: &Params,
        start: Instant,
        actuator: Arc<dyn Actuator>,
        telemetry: Arc<TelemetryClient>,
    ) -> Self {
        Self {
            period: params.refresh_period(),
            duration: params.refresh_duration(),
            next_due: start,
            valve_count: params.valve_count(),
            actuator,
            telemetry,
        }
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    /// Run if due.  Returns whether it ran.
    pub async fn tick(&mut self, now: Instant) -> bool {
        if now < self.next_due {
            return false;
        }
        self.run().await;
        true
    }

    /// Pump-only pulse.  Re-arms the timer from when it started.
    pub async fn run(&mut self) {
        self.next_due = Instant::now() + self.period;
        info!(duration_s = self.duration.as_secs_f64(), "water refresh start");
        self.report().await;

        self.actuator.set_relay(Relay::Pump, true);
        self.report().await;
        sleep(self.duration).await;
        self.actuator.set_relay(Relay::Pump, false);
        self.report().await;

        info!("water refresh complete");
    }

    async fn report(&self) {
        self.telemetry
            .report_relays(self.actuator.as_ref(), self.valve_count, 0)
            .await;
    }
}
