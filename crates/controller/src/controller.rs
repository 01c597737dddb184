//! The main scheduling loop.
//!
//! One pass, in fixed order: valve timers, pH balance, water refresh,
//! remote config check, supervisor check.  Then sleep for the poll interval.
//! Anything long-running in a pass (a watering sequence, a dosing pulse)
//! simply delays the rest of that pass.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::acquisition::AcquisitionParts;
use crate::irrigation::IrrigationScheduler;
use crate::params::ParameterStore;
use crate::ph_balance::{PhBalanceScheduler, TickOutcome};
use crate::records::PumpLog;
use crate::refresh::WaterRefreshCycle;
use crate::relay::Actuator;
use crate::remote::RemoteConfigClient;
use crate::state::SharedPh;
use crate::supervisor::{PendingEvent, Supervisor};
use crate::telemetry::TelemetryClient;

/// Sleep between scheduler passes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// New parameters were persisted; the process should restart to pick
    /// them up.
    ParametersChanged,
}

pub struct Controller {
    store: ParameterStore,
    irrigation: IrrigationScheduler,
    ph_balance: PhBalanceScheduler,
    refresh: WaterRefreshCycle,
    remote: RemoteConfigClient,
    supervisor: Supervisor,
}

impl Controller {
    /// Build every scheduler from the store's current parameters, with all
    /// timers anchored at `start`.
    pub fn new(
        store: ParameterStore,
        start: Instant,
        actuator: Arc<dyn Actuator>,
        telemetry: Arc<TelemetryClient>,
        remote: RemoteConfigClient,
        ph: SharedPh,
        acquisition: AcquisitionParts,
    ) -> Self {
        let params = store.snapshot();
        let irrigation =
            IrrigationScheduler::new(&params, start, Arc::clone(&actuator), Arc::clone(&telemetry));
        let ph_balance = PhBalanceScheduler::new(&params, start, Arc::clone(&actuator), ph);
        let refresh = WaterRefreshCycle::new(&params, start, actuator, telemetry);
        let supervisor = Supervisor::new(Box::new(move |alive| acquisition.spawn(alive)));
        Self {
            store,
            irrigation,
            ph_balance,
            refresh,
            remote,
            supervisor,
        }
    }

    /// Record watering cycles to `log`.
    pub fn with_pump_log(mut self, log: Arc<PumpLog>) -> Self {
        self.irrigation = self.irrigation.with_pump_log(log);
        self
    }

    /// Run until parameters change.  The acquisition task is stopped when
    /// this future is dropped.
    pub async fn run(mut self) -> Result<Exit> {
        info!("initial water refresh before sensor start");
        self.refresh.run().await;
        self.supervisor.start();

        loop {
            if let Some(exit) = self.pass().await {
                return Ok(exit);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn pass(&mut self) -> Option<Exit> {
        let ran = self.irrigation.tick().await;
        if ran > 0 {
            debug!(ran, "valve sequences complete");
        }

        let outcome = self
            .ph_balance
            .tick(Instant::now(), self.irrigation.soonest_due())
            .await;
        if let TickOutcome::Ran(action) = outcome {
            debug!(?action, "pH balance ran");
        }

        self.refresh.tick(Instant::now()).await;

        if let Some(exit) = self.check_remote().await {
            return Some(exit);
        }

        let pending = self.pending();
        self.supervisor.check(Instant::now(), &pending);
        None
    }

    /// Changes are staged on a copy and only become live once persisted, so a
    /// failed write is retried on the next check.
    async fn check_remote(&mut self) -> Option<Exit> {
        let candidate = self.remote.poll(Instant::now()).await?;
        let mut staged = self.store.clone();
        match staged.validate_and_apply(&candidate) {
            Ok(false) => {
                debug!("remote parameters unchanged");
                None
            }
            Ok(true) => match staged.persist() {
                Ok(()) => {
                    self.store = staged;
                    warn!("parameters changed remotely; restarting to apply them");
                    Some(Exit::ParametersChanged)
                }
                Err(e) => {
                    error!("failed to persist remote parameters, keeping current schedule: {e:#}");
                    None
                }
            },
            Err(e) => {
                error!("failed to apply remote parameters: {e:#}");
                None
            }
        }
    }

    fn pending(&self) -> Vec<PendingEvent> {
        let mut pending = self.irrigation.pending();
        pending.push(("pH balance".into(), self.ph_balance.next_due()));
        pending.push(("water refresh".into(), Some(self.refresh.next_due())));
        pending.push(("remote config".into(), self.remote.next_due()));
        pending
    }
}

// ===========================================================================
// Tests
// ===========================================================================
