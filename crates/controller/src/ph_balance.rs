//! Periodic pH correction with irrigation conflict avoidance.
//!
//! A balance that comes due within `ph_conflict_margin` of the next enabled
//! valve cycle is pushed back by the retry interval instead of running.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::params::Params;
use crate::relay::{Actuator, Relay};
use crate::state::{SharedPh, PH_UNKNOWN};

/// Readings outside this range are treated as probe glitches.
const PLAUSIBLE_MIN: f64 = 2.0;
const PLAUSIBLE_MAX: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceAction {
    /// Reading implausible; nothing actuated.
    OutOfSpec,
    Raised,
    Lowered,
    InBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    NotDue,
    Deferred,
    Ran(BalanceAction),
}

pub struct PhBalanceScheduler {
    enabled: bool,
    ideal: f64,
    spread: f64,
    pulse: Duration,
    interval: Duration,
    retry: Duration,
    margin: Duration,
    next_due: Instant,
    actuator: Arc<dyn Actuator>,
    ph: SharedPh,
}

impl PhBalanceScheduler {
    /// First balance is due one full interval after `start`.
    pub fn new(params: &Params, start: Instant, actuator: Arc<dyn Actuator>, ph: SharedPh) -> Self {
        let interval = params.ph_balance_interval();
        Self {
            enabled: params.balance_ph,
            ideal: params.ideal_ph,
            spread: params.ph_spread,
            pulse: params.ph_pulse(),
            interval,
            retry: params.ph_retry_interval(),
            margin: params.ph_conflict_margin(),
            next_due: start + interval,
            actuator,
            ph,
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.enabled.then_some(self.next_due)
    }

    pub async fn tick(&mut self, now: Instant, soonest_valve_due: Option<Instant>) -> TickOutcome {
        if !self.enabled {
            return TickOutcome::Disabled;
        }
        if now < self.next_due {
            return TickOutcome::NotDue;
        }

        if let Some(due) = soonest_valve_due {
            let lead = due.saturating_duration_since(now);
            if lead <= self.margin {
                self.next_due = now + self.retry;
                warn!(
                    valve_in_s = lead.as_secs(),
                    retry_in_s = self.retry.as_secs(),
                    "pH balance deferred: valve cycle imminent"
                );
                return TickOutcome::Deferred;
            }
        }

        self.next_due = now + self.interval;
        let reading = self.ph.latest().await;
        TickOutcome::Ran(self.adjust_ph(reading).await)
    }

    /// Dose toward the band around the ideal.  At most one of pH-up /
    /// pH-down is pulsed per call.
    pub async fn adjust_ph(&self, reading: f64) -> BalanceAction {
        if reading == PH_UNKNOWN {
            error!("pH unknown; skipping balance");
            return BalanceAction::OutOfSpec;
        }
        if !(PLAUSIBLE_MIN..=PLAUSIBLE_MAX).contains(&reading) {
            error!(reading, "pH reading out of spec; skipping balance");
            return BalanceAction::OutOfSpec;
        }

        let lower = self.ideal - self.spread;
        let upper = self.ideal + self.spread;
        if reading < lower {
            info!(reading, lower, "pH low; dosing pH up");
            self.pulse(Relay::PhUp).await;
            BalanceAction::Raised
        } else if reading > upper {
            info!(reading, upper, "pH high; dosing pH down");
            self.pulse(Relay::PhDown).await;
            BalanceAction::Lowered
        } else {
            info!(reading, lower, upper, "pH within band");
            BalanceAction::InBand
        }
    }

    async fn pulse(&self, relay: Relay) {
        self.actuator.set_relay(relay, true);
        sleep(self.pulse).await;
        self.actuator.set_relay(relay, false);
    }
}
