//! Per-valve irrigation timers and the watering sequence.
//!
//! Every installed valve slot carries its own fixed-phase timer.  When a
//! slot comes due its next deadline is moved to `now + period` before
//! anything else happens, so a run's length never shifts the schedule.
//!
//! ## Watering sequence
//!
//! ```text
//! Idle ─▶ ValveOpening ─[back-pressure]─▶ PumpOn ─[duration]─▶ PumpOff
//!  ▲                                                              │
//!  └────────────[back-pressure]──── ValveClosing ◀─[back-pressure]┘
//! ```
//!
//! The sequence runs to completion inside `tick`; valves never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::params::{Params, MAX_VALVES};
use crate::records::{CycleEvent, PumpLog};
use crate::relay::{Actuator, Relay};
use crate::supervisor::PendingEvent;
use crate::telemetry::{timestamp, TelemetryClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValvePhase {
    Idle,
    ValveOpening,
    PumpOn,
    PumpOff,
    ValveClosing,
}

/// Schedule for one valve slot.
#[derive(Debug, Clone)]
pub struct ValveConfig {
    /// 1-based.
    pub slot: usize,
    pub enabled: bool,
    /// Zero means the slot is never evaluated.
    pub period: Duration,
    pub duration: Duration,
    pub next_due: Instant,
    pub phase: ValvePhase,
}

pub struct IrrigationScheduler {
    valves: Vec<ValveConfig>,
    valve_count: usize,
    back_pressure: Duration,
    /// Pulses counted during the sequence in progress (or the last one).
    run_flow: u64,
    flow_total: u64,
    actuator: Arc<dyn Actuator>,
    telemetry: Arc<TelemetryClient>,
    pump_log: Option<Arc<PumpLog>>,
}

impl IrrigationScheduler {
    /// Every slot with a non-zero period is due at `start`.
    pub fn new(
        params: &Params,
        start: Instant,
        actuator: Arc<dyn Actuator>,
        telemetry: Arc<TelemetryClient>,
    ) -> Self {
        let valves = (1..=MAX_VALVES)
            .map(|slot| {
                let v = params.valve(slot);
                ValveConfig {
                    slot,
                    enabled: v.active,
                    period: v.period,
                    duration: v.duration,
                    next_due: start,
                    phase: ValvePhase::Idle,
                }
            })
            .collect();
        Self {
            valves,
            valve_count: params.valve_count(),
            back_pressure: params.pump_delay(),
            run_flow: 0,
            flow_total: 0,
            actuator,
            telemetry,
            pump_log: None,
        }
    }

    /// Record a row at the start and end of every watering sequence.
    pub fn with_pump_log(mut self, log: Arc<PumpLog>) -> Self {
        self.pump_log = Some(log);
        self
    }

    #[cfg(test)]
    pub fn valves(&self) -> &[ValveConfig] {
        &self.valves
    }

    /// Pulses counted during watering since startup.
    #[cfg(test)]
    pub fn flow_total(&self) -> u64 {
        self.flow_total
    }

    /// Evaluate every slot in order, running the sequence for each enabled
    /// slot that is due.  Returns how many sequences ran.
    pub async fn tick(&mut self) -> usize {
        let mut ran = 0;
        for index in 0..self.valves.len() {
            let now = Instant::now();
            let valve = &mut self.valves[index];
            if valve.period.is_zero() || now < valve.next_due {
                continue;
            }
            valve.next_due = now + valve.period;
            if !valve.enabled {
                debug!(valve = valve.slot, "valve due but disabled");
                continue;
            }
            self.run_sequence(index).await;
            ran += 1;
        }
        ran
    }

    /// Soonest deadline among enabled valves, if any are enabled.
    pub fn soonest_due(&self) -> Option<Instant> {
        self.valves
            .iter()
            .filter(|v| v.enabled && !v.period.is_zero())
            .map(|v| v.next_due)
            .min()
    }

    /// Upcoming events for the supervisor's log, installed slots only.
    pub fn pending(&self) -> Vec<PendingEvent> {
        self.valves
            .iter()
            .filter(|v| !v.period.is_zero())
            .map(|v| (format!("valve {}", v.slot), v.enabled.then_some(v.next_due)))
            .collect()
    }

    async fn run_sequence(&mut self, index: usize) {
        let slot = self.valves[index].slot;
        let duration = self.valves[index].duration;
        let valve = Relay::Valve(slot);

        let leaked = self.actuator.read_and_reset_flow_count();
        if leaked > 0 {
            warn!(valve = slot, pulses = leaked, "flow counted while no valve was running");
        }
        info!(valve = slot, duration_s = duration.as_secs_f64(), "watering start");
        self.record(slot, CycleEvent::Start, leaked).await;
        self.run_flow = 0;
        self.report().await;

        self.step(index, ValvePhase::ValveOpening, valve, true).await;
        sleep(self.back_pressure).await;

        self.step(index, ValvePhase::PumpOn, Relay::Pump, true).await;
        sleep(duration).await;

        self.step(index, ValvePhase::PumpOff, Relay::Pump, false).await;
        sleep(self.back_pressure).await;

        self.step(index, ValvePhase::ValveClosing, valve, false).await;
        sleep(self.back_pressure).await;

        self.run_flow += self.actuator.read_and_reset_flow_count();
        self.flow_total += self.run_flow;
        self.valves[index].phase = ValvePhase::Idle;
        info!(valve = slot, pulses = self.run_flow, flow_total = self.flow_total, "watering complete");
        self.record(slot, CycleEvent::End, self.run_flow).await;
        self.report().await;
    }

    async fn step(&mut self, index: usize, phase: ValvePhase, relay: Relay, on: bool) {
        self.valves[index].phase = phase;
        self.run_flow += self.actuator.read_and_reset_flow_count();
        debug!(valve = self.valves[index].slot, phase = ?self.valves[index].phase, flow = self.run_flow);
        self.actuator.set_relay(relay, on);
        self.report().await;
    }

    /// Publishes the flow of the current sequence.
    async fn report(&self) {
        self.telemetry
            .report_relays(self.actuator.as_ref(), self.valve_count, self.run_flow)
            .await;
    }

    async fn record(&self, slot: usize, event: CycleEvent, flow: u64) {
        let Some(log) = &self.pump_log else {
            return;
        };
        if let Err(e) = log.append(&timestamp(), slot, event, flow).await {
            warn!("failed to write pump record: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::RecordingActuator;

    const TOLERANCE: Duration = Duration::from_millis(5);

    fn params(valves: u32) -> Params {
        Params {
            number_of_water_valves: valves,
            pump_delay: 1.0,
            valve1_time: 180.0,
            valve1_duration: 10.0,
            valve2_time: 300.0,
            valve2_duration: 20.0,
            ..Params::default()
        }
    }

    fn scheduler(p: &Params) -> (IrrigationScheduler, Arc<RecordingActuator>) {
        let act = Arc::new(RecordingActuator::default());
        let telemetry = Arc::new(
            TelemetryClient::with_endpoints("https://x.invalid", "https://x.invalid", false).unwrap(),
        );
        let sched = IrrigationScheduler::new(p, Instant::now(), act.clone(), telemetry);
        (sched, act)
    }

    fn close(a: Duration, b: Duration) -> bool {
        let diff = if a > b { a - b } else { b - a };
        diff < TOLERANCE
    }

    // -- sequence -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn sequence_order_and_timing() {
        let (mut sched, act) = scheduler(&params(1));
        let t0 = Instant::now();
        assert_eq!(sched.tick().await, 1);

        let ev = act.timed_events();
        let order: Vec<(Relay, bool)> = ev.iter().map(|(r, on, _)| (*r, *on)).collect();
        assert_eq!(
            order,
            vec![
                (Relay::Valve(1), true),
                (Relay::Pump, true),
                (Relay::Pump, false),
                (Relay::Valve(1), false),
            ]
        );
        assert!(close(ev[1].2 - ev[0].2, Duration::from_secs(1)));
        assert!(close(ev[2].2 - ev[1].2, Duration::from_secs(10)));
        assert!(close(ev[3].2 - ev[2].2, Duration::from_secs(1)));
        assert!(close(t0.elapsed(), Duration::from_secs(13)));
        assert_eq!(sched.valves()[0].phase, ValvePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn valves_run_one_after_another() {
        let (mut sched, act) = scheduler(&params(2));
        assert_eq!(sched.tick().await, 2);
        let ev = act.events();
        assert_eq!(ev[3], (Relay::Valve(1), false));
        assert_eq!(ev[4], (Relay::Valve(2), true));
        assert!(!act.relay_states().is_on(Relay::Pump));
    }

    // -- schedule -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn runs_are_exactly_one_period_apart() {
        let (mut sched, act) = scheduler(&params(1));
        let mut starts = Vec::new();
        for _ in 0..3 {
            tokio::time::sleep_until(sched.valves()[0].next_due).await;
            act.clear();
            sched.tick().await;
            starts.push(act.timed_events()[0].2);
        }
        for pair in starts.windows(2) {
            assert!(close(pair[1] - pair[0], Duration::from_secs(180)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn next_due_is_set_before_running() {
        let (mut sched, _act) = scheduler(&params(1));
        let t0 = Instant::now();
        sched.tick().await;
        let next = sched.valves()[0].next_due;
        assert!(close(next - t0, Duration::from_secs(180)));
    }

    #[tokio::test(start_paused = true)]
    async fn not_due_does_nothing() {
        let (mut sched, act) = scheduler(&params(1));
        sched.tick().await;
        act.clear();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(sched.tick().await, 0);
        assert!(act.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_slots_never_leave_idle() {
        let (mut sched, act) = scheduler(&params(0));
        for _ in 0..10 {
            assert_eq!(sched.tick().await, 0);
            tokio::time::advance(Duration::from_secs(3600)).await;
        }
        assert!(act.events().is_empty());
        assert!(sched.valves().iter().all(|v| v.phase == ValvePhase::Idle));
        assert_eq!(sched.soonest_due(), None);
        assert!(sched.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_valve_keeps_phase_but_does_not_run() {
        let mut p = params(1);
        p.valve1_active = false;
        let (mut sched, act) = scheduler(&p);
        let t0 = Instant::now();
        assert_eq!(sched.tick().await, 0);
        assert!(act.events().is_empty());
        assert_eq!(sched.valves()[0].next_due, t0 + Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn soonest_due_ignores_disabled_valves() {
        let mut p = params(2);
        p.valve1_active = false;
        let (mut sched, _act) = scheduler(&p);
        let t0 = Instant::now();
        assert_eq!(sched.soonest_due(), Some(t0));

        sched.tick().await;
        // valve 2 ran at t0 (valve 1 skipped without waiting)
        assert_eq!(sched.soonest_due(), Some(t0 + Duration::from_secs(300)));
    }

    // -- flow ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn flow_during_run_is_totalled_and_leaks_are_discarded() {
        let (mut sched, act) = scheduler(&params(1));
        for _ in 0..3 {
            act.flow.pulse();
        }
        let during = Arc::clone(&act);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            for _ in 0..7 {
                during.flow.pulse();
            }
        });

        sched.tick().await;
        assert_eq!(sched.flow_total(), 7);
    }

    // -- pump log -----------------------------------------------------------

    fn pulse_during_run(act: &Arc<RecordingActuator>, pulses: u32) {
        let during = Arc::clone(act);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            for _ in 0..pulses {
                during.flow.pulse();
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn pump_log_rows_carry_leak_and_per_run_flow() {
        let path = std::env::temp_dir().join(format!("hydro-pump-{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let (sched, act) = scheduler(&params(1));
        let mut sched = sched.with_pump_log(Arc::new(PumpLog::new(&path)));

        act.flow.pulse();
        pulse_during_run(&act, 7);
        sched.tick().await;

        tokio::time::sleep_until(sched.valves()[0].next_due).await;
        pulse_during_run(&act, 4);
        sched.tick().await;

        let text = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<Vec<&str>> = text.lines().skip(1).map(|l| l.split(',').skip(1).collect()).collect();
        assert_eq!(
            rows,
            vec![
                vec!["1", "start", "1"],
                vec!["1", "end", "7"],
                vec!["1", "start", "0"],
                vec!["1", "end", "4"],
            ]
        );
        assert_eq!(sched.flow_total(), 11);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn unwritable_pump_log_does_not_stop_watering() {
        let (sched, act) = scheduler(&params(1));
        let mut sched = sched.with_pump_log(Arc::new(PumpLog::new("/nonexistent-dir/pump.csv")));
        assert_eq!(sched.tick().await, 1);
        assert_eq!(act.events().len(), 4);
    }
}
