//! Relay board (pump, valves, pH dosing) and the flow-meter pulse counter.
//!
//! The `gpio` feature gates the real rppal driver; without it, a mock board
//! tracks relay state in memory and logs transitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};

use crate::params::MAX_VALVES;

/// Relays on the board: pump, one per valve slot, pH up, pH down.
pub const RELAY_COUNT: usize = MAX_VALVES + 3;

/// A logical relay.  Valve slots are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relay {
    Pump,
    Valve(usize),
    PhUp,
    PhDown,
}

impl Relay {
    fn index(self) -> Option<usize> {
        match self {
            Relay::Pump => Some(0),
            Relay::Valve(slot) if (1..=MAX_VALVES).contains(&slot) => Some(slot),
            Relay::Valve(_) => None,
            Relay::PhUp => Some(MAX_VALVES + 1),
            Relay::PhDown => Some(MAX_VALVES + 2),
        }
    }
}

/// Snapshot of every relay's on/off state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStates([bool; RELAY_COUNT]);

impl RelayStates {
    pub fn is_on(&self, relay: Relay) -> bool {
        relay.index().is_some_and(|i| self.0[i])
    }

    fn set(&mut self, relay: Relay, on: bool) -> bool {
        match relay.index() {
            Some(i) => {
                self.0[i] = on;
                true
            }
            None => false,
        }
    }

    /// One-line status, e.g. `Pump: On  V1: Off  V2: On`.
    pub fn describe(&self, valve_count: usize) -> String {
        let word = |on: bool| if on { "On" } else { "Off" };
        let mut out = format!("Pump: {}", word(self.is_on(Relay::Pump)));
        for slot in 1..=valve_count.min(MAX_VALVES) {
            out.push_str(&format!("  V{slot}: {}", word(self.is_on(Relay::Valve(slot)))));
        }
        out
    }
}

/// Interrupt-fed flow-meter pulse counter.
#[derive(Debug, Default)]
pub struct FlowCounter(AtomicU64);

impl FlowCounter {
    pub fn pulse(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Pulses since the last call.
    pub fn read_and_reset(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// What the schedulers drive.  Relay calls are assumed to succeed.
pub trait Actuator: Send + Sync {
    fn set_relay(&self, relay: Relay, on: bool);
    fn read_and_reset_flow_count(&self) -> u64;
    fn relay_states(&self) -> RelayStates;
}

/// De-energize the pump, wait out the back-pressure delay, then release
/// every other relay.
pub async fn force_all_off(actuator: &dyn Actuator, back_pressure: Duration) {
    actuator.set_relay(Relay::Pump, false);
    tokio::time::sleep(back_pressure).await;
    for slot in 1..=MAX_VALVES {
        actuator.set_relay(Relay::Valve(slot), false);
    }
    actuator.set_relay(Relay::PhUp, false);
    actuator.set_relay(Relay::PhDown, false);
    info!("all relays off");
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

/// BCM pins in relay order: pump, valves 1–5, pH up, pH down.
#[cfg(feature = "gpio")]
const RELAY_PINS: [u8; RELAY_COUNT] = [5, 6, 13, 16, 19, 20, 21, 26];

/// BCM pin the flow meter's pulse output is wired to.
#[cfg(feature = "gpio")]
const FLOW_PIN: u8 = 25;

#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: Mutex<Vec<OutputPin>>,
    states: Mutex<RelayStates>,
    active_low: bool, // many relay boards are active-low
    flow: Arc<FlowCounter>,
    _flow_pin: InputPin,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = Vec::with_capacity(RELAY_COUNT);
        for pin_num in RELAY_PINS {
            let mut pin = gpio.get(pin_num)?.into_output();
            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.push(pin);
        }

        let flow = Arc::new(FlowCounter::default());
        let mut flow_pin = gpio.get(FLOW_PIN)?.into_input_pulldown();
        let counter = Arc::clone(&flow);
        flow_pin.set_async_interrupt(Trigger::FallingEdge, move |_: Level| counter.pulse())?;

        info!(active_low, flow_pin = FLOW_PIN, "relay board initialised");
        Ok(Self {
            pins: Mutex::new(pins),
            states: Mutex::new(RelayStates::default()),
            active_low,
            flow,
            _flow_pin: flow_pin,
        })
    }
}

#[cfg(feature = "gpio")]
impl Actuator for RelayBoard {
    fn set_relay(&self, relay: Relay, on: bool) {
        let Some(index) = relay.index() else {
            tracing::warn!(?relay, "unknown relay");
            return;
        };
        {
            let mut pins = lock(&self.pins);
            let pin = &mut pins[index];
            // active-low relay: LOW = ON, HIGH = OFF
            if on != self.active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
        lock(&self.states).set(relay, on);
        info!(?relay, on, "relay set");
    }

    fn read_and_reset_flow_count(&self) -> u64 {
        self.flow.read_and_reset()
    }

    fn relay_states(&self) -> RelayStates {
        *lock(&self.states)
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development — no hardware, logs state)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    states: Mutex<RelayStates>,
    flow: Arc<FlowCounter>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(_active_low: bool) -> Result<Self> {
        info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            states: Mutex::new(RelayStates::default()),
            flow: Arc::new(FlowCounter::default()),
        })
    }

    /// The counter a simulated flow meter would feed.
    pub fn flow_counter(&self) -> Arc<FlowCounter> {
        Arc::clone(&self.flow)
    }
}

#[cfg(not(feature = "gpio"))]
impl Actuator for RelayBoard {
    fn set_relay(&self, relay: Relay, on: bool) {
        if lock(&self.states).set(relay, on) {
            info!(?relay, on, "[mock-gpio] relay set");
        } else {
            tracing::warn!(?relay, "[mock-gpio] unknown relay");
        }
    }

    fn read_and_reset_flow_count(&self) -> u64 {
        self.flow.read_and_reset()
    }

    fn relay_states(&self) -> RelayStates {
        *lock(&self.states)
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::testing::RecordingActuator;
    use super::*;

    // -- RelayBoard (mock) --------------------------------------------------

    #[test]
    fn board_starts_all_off() {
        let board = RelayBoard::new(true).unwrap();
        assert_eq!(board.relay_states(), RelayStates::default());
    }

    #[test]
    fn board_set_on_then_off() {
        let board = RelayBoard::new(true).unwrap();
        board.set_relay(Relay::Valve(2), true);
        assert!(board.relay_states().is_on(Relay::Valve(2)));
        board.set_relay(Relay::Valve(2), false);
        assert!(!board.relay_states().is_on(Relay::Valve(2)));
    }

    #[test]
    fn board_unknown_valve_does_not_panic() {
        let board = RelayBoard::new(true).unwrap();
        board.set_relay(Relay::Valve(9), true);
        assert_eq!(board.relay_states(), RelayStates::default());
    }

    // -- FlowCounter --------------------------------------------------------

    #[test]
    fn flow_read_and_reset() {
        let board = RelayBoard::new(true).unwrap();
        let counter = board.flow_counter();
        for _ in 0..7 {
            counter.pulse();
        }
        assert_eq!(board.read_and_reset_flow_count(), 7);
        assert_eq!(board.read_and_reset_flow_count(), 0);
    }

    #[test]
    fn flow_counter_is_shared_across_threads() {
        let counter = Arc::new(FlowCounter::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        c.pulse();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.read_and_reset(), 1000);
    }

    // -- RelayStates --------------------------------------------------------

    #[test]
    fn describe_lists_pump_and_configured_valves() {
        let mut s = RelayStates::default();
        s.set(Relay::Pump, true);
        s.set(Relay::Valve(2), true);
        assert_eq!(s.describe(3), "Pump: On  V1: Off  V2: On  V3: Off");
    }

    #[test]
    fn ph_relays_are_distinct_from_valves() {
        let mut s = RelayStates::default();
        s.set(Relay::PhUp, true);
        assert!(s.is_on(Relay::PhUp));
        assert!(!s.is_on(Relay::PhDown));
        for slot in 1..=MAX_VALVES {
            assert!(!s.is_on(Relay::Valve(slot)));
        }
    }

    // -- force_all_off ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn force_all_off_stops_pump_first_then_waits() {
        let act = RecordingActuator::default();
        act.set_relay(Relay::Pump, true);
        act.set_relay(Relay::Valve(1), true);
        act.clear();

        force_all_off(&act, Duration::from_secs(1)).await;

        let events = act.timed_events();
        assert_eq!(events[0].0, Relay::Pump);
        assert!(!events[0].1);
        let gap = events[1].2 - events[0].2;
        assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1005));
        assert_eq!(act.relay_states(), RelayStates::default());
    }
}
