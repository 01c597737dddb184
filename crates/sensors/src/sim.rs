//! Simulated sensors for running the controller on a development machine.
//!
//! - Soil channels: random walk with mean reversion between the wet/dry
//!   calibration points, per-read noise, and the occasional dropout to 0
//!   (what an unplugged probe looks like).
//! - Water-quality channel: a slowly wandering voltage around ~0.9 V
//!   (≈ 350 ppm at 25 °C).
//! - pH probe: each open yields a short burst of `\r`-terminated readings
//!   around a drifting true value, occasionally with a garbled line.

use std::io::{self, Cursor};
use std::sync::Mutex;

use crate::probe::{ProbePort, ProbeStream};
use crate::{SensorAdc, MAX_CHANNEL, RAW_FULL_SCALE, VREF, WATER_QUALITY_CHANNEL};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1): sum of 12 uniform [0,1) minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Analog channels
// ---------------------------------------------------------------------------

/// Probability that a soil read comes back as 0 (probe dropout).
const DROPOUT_PROB: f64 = 0.002;

/// Stateful simulator behind the [`SensorAdc`] trait.
pub struct SimulatedAdc {
    soil: Vec<f64>,
    raw_wet: f64,
    raw_dry: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    tds_voltage: f64,
}

impl SimulatedAdc {
    /// `raw_wet` / `raw_dry` should match the soil calibration in the
    /// parameter file so simulated percentages land mid-range.
    pub fn new(soil_channels: usize, raw_wet: u16, raw_dry: u16) -> Self {
        let (wet, dry) = (f64::from(raw_wet), f64::from(raw_dry));
        let range = (dry - wet).abs().max(1.0);
        let centre = (wet + dry) / 2.0;
        let soil = (0..soil_channels)
            .map(|_| gaussian(centre, range * 0.05))
            .collect();
        Self {
            soil,
            raw_wet: wet,
            raw_dry: dry,
            walk_sigma: range * 0.005,
            mean_reversion: 0.02,
            noise_sigma: range * 0.003,
            tds_voltage: 0.9,
        }
    }

    fn soil_sample(&mut self, index: usize) -> u16 {
        let (lo, hi) = if self.raw_wet <= self.raw_dry {
            (self.raw_wet, self.raw_dry)
        } else {
            (self.raw_dry, self.raw_wet)
        };
        let centre = (lo + hi) / 2.0;
        let base = &mut self.soil[index];
        *base += self.mean_reversion * (centre - *base) + gaussian(0.0, self.walk_sigma);
        *base = base.clamp(lo, hi);

        if fastrand::f64() < DROPOUT_PROB {
            return 0;
        }
        let v = gaussian(*base, self.noise_sigma);
        v.clamp(1.0, f64::from(RAW_FULL_SCALE)) as u16
    }

    fn water_quality_sample(&mut self) -> u16 {
        self.tds_voltage = (self.tds_voltage + gaussian(0.0, 0.002)).clamp(0.5, 1.5);
        let v = gaussian(self.tds_voltage, 0.005).clamp(0.0, VREF);
        (v / VREF * f64::from(RAW_FULL_SCALE)) as u16
    }
}

impl SensorAdc for SimulatedAdc {
    fn read_raw(&mut self, channel: u8) -> anyhow::Result<u16> {
        anyhow::ensure!(
            channel <= MAX_CHANNEL,
            "channel {channel} out of range (0–{MAX_CHANNEL})"
        );
        if channel == WATER_QUALITY_CHANNEL {
            return Ok(self.water_quality_sample());
        }
        match self.soil.get(usize::from(channel)) {
            Some(_) => Ok(self.soil_sample(usize::from(channel))),
            // Nothing wired: the input floats to ground.
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// pH probe
// ---------------------------------------------------------------------------

/// Probability that a line in a burst is garbled.
const GARBLE_PROB: f64 = 0.03;

/// Lines emitted per open.
const BURST_LEN: usize = 4;

/// Simulated pH probe.  Opening returns a finite burst of readings; the
/// stream ends after the burst, like a probe that was unplugged mid-read.
pub struct SimulatedProbe {
    true_ph: Mutex<f64>,
}

impl SimulatedProbe {
    pub fn new(initial_ph: f64) -> Self {
        Self {
            true_ph: Mutex::new(initial_ph),
        }
    }
}

impl ProbePort for SimulatedProbe {
    fn open(&self, _path: &str) -> io::Result<ProbeStream> {
        let mut ph = self
            .true_ph
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *ph = (*ph + gaussian(0.0, 0.01)).clamp(4.0, 9.0);

        let mut burst = String::new();
        for _ in 0..BURST_LEN {
            if fastrand::f64() < GARBLE_PROB {
                burst.push_str("*ER");
            } else {
                burst.push_str(&format!("{:.2}", gaussian(*ph, 0.01)));
            }
            burst.push('\r');
        }
        Ok(Box::new(Cursor::new(burst.into_bytes())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
