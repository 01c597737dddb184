//! Sensor acquisition task.
//!
//! Runs on its own tokio task, independent of the scheduling loop.  Each
//! pass reads the pH probe (with retry / escalation), averages the
//! water-quality channel, maps the soil probes, then publishes on three
//! independent cadences: a diagnostic log line, a CSV record, and telemetry.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hydro_sensors::convert::{average_tds, tds_ppm, SoilReading, FAULT};
use hydro_sensors::{SensorAdc, WATER_QUALITY_CHANNEL};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::params::Params;
use crate::ph_probe::PhProbeReader;
use crate::records::RecordSink;
use crate::state::{PhFallback, SharedPh, PH_UNKNOWN};
use crate::supervisor::LivenessGuard;
use crate::telemetry::{timestamp, TelemetryClient};

/// How long a last-good pH reading may be served after reads start failing.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(1500);

/// Upper bound on the sleep between passes.
const FLOOR_SLEEP: Duration = Duration::from_secs(3);

/// Gap between consecutive water-quality samples.
const TDS_SAMPLE_GAP: Duration = Duration::from_millis(100);

/// Readings from one pass.  Faulted values carry the `-1` sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub soil: Vec<SoilReading>,
    pub tds: f64,
    pub ph: f64,
}

/// The slice of [`Params`] the acquisition task runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    pub ph_enabled: bool,
    pub tds_enabled: bool,
    pub tds_samples: u32,
    pub temperature_c: f64,
    pub soil_sensors: usize,
    pub soil_wet: i32,
    pub soil_dry: i32,
    pub diag_every: Duration,
    pub csv_every: Duration,
    pub api_every: Duration,
}

impl AcquisitionConfig {
    pub fn from_params(p: &Params) -> Self {
        Self {
            ph_enabled: p.ph_sensor_enabled,
            tds_enabled: p.enable_tds_meter,
            tds_samples: p.tds_samples.max(1),
            temperature_c: p.room_temperature,
            soil_sensors: p.soil_sensor_count(),
            soil_wet: p.soil_wet as i32,
            soil_dry: p.soil_dry as i32,
            diag_every: Duration::from_secs(p.sensor_time_diag),
            csv_every: Duration::from_secs(p.sensor_time_csv),
            api_every: Duration::from_secs(p.sensor_time_api),
        }
    }

    /// Sleep between passes: the floor, or half the fastest cadence when
    /// the floor would not fit under it.
    pub fn floor_sleep(&self) -> Duration {
        let fastest = self.diag_every.min(self.csv_every).min(self.api_every);
        if FLOOR_SLEEP < fastest {
            FLOOR_SLEEP
        } else {
            fastest / 2
        }
    }
}

// ---------------------------------------------------------------------------
// Cadence
// ---------------------------------------------------------------------------

/// A repeating deadline, re-armed to `now + every` only when it fires.
#[derive(Debug, Clone, Copy)]
struct Cadence {
    every: Duration,
    next: Option<Instant>,
}

impl Cadence {
    fn new(every: Duration) -> Self {
        Self { every, next: None }
    }

    /// Due immediately the first time.
    fn fire(&mut self, now: Instant) -> bool {
        if self.next.is_some_and(|next| now < next) {
            return false;
        }
        self.next = Some(now + self.every);
        true
    }
}

/// Which cadences fired on a publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub diag: bool,
    pub csv: bool,
    pub api: bool,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub type AdcFactory = Arc<dyn Fn() -> Result<Box<dyn SensorAdc>> + Send + Sync>;

/// Everything needed to start (or restart) the acquisition task.  Shared
/// state (pH cell, escalation cooldown) lives behind `Arc`s and survives a
/// restart.
#[derive(Clone)]
pub struct AcquisitionParts {
    pub config: AcquisitionConfig,
    pub adc: AdcFactory,
    pub probe: PhProbeReader,
    pub ph: SharedPh,
    pub telemetry: Arc<TelemetryClient>,
    pub records: Arc<RecordSink>,
}

impl AcquisitionParts {
    /// Spawn a fresh task.  `alive` is raised before this returns and
    /// lowered when the task ends for any reason.
    pub fn spawn(&self, alive: Arc<AtomicBool>) -> JoinHandle<()> {
        let guard = LivenessGuard::arm(alive);
        let parts = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let adc = match (parts.adc)() {
                Ok(adc) => adc,
                Err(e) => {
                    error!("failed to open analog inputs: {e:#}");
                    return;
                }
            };
            SensorAcquisition::new(parts, adc).run().await;
        })
    }
}

pub struct SensorAcquisition {
    config: AcquisitionConfig,
    adc: Box<dyn SensorAdc>,
    probe: PhProbeReader,
    ph: SharedPh,
    telemetry: Arc<TelemetryClient>,
    records: Arc<RecordSink>,
    diag: Cadence,
    csv: Cadence,
    api: Cadence,
}

impl SensorAcquisition {
    pub fn new(parts: AcquisitionParts, adc: Box<dyn SensorAdc>) -> Self {
        let AcquisitionParts {
            config,
            probe,
            ph,
            telemetry,
            records,
            ..
        } = parts;
        Self {
            diag: Cadence::new(config.diag_every),
            csv: Cadence::new(config.csv_every),
            api: Cadence::new(config.api_every),
            config,
            adc,
            probe,
            ph,
            telemetry,
            records,
        }
    }

    pub async fn run(mut self) {
        let floor = self.config.floor_sleep();
        info!(floor_ms = floor.as_millis() as u64, "sensor acquisition started");
        loop {
            let snapshot = self.sample().await;
            let fired = self.publish(&snapshot).await;
            if fired.csv || fired.api {
                debug!(diag = fired.diag, csv = fired.csv, api = fired.api, "sensor outputs due");
            }
            sleep(floor).await;
        }
    }

    pub async fn sample(&mut self) -> SensorSnapshot {
        let ph = self.acquire_ph().await;
        let tds = self.sample_tds().await;
        let soil = self.sample_soil();
        SensorSnapshot { soil, tds, ph }
    }

    async fn acquire_ph(&mut self) -> f64 {
        if !self.config.ph_enabled {
            return PH_UNKNOWN;
        }
        if let Some(reading) = self.probe.acquire().await {
            self.ph.record_good(reading, Instant::now()).await;
            return reading;
        }
        match self.ph.record_failure(Instant::now(), STALENESS_WINDOW).await {
            PhFallback::Cached(v) => {
                info!(ph = v, "pH read failed; using cached reading");
                v
            }
            PhFallback::Unknown => {
                warn!("pH read failed and no recent good reading; pH unknown");
                PH_UNKNOWN
            }
        }
    }

    async fn sample_tds(&mut self) -> f64 {
        if !self.config.tds_enabled {
            return f64::from(FAULT);
        }
        let n = self.config.tds_samples as usize;
        let mut samples = Vec::with_capacity(n);
        for i in 0..n {
            if i > 0 {
                sleep(TDS_SAMPLE_GAP).await;
            }
            match self.adc.read_voltage(WATER_QUALITY_CHANNEL) {
                Ok(v) => samples.push(tds_ppm(v, self.config.temperature_c)),
                Err(e) => warn!("water-quality read failed: {e:#}"),
            }
        }
        match average_tds(&samples) {
            Some(ppm) => ppm,
            None => {
                error!(samples = samples.len(), "TDS fault: averaged reading is zero");
                f64::from(FAULT)
            }
        }
    }

    fn sample_soil(&mut self) -> Vec<SoilReading> {
        let mut out = Vec::with_capacity(self.config.soil_sensors);
        for index in 0..self.config.soil_sensors {
            let raw = match self.adc.read_raw(index as u8) {
                Ok(raw) => i32::from(raw),
                Err(e) => {
                    warn!(sensor = index + 1, "soil read failed: {e:#}");
                    0
                }
            };
            let reading = SoilReading::from_raw(raw, self.config.soil_wet, self.config.soil_dry);
            if reading.is_disconnected() {
                error!(sensor = index + 1, "soil probe disconnected (raw 0)");
            }
            out.push(reading);
        }
        out
    }

    pub async fn publish(&mut self, snapshot: &SensorSnapshot) -> Fired {
        let now = Instant::now();
        let mut fired = Fired::default();

        if self.diag.fire(now) {
            fired.diag = true;
            let soil: Vec<i32> = snapshot.soil.iter().map(|r| r.percent).collect();
            info!(?soil, tds = snapshot.tds, ph = snapshot.ph, "sensors");
        }
        if self.csv.fire(now) {
            fired.csv = true;
            if let Err(e) = self.records.append(&timestamp(), snapshot).await {
                warn!("failed to write sensor record: {e:#}");
            }
        }
        if self.api.fire(now) {
            fired.api = true;
            if !self.telemetry.publish_sensors(snapshot).await {
                debug!("sensor telemetry not delivered");
            }
        }
        fired
    }
}

// ===========================================================================
// Tests
// ===========================================================================
