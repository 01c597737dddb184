//! Typed, validated controller parameters, hot-loadable from the parameter
//! file or a remote override.
//!
//! Every key has exactly one declarative [`Rule`] in [`RULES`].  Candidate
//! sets are applied key by key: an invalid value is logged and skipped while
//! the rest of the candidate still applies, and unknown keys are ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Valve slots on the relay board.
pub const MAX_VALVES: usize = 5;

/// Soil probe inputs on the ADC.
pub const MAX_SOIL_SENSORS: usize = 5;

/// A parsed but not yet validated parameter object.
pub type Candidate = Map<String, Value>;

// ---------------------------------------------------------------------------
// Parameter set
// ---------------------------------------------------------------------------

/// The live parameter set.  Field names are the parameter file keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub number_of_water_valves: u32,

    pub valve1_active: bool,
    pub valve1_time: f64,
    pub valve1_duration: f64,
    pub valve2_active: bool,
    pub valve2_time: f64,
    pub valve2_duration: f64,
    pub valve3_active: bool,
    pub valve3_time: f64,
    pub valve3_duration: f64,
    pub valve4_active: bool,
    pub valve4_time: f64,
    pub valve4_duration: f64,
    pub valve5_active: bool,
    pub valve5_time: f64,
    pub valve5_duration: f64,

    pub pump_delay: f64,
    pub water_refresh_time: f64,
    pub water_refresh_duration: f64,

    pub balance_ph: bool,
    pub ideal_ph: f64,
    pub ph_spread: f64,
    pub ph_valve_time: f64,
    pub ph_balance_interval: f64,
    pub ph_retry_interval: f64,
    pub ph_conflict_margin: f64,
    pub ph_sensor_enabled: bool,
    pub ph_sensor_port: String,

    pub enable_tds_meter: bool,
    pub tds_samples: u32,
    pub room_temperature: f64,

    pub number_of_soil_sensors: u32,
    pub soil_wet: u32,
    pub soil_dry: u32,

    pub sensor_time_diag: u64,
    pub sensor_time_csv: u64,
    pub sensor_time_api: u64,

    pub web_api: bool,
    pub pump_url: String,
    pub sensor_url: String,

    pub remote_config: bool,
    pub config_url: String,
    pub remote_config_interval: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            number_of_water_valves: 5,
            valve1_active: true,
            valve1_time: 180.0,
            valve1_duration: 10.0,
            valve2_active: true,
            valve2_time: 180.0,
            valve2_duration: 10.0,
            valve3_active: true,
            valve3_time: 180.0,
            valve3_duration: 10.0,
            valve4_active: true,
            valve4_time: 180.0,
            valve4_duration: 10.0,
            valve5_active: true,
            valve5_time: 180.0,
            valve5_duration: 10.0,
            pump_delay: 1.0,
            water_refresh_time: 3600.0,
            water_refresh_duration: 30.0,
            balance_ph: true,
            ideal_ph: 6.5,
            ph_spread: 0.5,
            ph_valve_time: 5.0,
            ph_balance_interval: 300.0,
            ph_retry_interval: 30.0,
            ph_conflict_margin: 60.0,
            ph_sensor_enabled: true,
            ph_sensor_port: "/dev/ttyUSB0".into(),
            enable_tds_meter: true,
            tds_samples: 4,
            room_temperature: 25.0,
            number_of_soil_sensors: 5,
            soil_wet: 21000,
            soil_dry: 49000,
            sensor_time_diag: 5,
            sensor_time_csv: 600,
            sensor_time_api: 180,
            web_api: true,
            pump_url: "https://telemetry.invalid/api/pump".into(),
            sensor_url: "https://telemetry.invalid/api/sensors".into(),
            remote_config: false,
            config_url: "https://telemetry.invalid/api/config".into(),
            remote_config_interval: 300,
        }
    }
}

/// Per-slot valve settings, `slot` 1-based.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValveParams {
    pub slot: usize,
    pub active: bool,
    /// Zero for slots beyond `number_of_water_valves`.
    pub period: Duration,
    pub duration: Duration,
}

fn secs(v: f64) -> Duration {
    Duration::from_secs_f64(v.max(0.0))
}

impl Params {
    pub fn valve_count(&self) -> usize {
        (self.number_of_water_valves as usize).min(MAX_VALVES)
    }

    pub fn soil_sensor_count(&self) -> usize {
        (self.number_of_soil_sensors as usize).min(MAX_SOIL_SENSORS)
    }

    /// Settings for valve `slot` (1..=MAX_VALVES).
    pub fn valve(&self, slot: usize) -> ValveParams {
        let (active, time, duration) = match slot {
            1 => (self.valve1_active, self.valve1_time, self.valve1_duration),
            2 => (self.valve2_active, self.valve2_time, self.valve2_duration),
            3 => (self.valve3_active, self.valve3_time, self.valve3_duration),
            4 => (self.valve4_active, self.valve4_time, self.valve4_duration),
            5 => (self.valve5_active, self.valve5_time, self.valve5_duration),
            _ => (false, 0.0, 0.0),
        };
        let installed = slot >= 1 && slot <= self.valve_count();
        ValveParams {
            slot,
            active: installed && active,
            period: if installed { secs(time) } else { Duration::ZERO },
            duration: secs(duration),
        }
    }

    pub fn pump_delay(&self) -> Duration {
        secs(self.pump_delay)
    }

    pub fn refresh_period(&self) -> Duration {
        secs(self.water_refresh_time)
    }

    pub fn refresh_duration(&self) -> Duration {
        secs(self.water_refresh_duration)
    }

    pub fn ph_pulse(&self) -> Duration {
        secs(self.ph_valve_time)
    }

    pub fn ph_balance_interval(&self) -> Duration {
        secs(self.ph_balance_interval)
    }

    pub fn ph_retry_interval(&self) -> Duration {
        secs(self.ph_retry_interval)
    }

    pub fn ph_conflict_margin(&self) -> Duration {
        secs(self.ph_conflict_margin)
    }

    pub fn remote_config_interval(&self) -> Duration {
        Duration::from_secs(self.remote_config_interval)
    }

    /// Log every live parameter, one line each.
    pub fn log_summary(&self) {
        if let Ok(Value::Object(map)) = serde_json::to_value(self) {
            for (key, value) in &map {
                info!("{key}: {value}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation rules
// ---------------------------------------------------------------------------

/// How a single key is validated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rule {
    /// Exactly `true` or `false`.
    Bool,
    /// A number within `[min, max]`; `integer` rejects fractional values.
    Number { min: f64, max: f64, integer: bool },
    /// A string of at least `min_len` characters containing `contains`.
    Text {
        min_len: usize,
        contains: &'static str,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("expected true or false, got {0}")]
    NotBool(String),
    #[error("expected a number, got {0}")]
    NotNumber(String),
    #[error("expected an integer, got {0}")]
    NotInteger(String),
    #[error("{value} out of range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("expected a string, got {0}")]
    NotText(String),
    #[error("length {len} is shorter than the minimum {min}")]
    TooShort { len: usize, min: usize },
    #[error("must contain {0:?}")]
    MissingSubstring(&'static str),
}

impl Rule {
    const fn int(min: f64, max: f64) -> Self {
        Rule::Number {
            min,
            max,
            integer: true,
        }
    }

    const fn num(min: f64, max: f64) -> Self {
        Rule::Number {
            min,
            max,
            integer: false,
        }
    }

    const fn text(min_len: usize, contains: &'static str) -> Self {
        Rule::Text { min_len, contains }
    }

    pub fn check(&self, value: &Value) -> Result<(), ParamError> {
        match *self {
            Rule::Bool => match value {
                Value::Bool(_) => Ok(()),
                other => Err(ParamError::NotBool(other.to_string())),
            },
            Rule::Number { min, max, integer } => {
                let Value::Number(n) = value else {
                    return Err(ParamError::NotNumber(value.to_string()));
                };
                if integer && !(n.is_i64() || n.is_u64()) {
                    return Err(ParamError::NotInteger(n.to_string()));
                }
                let v = n
                    .as_f64()
                    .ok_or_else(|| ParamError::NotNumber(n.to_string()))?;
                if !(min..=max).contains(&v) {
                    return Err(ParamError::OutOfRange { value: v, min, max });
                }
                Ok(())
            }
            Rule::Text { min_len, contains } => {
                let Value::String(s) = value else {
                    return Err(ParamError::NotText(value.to_string()));
                };
                let len = s.chars().count();
                if len < min_len {
                    return Err(ParamError::TooShort { len, min: min_len });
                }
                if !s.contains(contains) {
                    return Err(ParamError::MissingSubstring(contains));
                }
                Ok(())
            }
        }
    }

    /// Whether two valid values are the same setting.  Numbers compare by
    /// value so `7` and `7.0` are equal.
    fn same(&self, a: &Value, b: &Value) -> bool {
        match self {
            Rule::Number { .. } => a.as_f64() == b.as_f64(),
            _ => a == b,
        }
    }
}

const VALVE_TIME: Rule = Rule::num(0.1, 500_000.0);
const VALVE_DURATION: Rule = Rule::num(0.1, 3600.0);
const URL: Rule = Rule::text(10, "https://");

/// One rule per parameter key.
pub const RULES: &[(&str, Rule)] = &[
    ("number_of_water_valves", Rule::int(0.0, MAX_VALVES as f64)),
    ("valve1_active", Rule::Bool),
    ("valve1_time", VALVE_TIME),
    ("valve1_duration", VALVE_DURATION),
    ("valve2_active", Rule::Bool),
    ("valve2_time", VALVE_TIME),
    ("valve2_duration", VALVE_DURATION),
    ("valve3_active", Rule::Bool),
    ("valve3_time", VALVE_TIME),
    ("valve3_duration", VALVE_DURATION),
    ("valve4_active", Rule::Bool),
    ("valve4_time", VALVE_TIME),
    ("valve4_duration", VALVE_DURATION),
    ("valve5_active", Rule::Bool),
    ("valve5_time", VALVE_TIME),
    ("valve5_duration", VALVE_DURATION),
    ("pump_delay", Rule::num(0.0, 60.0)),
    ("water_refresh_time", Rule::num(60.0, 500_000.0)),
    ("water_refresh_duration", Rule::num(1.0, 3600.0)),
    ("balance_ph", Rule::Bool),
    ("ideal_ph", Rule::num(5.0, 8.0)),
    ("ph_spread", Rule::num(0.1, 2.0)),
    ("ph_valve_time", Rule::num(0.1, 60.0)),
    ("ph_balance_interval", Rule::num(60.0, 500_000.0)),
    ("ph_retry_interval", Rule::num(5.0, 3600.0)),
    ("ph_conflict_margin", Rule::num(0.0, 3600.0)),
    ("ph_sensor_enabled", Rule::Bool),
    ("ph_sensor_port", Rule::text(8, "/dev/tty")),
    ("enable_tds_meter", Rule::Bool),
    ("tds_samples", Rule::int(1.0, 50.0)),
    ("room_temperature", Rule::num(0.0, 50.0)),
    ("number_of_soil_sensors", Rule::int(0.0, MAX_SOIL_SENSORS as f64)),
    ("soil_wet", Rule::int(0.0, 65535.0)),
    ("soil_dry", Rule::int(0.0, 65535.0)),
    ("sensor_time_diag", Rule::int(1.0, 3600.0)),
    ("sensor_time_csv", Rule::int(10.0, 86_400.0)),
    ("sensor_time_api", Rule::int(10.0, 86_400.0)),
    ("web_api", Rule::Bool),
    ("pump_url", URL),
    ("sensor_url", URL),
    ("remote_config", Rule::Bool),
    ("config_url", URL),
    ("remote_config_interval", Rule::int(30.0, 86_400.0)),
];

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Where a candidate set comes from.
pub enum ParamSource<'a> {
    /// A parameter file holding one JSON object.
    File(&'a Path),
    /// A remote response body: a JSON array whose first element is the
    /// parameter object.
    Remote(Value),
}

/// Owns the live [`Params`] and the file they persist to.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    params: Params,
    path: PathBuf,
}

impl ParameterStore {
    /// A store holding defaults, persisting to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            params: Params::default(),
            path: path.into(),
        }
    }

    /// Build a store from the parameter file at `path`.  A missing file is
    /// not an error: defaults are kept and written out.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::new(path);
        if store.path.exists() {
            let candidate = Self::load(&ParamSource::File(&store.path))?;
            store.validate_and_apply(&candidate)?;
        } else {
            warn!(path = %store.path.display(), "no parameter file; writing defaults");
            store.persist()?;
        }
        Ok(store)
    }

    /// Parse a candidate set from `source`.  Values are not validated here.
    pub fn load(source: &ParamSource<'_>) -> Result<Candidate> {
        match source {
            ParamSource::File(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read parameters: {}", path.display()))?;
                let value: Value = serde_json::from_str(&contents)
                    .with_context(|| format!("failed to parse parameters: {}", path.display()))?;
                match value {
                    Value::Object(map) => Ok(map),
                    _ => bail!("parameter file {} is not a JSON object", path.display()),
                }
            }
            ParamSource::Remote(body) => match body {
                Value::Array(items) => match items.first() {
                    Some(Value::Object(map)) => Ok(map.clone()),
                    Some(_) => bail!("remote parameters: first element is not an object"),
                    None => bail!("remote parameters: empty array"),
                },
                _ => bail!("remote parameters: expected a JSON array"),
            },
        }
    }

    /// Validate each known key of `candidate` independently and apply the
    /// valid ones.  Returns whether any live value actually changed.
    pub fn validate_and_apply(&mut self, candidate: &Candidate) -> Result<bool> {
        let mut live = match serde_json::to_value(&self.params)? {
            Value::Object(map) => map,
            _ => bail!("parameter set did not serialize to an object"),
        };

        for key in candidate.keys() {
            if !RULES.iter().any(|(k, _)| k == key) {
                debug!(key = %key, "ignoring unknown parameter");
            }
        }

        let mut changed = false;
        for (key, rule) in RULES {
            let Some(value) = candidate.get(*key) else {
                continue;
            };
            if let Err(e) = rule.check(value) {
                warn!(key, value = %value, "rejected parameter: {e}");
                continue;
            }
            let unchanged = live.get(*key).is_some_and(|current| rule.same(current, value));
            if unchanged {
                continue;
            }
            info!(key, from = ?live.get(*key), to = %value, "parameter changed");
            live.insert((*key).to_string(), value.clone());
            changed = true;
        }

        if changed {
            self.params = serde_json::from_value(Value::Object(live))
                .context("validated parameters failed to deserialize")?;
        }
        Ok(changed)
    }

    /// Write the live set to the parameter file (via a temp file + rename).
    pub fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.params)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write parameters: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace parameters: {}", self.path.display()))?;
        info!(path = %self.path.display(), "parameters persisted");
        Ok(())
    }

    pub fn snapshot(&self) -> Params {
        self.params.clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
