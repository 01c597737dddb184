//! Telemetry publishing: pump/valve status and sensor readings, posted as
//! form fields to the configured endpoints.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::acquisition::SensorSnapshot;
use crate::params::{Params, MAX_SOIL_SENSORS, MAX_VALVES};
use crate::relay::{Actuator, Relay, RelayStates};

/// Per-request timeout for every outbound call.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

pub type Form = Vec<(String, String)>;

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Current UTC time as an RFC 3339 string.
pub(crate) fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn level(on: bool) -> String {
    let v = if on { "100" } else { "0" };
    v.to_string()
}

/// Pump status form.  Valve slots past `valve_count` are sent empty.
pub(crate) fn pump_form(relays: &RelayStates, valve_count: usize, flow: u64, accessed: &str) -> Form {
    let mut form = vec![
        ("pump_status".to_string(), level(relays.is_on(Relay::Pump))),
        ("flow_meter_rotations".to_string(), flow.to_string()),
    ];
    for slot in 1..=MAX_VALVES {
        let value = if slot <= valve_count {
            level(relays.is_on(Relay::Valve(slot)))
        } else {
            String::new()
        };
        form.push((format!("valve_{slot}"), value));
    }
    form.push(("accessed".to_string(), accessed.to_string()));
    form
}

/// Sensor form.  Soil slots without a probe are sent empty.
pub(crate) fn sensor_form(snapshot: &SensorSnapshot, accessed: &str) -> Form {
    let mut form = Vec::with_capacity(MAX_SOIL_SENSORS + 3);
    for n in 1..=MAX_SOIL_SENSORS {
        let value = snapshot
            .soil
            .get(n - 1)
            .map(|r| r.percent.to_string())
            .unwrap_or_default();
        form.push((format!("soil_{n}_wet"), value));
    }
    form.push(("tds".to_string(), snapshot.tds.to_string()));
    form.push(("ph".to_string(), snapshot.ph.to_string()));
    form.push(("accessed".to_string(), accessed.to_string()));
    form
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Best-effort publisher.  Failures are logged and the payload dropped.
pub struct TelemetryClient {
    http: reqwest::Client,
    pump_url: String,
    sensor_url: String,
    enabled: bool,
}

impl TelemetryClient {
    pub fn new(params: &Params) -> Result<Self> {
        Self::with_endpoints(&params.pump_url, &params.sensor_url, params.web_api)
    }

    pub(crate) fn with_endpoints(pump_url: &str, sensor_url: &str, enabled: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build telemetry http client")?;
        Ok(Self {
            http,
            pump_url: pump_url.to_string(),
            sensor_url: sensor_url.to_string(),
            enabled,
        })
    }

    pub async fn publish_pump(&self, relays: &RelayStates, valve_count: usize, flow: u64) -> bool {
        let form = pump_form(relays, valve_count, flow, &timestamp());
        self.post("pump", &self.pump_url, &form).await
    }

    /// Log the relay status line, then publish it.
    pub async fn report_relays(&self, actuator: &dyn Actuator, valve_count: usize, flow: u64) {
        let states = actuator.relay_states();
        info!(flow, "{}", states.describe(valve_count));
        self.publish_pump(&states, valve_count, flow).await;
    }

    pub async fn publish_sensors(&self, snapshot: &SensorSnapshot) -> bool {
        let form = sensor_form(snapshot, &timestamp());
        self.post("sensors", &self.sensor_url, &form).await
    }

    /// Returns whether the endpoint accepted the payload.
    async fn post(&self, kind: &'static str, url: &str, form: &Form) -> bool {
        debug!(kind, ?form, "telemetry payload");
        if !self.enabled {
            return false;
        }
        match self.http.post(url).form(form).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => {
                debug!(kind, "telemetry published");
                true
            }
            Ok(resp) => {
                warn!(kind, status = %resp.status(), "telemetry rejected; dropping payload");
                false
            }
            Err(e) if e.is_timeout() => {
                warn!(kind, "telemetry timed out: {e}");
                false
            }
            Err(e) => {
                warn!(kind, "telemetry publish failed: {e}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
