mod acquisition;
mod controller;
mod irrigation;
mod params;
mod ph_balance;
mod ph_probe;
mod records;
mod refresh;
mod relay;
mod remote;
mod state;
mod supervisor;
mod telemetry;

use std::{env, sync::Arc};

use anyhow::Result;
use hydro_sensors::probe::{CommandBusReset, ProbePort};
use hydro_sensors::SensorAdc;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use acquisition::{AcquisitionConfig, AcquisitionParts, AdcFactory};
use controller::{Controller, Exit};
use params::{ParameterStore, Params};
use ph_probe::PhProbeReader;
use records::{PumpLog, RecordSink};
use relay::{force_all_off, Actuator, RelayBoard};
use remote::RemoteConfigClient;
use state::SharedPh;
use telemetry::TelemetryClient;

#[cfg(not(any(feature = "sim", feature = "adc")))]
compile_error!("enable the `sim` or `adc` feature to select an analog input backend");

/// Exit status asking the service manager for a restart (EX_TEMPFAIL).
const EXIT_RESTART: i32 = 75;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let params_path = env::var("PARAMS_PATH").unwrap_or_else(|_| "params.json".to_string());
    let records_path = env::var("RECORDS_PATH").unwrap_or_else(|_| "sensors.csv".to_string());
    let pump_records_path = env::var("PUMP_RECORDS_PATH").unwrap_or_else(|_| "pump.csv".to_string());
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    let bus_reset_cmd = env::var("PH_BUS_RESET_CMD").ok();

    // ── Parameters ──────────────────────────────────────────────────
    let store = ParameterStore::open(&params_path)?;
    let params = store.snapshot();
    info!(path = %params_path, "controller starting");
    params.log_summary();

    // ── Relay board ─────────────────────────────────────────────────
    let board = Arc::new(RelayBoard::new(active_low)?);
    #[cfg(not(feature = "gpio"))]
    simulate_flow_meter(Arc::clone(&board));
    let actuator: Arc<dyn Actuator> = board;

    // ── Collaborators ───────────────────────────────────────────────
    let start = Instant::now();
    let telemetry = Arc::new(TelemetryClient::new(&params)?);
    let remote = RemoteConfigClient::new(&params, start)?;
    let ph = SharedPh::default();

    let (port, adc) = analog_backends(&params);
    let probe = PhProbeReader::new(
        port,
        Arc::new(CommandBusReset::new(bus_reset_cmd)),
        params.ph_sensor_port.clone(),
        Arc::default(),
    );
    let acquisition = AcquisitionParts {
        config: AcquisitionConfig::from_params(&params),
        adc,
        probe,
        ph: ph.clone(),
        telemetry: Arc::clone(&telemetry),
        records: Arc::new(RecordSink::new(records_path, params.soil_sensor_count())),
    };

    let controller = Controller::new(
        store,
        start,
        Arc::clone(&actuator),
        telemetry,
        remote,
        ph,
        acquisition,
    )
    .with_pump_log(Arc::new(PumpLog::new(pump_records_path)));

    // ── Run until a signal or a parameter change ────────────────────
    let outcome = tokio::select! {
        res = controller.run() => res.map(Some),
        sig = shutdown_signal() => sig.map(|_| {
            info!("shutdown signal received");
            None
        }),
    };

    force_all_off(actuator.as_ref(), params.pump_delay()).await;

    match outcome? {
        Some(Exit::ParametersChanged) => {
            info!(code = EXIT_RESTART, "exiting to apply new parameters");
            std::process::exit(EXIT_RESTART);
        }
        None => Ok(()),
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

#[cfg(feature = "adc")]
fn analog_backends(_params: &Params) -> (Arc<dyn ProbePort>, AdcFactory) {
    use hydro_sensors::adc::Mcp3008;
    use hydro_sensors::probe::SerialProbe;

    let adc: AdcFactory =
        Arc::new(|| -> Result<Box<dyn SensorAdc>> { Ok(Box::new(Mcp3008::open()?)) });
    (Arc::new(SerialProbe::new()), adc)
}

#[cfg(all(feature = "sim", not(feature = "adc")))]
fn analog_backends(params: &Params) -> (Arc<dyn ProbePort>, AdcFactory) {
    use hydro_sensors::sim::{SimulatedAdc, SimulatedProbe};

    let soil = params.soil_sensor_count();
    let wet = u16::try_from(params.soil_wet).unwrap_or(u16::MAX);
    let dry = u16::try_from(params.soil_dry).unwrap_or(u16::MAX);
    let adc: AdcFactory = Arc::new(move || -> Result<Box<dyn SensorAdc>> {
        Ok(Box::new(SimulatedAdc::new(soil, wet, dry)))
    });
    info!("[sim] using simulated analog inputs and pH probe");
    (Arc::new(SimulatedProbe::new(params.ideal_ph)), adc)
}

/// Pulses the mock board's flow counter while the pump is on.
#[cfg(not(feature = "gpio"))]
fn simulate_flow_meter(board: Arc<RelayBoard>) {
    const PULSES_PER_SEC: u32 = 7;
    let counter = board.flow_counter();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tick.tick().await;
            if board.relay_states().is_on(relay::Relay::Pump) {
                for _ in 0..PULSES_PER_SEC {
                    counter.pulse();
                }
            }
        }
    });
}
