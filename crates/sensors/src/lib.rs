//! Hardware-facing sensor layer for the hydroponic controller.
//!
//! Everything here is an external collaborator of the scheduling engine:
//! analog channels (soil probes and the water-quality probe), the pH probe's
//! serial port, the bus-reset remedy for that probe, and the pure conversion
//! math that turns raw readings into engineering units.
//!
//! Backends are feature-gated the same way for every collaborator:
//! `adc` talks to a real MCP3008 over SPI, `sim` (default) produces
//! plausible readings on a development machine.

pub mod convert;
pub mod probe;

#[cfg(feature = "adc")]
pub mod adc;
#[cfg(feature = "sim")]
pub mod sim;

/// Reference voltage of the analog front end.
pub const VREF: f64 = 3.3;

/// Full-scale raw value.  Readings are reported on a 16-bit scale regardless
/// of the converter's native resolution so calibration points stay portable.
pub const RAW_FULL_SCALE: u16 = u16::MAX;

/// The water-quality (TDS) probe sits on the last multiplexer input.
pub const WATER_QUALITY_CHANNEL: u8 = 7;

/// Highest analog input index.
pub const MAX_CHANNEL: u8 = 7;

/// Raw analog access for soil channels and the water-quality channel.
pub trait SensorAdc: Send {
    /// Single-shot read of `channel`, scaled to `0..=RAW_FULL_SCALE`.
    fn read_raw(&mut self, channel: u8) -> anyhow::Result<u16>;

    /// Read `channel` and convert to volts.
    fn read_voltage(&mut self, channel: u8) -> anyhow::Result<f64> {
        let raw = self.read_raw(channel)?;
        Ok(f64::from(raw) / f64::from(RAW_FULL_SCALE) * VREF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u16);

    impl SensorAdc for Fixed {
        fn read_raw(&mut self, _channel: u8) -> anyhow::Result<u16> {
            Ok(self.0)
        }
    }

    #[test]
    fn voltage_full_scale_is_vref() {
        let v = Fixed(RAW_FULL_SCALE).read_voltage(0).unwrap();
        assert!((v - VREF).abs() < 1e-9);
    }

    #[test]
    fn voltage_zero_is_zero() {
        assert_eq!(Fixed(0).read_voltage(3).unwrap(), 0.0);
    }
}
