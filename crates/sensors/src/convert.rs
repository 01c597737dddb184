//! Conversions from raw probe output to engineering units.

/// Sentinel reported in place of a value when a probe is faulted.
pub const FAULT: i32 = -1;

/// A soil probe reading: the raw value and the mapped percent-wet.
///
/// Both fields are [`FAULT`] when the probe looks disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoilReading {
    pub raw: i32,
    pub percent: i32,
}

impl SoilReading {
    /// Map a raw reading onto 0..=100 percent-wet using the `raw_wet` /
    /// `raw_dry` calibration points.
    ///
    /// A raw value of exactly 0 means the converter input is floating to
    /// ground, i.e. the probe is unplugged; that overrides any mapping.
    pub fn from_raw(raw: i32, raw_wet: i32, raw_dry: i32) -> Self {
        if raw == 0 {
            return Self {
                raw: FAULT,
                percent: FAULT,
            };
        }
        Self {
            raw,
            percent: soil_percent(raw, raw_wet, raw_dry),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.raw == FAULT
    }
}

/// Linear map of `raw` from `[raw_wet, raw_dry]` onto `[100, 0]`, truncated
/// toward zero and clamped to `[0, 100]`.
pub fn soil_percent(raw: i32, raw_wet: i32, raw_dry: i32) -> i32 {
    let range = i64::from(raw_dry) - i64::from(raw_wet);
    if range == 0 {
        return 0; // degenerate calibration
    }
    let scaled = (i64::from(raw) - i64::from(raw_wet)) as f64 * -100.0 / range as f64 + 100.0;
    (scaled.trunc() as i64).clamp(0, 100) as i32
}

/// Temperature-compensated TDS (ppm) from the probe's output voltage.
pub fn tds_ppm(voltage: f64, temperature_c: f64) -> f64 {
    let compensation = 1.0 + 0.02 * (temperature_c - 25.0);
    let v = voltage / compensation;
    (133.42 * v * v * v - 255.86 * v * v + 857.39 * v) * 0.5
}

/// Mean of per-sample TDS values rounded to one decimal.
///
/// Returns `None` when there are no samples or the mean is exactly zero: a
/// zero reading is how the probe presents when it is not in solution or not
/// powered.
pub fn average_tds(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    if mean == 0.0 {
        None
    } else {
        Some((mean * 10.0).round() / 10.0)
    }
}

/// Parse one line of pH probe output, e.g. `"6.52"`.
pub fn parse_ph(line: &str) -> Option<f64> {
    line.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WET: i32 = 21000;
    const DRY: i32 = 49000;

    // -- soil ---------------------------------------------------------------

    #[test]
    fn soil_at_wet_point_is_100() {
        assert_eq!(soil_percent(WET, WET, DRY), 100);
    }

    #[test]
    fn soil_at_dry_point_is_0() {
        assert_eq!(soil_percent(DRY, WET, DRY), 0);
    }

    #[test]
    fn soil_midpoint_is_50() {
        assert_eq!(soil_percent(35000, WET, DRY), 50);
    }

    #[test]
    fn soil_truncates_toward_zero() {
        // 100 - (21100 - 21000) * 100 / 28000 = 99.64..
        assert_eq!(soil_percent(21100, WET, DRY), 99);
    }

    #[test]
    fn soil_wetter_than_calibration_clamps_to_100() {
        assert_eq!(soil_percent(10000, WET, DRY), 100);
    }

    #[test]
    fn soil_drier_than_calibration_clamps_to_0() {
        assert_eq!(soil_percent(60000, WET, DRY), 0);
    }

    #[test]
    fn soil_degenerate_calibration_is_zero() {
        assert_eq!(soil_percent(30000, 30000, 30000), 0);
    }

    #[test]
    fn soil_raw_zero_is_disconnected() {
        let r = SoilReading::from_raw(0, WET, DRY);
        assert_eq!(r, SoilReading { raw: -1, percent: -1 });
        assert!(r.is_disconnected());
    }

    #[test]
    fn soil_raw_zero_is_disconnected_regardless_of_calibration() {
        // With a calibration that would map 0 into range, zero still wins.
        let r = SoilReading::from_raw(0, 0, 100);
        assert_eq!(r.percent, FAULT);
    }

    #[test]
    fn soil_connected_reading_keeps_raw() {
        let r = SoilReading::from_raw(35000, WET, DRY);
        assert_eq!(r.raw, 35000);
        assert_eq!(r.percent, 50);
        assert!(!r.is_disconnected());
    }

    // -- tds ----------------------------------------------------------------

    #[test]
    fn tds_zero_voltage_is_zero() {
        assert_eq!(tds_ppm(0.0, 25.0), 0.0);
    }

    #[test]
    fn tds_at_reference_temperature() {
        // v = 1.0: (133.42 - 255.86 + 857.39) * 0.5
        let expected = (133.42 - 255.86 + 857.39) * 0.5;
        assert!((tds_ppm(1.0, 25.0) - expected).abs() < 1e-9);
    }

    #[test]
    fn tds_warmer_water_reads_lower() {
        assert!(tds_ppm(1.0, 30.0) < tds_ppm(1.0, 25.0));
    }

    #[test]
    fn average_of_all_zero_is_fault() {
        assert_eq!(average_tds(&[0.0, 0.0, 0.0, 0.0]), None);
    }

    #[test]
    fn average_of_nothing_is_fault() {
        assert_eq!(average_tds(&[]), None);
    }

    #[test]
    fn average_rounds_to_one_decimal() {
        assert_eq!(average_tds(&[367.46, 367.48]), Some(367.5));
        assert_eq!(average_tds(&[100.0, 200.0, 300.0, 400.04]), Some(250.0));
    }

    #[test]
    fn average_with_single_zero_sample_is_not_fault() {
        assert_eq!(average_tds(&[0.0, 400.0]), Some(200.0));
    }

    // -- ph -----------------------------------------------------------------

    #[test]
    fn parse_ph_plain() {
        assert_eq!(parse_ph("6.52"), Some(6.52));
    }

    #[test]
    fn parse_ph_trims_whitespace_and_cr() {
        assert_eq!(parse_ph(" 7.01\r\n"), Some(7.01));
    }

    #[test]
    fn parse_ph_rejects_garbage() {
        assert_eq!(parse_ph("*OK"), None);
        assert_eq!(parse_ph(""), None);
    }

    #[test]
    fn parse_ph_rejects_non_finite() {
        assert_eq!(parse_ph("NaN"), None);
        assert_eq!(parse_ph("inf"), None);
    }
}
