//! MCP3008 10-bit ADC driver over SPI for soil and water-quality sensing.
//!
//! Channels 0–4 carry the capacitive soil probes, channel 7 the TDS probe.
//! Results are left-shifted onto a 16-bit scale so the soil calibration
//! points in the parameter file (`soil_wet ≈ 21000`, `soil_dry ≈ 49000`)
//! don't depend on converter resolution.

use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use crate::{SensorAdc, MAX_CHANNEL};

// ── Protocol ────────────────────────────────────────────────────────────────
//
// A conversion is one 3-byte full-duplex transfer:
//   tx: [0000_0001] [S D2 D1 D0 xxxx] [xxxx_xxxx]
//        start bit   single-ended + channel
//   rx: [xxxx_xxxx] [xxxx_x0 B9 B8] [B7 .. B0]

/// Start bit, first byte of every request.
const START: u8 = 0x01;
/// Single-ended (vs. differential) mode flag, upper nibble of byte 1.
const SINGLE_ENDED: u8 = 0x08;

/// SPI clock.  The part is rated for 1.35 MHz at 2.7 V.
const CLOCK_HZ: u32 = 1_350_000;

/// Native resolution is 10 bits; shift up to fill 16.
const SCALE_SHIFT: u32 = 6;

/// Build the request frame for a single-ended read on `channel`.
fn request_for_channel(channel: u8) -> [u8; 3] {
    [START, (SINGLE_ENDED | channel) << 4, 0x00]
}

/// Extract the 10-bit result from a response frame.
fn decode(response: [u8; 3]) -> u16 {
    (u16::from(response[1] & 0x03) << 8) | u16::from(response[2])
}

/// 10-bit value onto the 16-bit scale.
fn scale(value: u16) -> u16 {
    value << SCALE_SHIFT
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// MCP3008 on SPI0, chip-enable 0.
pub struct Mcp3008 {
    spi: Spi,
}

impl Mcp3008 {
    pub fn open() -> anyhow::Result<Self> {
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, CLOCK_HZ, Mode::Mode0)?;
        tracing::info!(clock_hz = CLOCK_HZ, "mcp3008 initialised");
        Ok(Self { spi })
    }
}

impl SensorAdc for Mcp3008 {
    fn read_raw(&mut self, channel: u8) -> anyhow::Result<u16> {
        anyhow::ensure!(
            channel <= MAX_CHANNEL,
            "MCP3008 channel {channel} out of range (0–{MAX_CHANNEL})"
        );
        let tx = request_for_channel(channel);
        let mut rx = [0u8; 3];
        self.spi.transfer(&mut rx, &tx)?;
        Ok(scale(decode(rx)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
