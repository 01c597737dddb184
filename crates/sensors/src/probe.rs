//! pH probe transport: the serial port the probe streams readings over, and
//! the bus-reset remedy used when the probe stops answering.
//!
//! The probe emits one ASCII reading per line, terminated by `\r`, at 9600
//! baud.  Opening the port is cheap and is done fresh for every read attempt
//! so a re-enumerated USB adapter is picked up without a restart.

use std::io;

use tokio::io::AsyncRead;
use tokio_serial::SerialPortBuilderExt;

/// Baud rate of the probe's serial interface.
pub const PROBE_BAUD: u32 = 9600;

/// A readable byte stream from an opened probe port.
pub type ProbeStream = Box<dyn AsyncRead + Unpin + Send>;

/// Something that can open the probe's port by device path.
pub trait ProbePort: Send + Sync {
    fn open(&self, path: &str) -> io::Result<ProbeStream>;
}

/// The real probe on a tty device.
#[derive(Debug, Clone, Copy)]
pub struct SerialProbe {
    baud: u32,
}

impl SerialProbe {
    pub fn new() -> Self {
        Self { baud: PROBE_BAUD }
    }
}

impl Default for SerialProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbePort for SerialProbe {
    fn open(&self, path: &str) -> io::Result<ProbeStream> {
        let port = tokio_serial::new(path, self.baud)
            .open_native_async()
            .map_err(io::Error::from)?;
        Ok(Box::new(port))
    }
}

// ---------------------------------------------------------------------------
// Bus reset
// ---------------------------------------------------------------------------

/// Hardware remedy for a wedged probe (typically power-cycling the USB hub
/// port it hangs off).  Triggering is fire-and-forget; the caller waits a
/// settle delay before trying the probe again.
pub trait BusReset: Send + Sync {
    fn trigger(&self) -> anyhow::Result<()>;
}

/// Runs an operator-supplied shell command, e.g. `uhubctl -a cycle -p 2`.
/// With no command configured the remedy is a logged no-op.
#[derive(Debug, Clone, Default)]
pub struct CommandBusReset {
    command: Option<String>,
}

impl CommandBusReset {
    pub fn new(command: Option<String>) -> Self {
        let command = command.filter(|c| !c.trim().is_empty());
        Self { command }
    }
}

impl BusReset for CommandBusReset {
    fn trigger(&self) -> anyhow::Result<()> {
        let Some(command) = &self.command else {
            tracing::warn!("no bus reset command configured; skipping probe bus reset");
            return Ok(());
        };
        tracing::warn!(command = %command, "resetting pH probe bus");
        // The child is reaped by the runtime once it exits.
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .spawn()
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("failed to spawn bus reset command {command:?}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_command_is_treated_as_unset() {
        let reset = CommandBusReset::new(Some("   ".into()));
        assert!(reset.command.is_none());
    }

    #[test]
    fn unset_command_is_a_noop() {
        let reset = CommandBusReset::new(None);
        assert!(reset.trigger().is_ok());
    }

    #[tokio::test]
    async fn configured_command_spawns() {
        let reset = CommandBusReset::new(Some("true".into()));
        assert!(reset.trigger().is_ok());
    }

    #[tokio::test]
    async fn opening_missing_device_fails() {
        let probe = SerialProbe::new();
        assert!(probe.open("/dev/ttyDOES-NOT-EXIST").is_err());
    }
}
