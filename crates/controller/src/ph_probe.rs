//! pH probe reader.
//!
//! A read attempt opens the probe port, reads `\r`-terminated lines until two
//! consecutive parses agree within [`DEBOUNCE_TOLERANCE`], and gives up at
//! [`READ_DEADLINE`].  [`PhProbeReader::acquire`] layers one immediate retry
//! and a rate-limited bus reset on top of that.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hydro_sensors::convert::parse_ph;
use hydro_sensors::probe::{BusReset, ProbePort};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on one read attempt, open to accepted value.
pub const READ_DEADLINE: Duration = Duration::from_secs(20);

/// Two consecutive readings must differ by less than this to be accepted.
pub const DEBOUNCE_TOLERANCE: f64 = 0.1;

/// Minimum spacing between bus resets.
pub const ESCALATION_COOLDOWN: Duration = Duration::from_secs(20 * 60);

/// Pause after a bus reset before the final attempt.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PhReadError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("no agreeing pair within {}s", READ_DEADLINE.as_secs())]
    Timeout,
    #[error("unparseable line {0:?}")]
    Parse(String),
    #[error("consecutive readings disagree ({first} vs {second})")]
    Mismatch { first: f64, second: f64 },
}

impl PhReadError {
    /// Specificity when several things went wrong in one attempt.
    fn rank(&self) -> u8 {
        match self {
            PhReadError::Timeout => 0,
            PhReadError::Parse(_) => 1,
            PhReadError::Mismatch { .. } => 2,
            PhReadError::Open { .. } => 3,
        }
    }
}

fn note(worst: &mut PhReadError, seen: PhReadError) {
    if seen.rank() >= worst.rank() {
        *worst = seen;
    }
}

/// When the bus-reset remedy last ran.  Outlives any one acquisition task.
#[derive(Debug, Default, Clone, Copy)]
pub struct EscalationState {
    pub last_reset_at: Option<Instant>,
}

impl EscalationState {
    fn cooled_down(&self, now: Instant) -> bool {
        self.last_reset_at
            .map_or(true, |t| now.saturating_duration_since(t) >= ESCALATION_COOLDOWN)
    }
}

#[derive(Clone)]
pub struct PhProbeReader {
    port: Arc<dyn ProbePort>,
    bus: Arc<dyn BusReset>,
    path: String,
    escalation: Arc<Mutex<EscalationState>>,
}

impl PhProbeReader {
    pub fn new(
        port: Arc<dyn ProbePort>,
        bus: Arc<dyn BusReset>,
        path: impl Into<String>,
        escalation: Arc<Mutex<EscalationState>>,
    ) -> Self {
        Self {
            port,
            bus,
            path: path.into(),
            escalation,
        }
    }

    /// Read with one retry and, cooldown permitting, one bus reset followed
    /// by a final attempt.  `None` means no trustworthy reading this time.
    pub async fn acquire(&self) -> Option<f64> {
        match self.read_once().await {
            Ok(v) => return Some(v),
            Err(e) => log_failure(&e, "first"),
        }
        match self.read_once().await {
            Ok(v) => return Some(v),
            Err(e) => log_failure(&e, "retry"),
        }

        if !self.begin_escalation(Instant::now()) {
            warn!("pH probe still failing; bus reset on cooldown, reporting unknown");
            return None;
        }
        if let Err(e) = self.bus.trigger() {
            error!("pH probe bus reset failed: {e:#}");
        }
        tokio::time::sleep(SETTLE_DELAY).await;

        match self.read_once().await {
            Ok(v) => {
                info!(ph = v, "pH probe recovered after bus reset");
                Some(v)
            }
            Err(e) => {
                log_failure(&e, "after reset");
                None
            }
        }
    }

    /// Claim the escalation slot if the cooldown has elapsed.
    fn begin_escalation(&self, now: Instant) -> bool {
        let mut st = self
            .escalation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !st.cooled_down(now) {
            return false;
        }
        st.last_reset_at = Some(now);
        true
    }

    async fn read_once(&self) -> Result<f64, PhReadError> {
        let stream = self.port.open(&self.path).map_err(|source| PhReadError::Open {
            path: self.path.clone(),
            source,
        })?;
        let deadline = Instant::now() + READ_DEADLINE;
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        let mut pending: Option<f64> = None;
        let mut worst = PhReadError::Timeout;

        loop {
            line.clear();
            match timeout_at(deadline, reader.read_until(b'\r', &mut line)).await {
                Err(_) => return Err(worst),
                Ok(Err(e)) => {
                    debug!("pH probe read error: {e}");
                    return Err(worst);
                }
                // End of stream: the probe went away.
                Ok(Ok(0)) => return Err(worst),
                Ok(Ok(_)) => {}
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let Some(value) = parse_ph(text) else {
                debug!(line = %text, "pH probe sent garbage");
                pending = None;
                note(&mut worst, PhReadError::Parse(text.to_string()));
                continue;
            };
            match pending.take() {
                None => pending = Some(value),
                Some(first) if (value - first).abs() < DEBOUNCE_TOLERANCE => return Ok(value),
                Some(first) => {
                    debug!(first, second = value, "pH pair rejected");
                    note(&mut worst, PhReadError::Mismatch { first, second: value });
                }
            }
        }
    }
}

fn log_failure(err: &PhReadError, attempt: &str) {
    match err {
        PhReadError::Open { .. } => error!(attempt, "pH probe open failure: {err}"),
        PhReadError::Timeout => warn!(attempt, "pH probe timeout: {err}"),
        PhReadError::Parse(_) => warn!(attempt, "pH probe parse error: {err}"),
        PhReadError::Mismatch { .. } => warn!(attempt, "pH probe debounce mismatch: {err}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use hydro_sensors::probe::ProbeStream;
    use tokio::io::{AsyncRead, ReadBuf};

    use super::*;

    /// A probe that is connected but never says anything.
    struct Silent;

    impl AsyncRead for Silent {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Script {
        Lines(&'static str),
        Silent,
        OpenFails,
    }

    /// Plays back one script entry per open; opens past the end fail.
    #[derive(Default)]
    pub(crate) struct ScriptedProbe {
        scripts: Mutex<VecDeque<Script>>,
        pub(crate) opens: AtomicUsize,
    }

    impl ScriptedProbe {
        pub(crate) fn new(scripts: &[Script]) -> Self {
            Self {
                scripts: Mutex::new(scripts.iter().copied().collect()),
                opens: AtomicUsize::new(0),
            }
        }

        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl ProbePort for ScriptedProbe {
        fn open(&self, _path: &str) -> io::Result<ProbeStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.scripts.lock().unwrap().pop_front();
            match next {
                Some(Script::Lines(text)) => Ok(Box::new(Cursor::new(text.as_bytes().to_vec()))),
                Some(Script::Silent) => Ok(Box::new(Silent)),
                Some(Script::OpenFails) | None => {
                    Err(io::Error::new(io::ErrorKind::NotFound, "no such device"))
                }
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingReset {
        pub(crate) count: AtomicUsize,
    }

    impl CountingReset {
        pub(crate) fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl BusReset for CountingReset {
        fn trigger(&self) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
