//! Watches the sensor acquisition task and restarts it when it dies.
//! Also owns the per-pass observability logging of what is due next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Interval between status summaries at `info`.
const STATUS_EVERY: Duration = Duration::from_secs(60);

/// Raises a liveness flag while held; lowers it on drop, including when the
/// owning task panics or is aborted.
pub struct LivenessGuard(Arc<AtomicBool>);

impl LivenessGuard {
    pub fn arm(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Starts one instance of the supervised task.  Must arm a
/// [`LivenessGuard`] on the flag before returning.
pub type Spawner = Box<dyn FnMut(Arc<AtomicBool>) -> JoinHandle<()> + Send>;

/// An upcoming event and when it is due, if ever.
pub type PendingEvent = (String, Option<Instant>);

pub struct Supervisor {
    spawner: Spawner,
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    restarts: u32,
    last_status: Option<Instant>,
}

impl Supervisor {
    pub fn new(spawner: Spawner) -> Self {
        Self {
            spawner,
            alive: Arc::new(AtomicBool::new(false)),
            handle: None,
            restarts: 0,
            last_status: None,
        }
    }

    pub fn start(&mut self) {
        self.handle = Some((self.spawner)(Arc::clone(&self.alive)));
        info!(restarts = self.restarts, "sensor acquisition task launched");
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// One supervisor pass.  Returns whether the task was restarted.
    pub fn check(&mut self, now: Instant, pending: &[PendingEvent]) -> bool {
        for (event, due) in pending {
            match due {
                Some(due) => debug!(
                    event = %event,
                    remaining_s = due.saturating_duration_since(now).as_secs(),
                    "pending"
                ),
                None => debug!(event = %event, "not scheduled"),
            }
        }

        let alive = self.is_alive();
        let status_due = self
            .last_status
            .map_or(true, |t| now.saturating_duration_since(t) >= STATUS_EVERY);
        if status_due {
            self.last_status = Some(now);
            let next = pending
                .iter()
                .filter_map(|(event, due)| due.map(|d| (event, d)))
                .min_by_key(|(_, d)| *d);
            match next {
                Some((event, due)) => info!(
                    acquisition_alive = alive,
                    restarts = self.restarts,
                    next_event = %event,
                    next_in_s = due.saturating_duration_since(now).as_secs(),
                    "status"
                ),
                None => info!(acquisition_alive = alive, restarts = self.restarts, "status"),
            }
        }

        if alive {
            return false;
        }
        error!(restarts = self.restarts, "sensor acquisition task is not running; restarting");
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.restarts += 1;
        self.start();
        true
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Spawns tasks that stay up for an hour.
    fn long_lived(calls: Arc<AtomicUsize>) -> Spawner {
        Box::new(move |alive| {
            calls.fetch_add(1, Ordering::SeqCst);
            let guard = LivenessGuard::arm(alive);
            tokio::spawn(async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn guard_lowers_flag_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = LivenessGuard::arm(Arc::clone(&flag));
        assert!(flag.load(Ordering::SeqCst));
        drop(guard);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn live_task_is_left_alone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let mut sup = Supervisor::new(Box::new(move |alive| {
            c.fetch_add(1, Ordering::SeqCst);
            let guard = LivenessGuard::arm(alive);
            tokio::spawn(async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            })
        }));
        sup.start();
        settle().await;

        assert!(!sup.check(Instant::now(), &[]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sup.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exited_task_is_restarted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let mut sup = Supervisor::new(Box::new(move |alive| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            let guard = LivenessGuard::arm(alive);
            tokio::spawn(async move {
                let _guard = guard;
                // first instance quits at once; the replacement stays up
                if n > 0 {
                    std::future::pending::<()>().await;
                }
            })
        }));
        sup.start();
        settle().await;
        assert!(!sup.is_alive());

        assert!(sup.check(Instant::now(), &[]));
        settle().await;
        assert!(sup.is_alive());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sup.restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_task_is_restarted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let mut sup = Supervisor::new(Box::new(move |alive| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            let guard = LivenessGuard::arm(alive);
            tokio::spawn(async move {
                let _guard = guard;
                if n == 0 {
                    panic!("probe driver crashed");
                }
                std::future::pending::<()>().await;
            })
        }));
        sup.start();
        settle().await;
        assert!(!sup.is_alive());

        let due = Some(Instant::now() + Duration::from_secs(30));
        assert!(sup.check(Instant::now(), &[("valve 1".into(), due), ("refresh".into(), None)]));
        settle().await;
        assert!(sup.is_alive());
        assert_eq!(sup.restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_supervisor_stops_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sup = Supervisor::new(long_lived(Arc::clone(&calls)));
        sup.start();
        let alive = Arc::clone(&sup.alive);
        assert!(alive.load(Ordering::SeqCst));

        drop(sup);
        settle().await;
        assert!(!alive.load(Ordering::SeqCst));
    }
}
