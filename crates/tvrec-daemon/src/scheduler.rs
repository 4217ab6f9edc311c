//! Background update loop.
//!
//! ```text
//!   ┌──────────┐  wait(time_left)  ┌─────────┐  refresh ok   ┌────────────┐
//!   │   Idle   │ ────────────────► │ Running │ ────────────► │ dispatchers│
//!   └──────────┘                   └─────────┘               └────────────┘
//!        ▲          record_run(now)     │                          │
//!        └──────────────────────────────┴──────────────────────────┘
//!   cancel token fired during the wait → Stopped
//! ```

use chrono::{Local, NaiveDateTime};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tvrec_proto::config::ServiceConfig;
use tvrec_proto::state::{Schedule, StateStore, UNSET_TIME_POLL_SECS};

use crate::dispatch::{CacheRefresher, Dispatcher};
use crate::notify::Notifier;

/// Minimum spacing between two cycles run by the same process.
const MIN_CYCLE_GAP_SECS: f64 = 60.0;

/// Whole seconds, rounded up, so a wake never lands before its target.
fn ceil_secs(secs: f64) -> Duration {
    Duration::from_secs(secs.max(0.0).ceil() as u64)
}

/// How long to sleep before the next cycle.
pub fn time_left(schedule: Schedule, last_run: f64, now_epoch: f64, now_local: NaiveDateTime) -> Duration {
    match schedule {
        Schedule::Interval { secs } => ceil_secs((last_run + secs as f64) - now_epoch),
        Schedule::FixedTime(Some((hour, minute))) => {
            let Some(mut next) = now_local.date().and_hms_opt(hour, minute, 0) else {
                return Duration::from_secs(UNSET_TIME_POLL_SECS);
            };
            if next <= now_local {
                next += chrono::Duration::days(1);
            }
            let left = (next - now_local).to_std().unwrap_or(Duration::ZERO);
            ceil_secs(left.as_secs_f64())
        }
        Schedule::FixedTime(None) => Duration::from_secs(UNSET_TIME_POLL_SECS),
    }
}

/// [`time_left`] using the later of the persisted and the in-process last
/// cycle, and never less than [`MIN_CYCLE_GAP_SECS`] after a cycle this
/// process ran.  Keeps the loop bounded when the state file is unwritable.
fn next_wait(
    schedule: Schedule,
    persisted: f64,
    last_cycle: Option<f64>,
    now_epoch: f64,
    now_local: NaiveDateTime,
) -> Duration {
    let last_run = last_cycle.map_or(persisted, |c| c.max(persisted));
    let wait = time_left(schedule, last_run, now_epoch, now_local);
    match last_cycle {
        Some(c) => wait.max(ceil_secs(c + MIN_CYCLE_GAP_SECS - now_epoch)),
        None => wait,
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct Scheduler {
    state: Arc<StateStore>,
    refresher: Arc<dyn CacheRefresher>,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    notifier: Arc<dyn Notifier>,
    run_on_startup: bool,
    notify_on_finish: bool,
    last_cycle: Mutex<Option<f64>>,
}

impl Scheduler {
    pub fn new(
        service: &ServiceConfig,
        state: Arc<StateStore>,
        refresher: Arc<dyn CacheRefresher>,
        dispatchers: Vec<Arc<dyn Dispatcher>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            state,
            refresher,
            dispatchers,
            notifier,
            run_on_startup: service.run_on_startup,
            notify_on_finish: service.notify_on_finish,
            last_cycle: Mutex::new(None),
        }
    }

    fn last_cycle(&self) -> Option<f64> {
        *self.last_cycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs until `cancel` fires.  Cycle failures are logged, never returned.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "scheduler: started with {} dispatchers ({})",
            self.dispatchers.len(),
            self.dispatchers
                .iter()
                .map(|d| d.name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if self.run_on_startup && !cancel.is_cancelled() {
            self.cycle(&cancel).await;
        }

        loop {
            let state = self.state.load().await;
            let wait = next_wait(
                state.schedule(),
                state.last_run(),
                self.last_cycle(),
                now_epoch(),
                Local::now().naive_local(),
            );
            info!("scheduler: waiting {}s", wait.as_secs());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.cycle(&cancel).await;
        }
        info!("scheduler: stopped");
    }

    /// Refresh, dispatch in order, then persist the run time.
    pub async fn cycle(&self, cancel: &CancellationToken) {
        info!("scheduler: update cycle starting");
        match self.refresher.refresh().await {
            Ok(()) => {
                for dispatcher in &self.dispatchers {
                    debug!("scheduler: dispatching {}", dispatcher.name());
                    if let Err(e) = dispatcher.dispatch(cancel).await {
                        warn!("scheduler: {} failed: {:#}", dispatcher.name(), e);
                    }
                }
            }
            Err(e) => warn!("scheduler: cache refresh failed, skipping dispatch: {:#}", e),
        }

        // persisted even after failures so a broken cycle cannot hot-loop
        let finished = now_epoch();
        *self.last_cycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(finished);
        if let Err(e) = self.state.record_run(finished).await {
            warn!(
                "scheduler: could not persist last run to {}: {:#}",
                self.state.path().display(),
                e
            );
        }
        info!("scheduler: update cycle finished");

        if self.notify_on_finish {
            self.notifier.notify("TV Recorder", "Finished updating").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_interval_time_left() {
        let schedule = Schedule::Interval { secs: 7200 };
        assert_eq!(
            time_left(schedule, 1000.0, 1000.0, at(0, 0, 0)),
            Duration::from_secs(7200)
        );
        assert_eq!(
            time_left(schedule, 1000.0, 5000.0, at(0, 0, 0)),
            Duration::from_secs(3200)
        );
        // overdue, or never ran
        assert_eq!(time_left(schedule, 1000.0, 99_999.0, at(0, 0, 0)), Duration::ZERO);
        assert_eq!(time_left(schedule, 0.0, 1_704_067_200.0, at(0, 0, 0)), Duration::ZERO);
    }

    #[test]
    fn test_fixed_time_today_and_tomorrow() {
        let schedule = Schedule::FixedTime(Some((3, 30)));
        assert_eq!(
            time_left(schedule, 0.0, 0.0, at(2, 30, 0)),
            Duration::from_secs(3600)
        );
        // exactly now counts as passed
        assert_eq!(
            time_left(schedule, 0.0, 0.0, at(3, 30, 0)),
            Duration::from_secs(86400)
        );
        assert_eq!(
            time_left(schedule, 0.0, 0.0, at(4, 0, 0)),
            Duration::from_secs(86400 - 1800)
        );
    }

    fn at_ms(h: u32, m: u32, s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_milli_opt(h, m, s, ms)
            .unwrap()
    }

    #[test]
    fn test_fixed_time_wakes_after_target_with_subsecond_now() {
        let schedule = Schedule::FixedTime(Some((3, 30)));
        let first = time_left(schedule, 0.0, 0.0, at_ms(2, 30, 0, 500));
        assert_eq!(first, Duration::from_secs(3600));

        // woken at 03:30:00.500, the next run is tomorrow
        let woke = at_ms(2, 30, 0, 500) + chrono::Duration::from_std(first).unwrap();
        assert_eq!(woke, at_ms(3, 30, 0, 500));
        assert_eq!(time_left(schedule, 0.0, 0.0, woke), Duration::from_secs(86400));

        // a fraction before the target still waits, never zero
        assert_eq!(
            time_left(schedule, 0.0, 0.0, at_ms(3, 29, 59, 520)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_next_wait_spaces_cycles_of_this_process() {
        let fixed = Schedule::FixedTime(Some((3, 30)));
        // a cycle 20 ms ago just before the target does not run again at once
        assert_eq!(
            next_wait(fixed, 0.0, Some(1000.0), 1000.02, at_ms(3, 29, 59, 520)),
            Duration::from_secs(60)
        );

        // in-process last cycle wins over a stale persisted value
        let interval = Schedule::Interval { secs: 7200 };
        assert_eq!(
            next_wait(interval, 0.0, Some(5000.0), 5000.0, at(0, 0, 0)),
            Duration::from_secs(7200)
        );
        assert_eq!(
            next_wait(interval, 0.0, None, 5000.0, at(0, 0, 0)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_fixed_time_unset_polls_hourly() {
        assert_eq!(
            time_left(Schedule::FixedTime(None), 0.0, 0.0, at(12, 0, 0)),
            Duration::from_secs(3600)
        );
    }

    struct FakeRefresher {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl CacheRefresher for FakeRefresher {
        async fn refresh(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("guide source unreachable");
            }
            Ok(())
        }
    }

    struct FakeDispatcher {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Dispatcher for FakeDispatcher {
        fn name(&self) -> &str {
            self.name
        }

        async fn dispatch(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} broke", self.name);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingNotifier(AtomicU32);

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _title: &str, _message: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        state: Arc<StateStore>,
        refresher: Arc<FakeRefresher>,
        log: Arc<Mutex<Vec<&'static str>>>,
        notifier: Arc<CountingNotifier>,
        _dir: tempfile::TempDir,
    }

    fn harness(service: ServiceConfig, refresh_fails: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        harness_at(service, refresh_fails, dir, state_file)
    }

    fn harness_at(
        service: ServiceConfig,
        refresh_fails: bool,
        dir: tempfile::TempDir,
        state_file: std::path::PathBuf,
    ) -> Harness {
        let state = Arc::new(StateStore::new(state_file, &service));
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicU32::new(0),
            fail: refresh_fails,
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatchers: Vec<Arc<dyn Dispatcher>> = vec![
            Arc::new(FakeDispatcher {
                name: "notifications",
                log: log.clone(),
                fail: true,
            }),
            Arc::new(FakeDispatcher {
                name: "autoplaywiths",
                log: log.clone(),
                fail: false,
            }),
        ];
        let notifier = Arc::new(CountingNotifier::default());
        let scheduler = Arc::new(Scheduler::new(
            &service,
            state.clone(),
            refresher.clone(),
            dispatchers,
            notifier.clone(),
        ));
        Harness {
            scheduler,
            state,
            refresher,
            log,
            notifier,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_cycle_dispatches_in_order_despite_failure() {
        let h = harness(
            ServiceConfig {
                notify_on_finish: true,
                ..ServiceConfig::default()
            },
            false,
        );
        h.scheduler.cycle(&CancellationToken::new()).await;
        assert_eq!(*h.log.lock().unwrap(), vec!["notifications", "autoplaywiths"]);
        assert!(h.state.load().await.last_run() > 0.0);
        assert_eq!(h.notifier.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_skips_dispatch_but_records_run() {
        let h = harness(ServiceConfig::default(), true);
        h.scheduler.cycle(&CancellationToken::new()).await;
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert!(h.log.lock().unwrap().is_empty());
        assert!(h.state.load().await.last_run() > 0.0);
        assert_eq!(h.notifier.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_loop_and_cancellation() {
        let h = harness(
            ServiceConfig {
                mode: "0".into(),
                interval: "0".into(),
                ..ServiceConfig::default()
            },
            false,
        );
        // last run just now: first wake is a full interval away
        h.state.record_run(now_epoch()).await.unwrap();

        let cancel = CancellationToken::new();
        let scheduler = h.scheduler.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritable_state_does_not_hot_loop() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let h = harness_at(
            ServiceConfig {
                mode: "0".into(),
                interval: "0".into(),
                run_on_startup: true,
                ..ServiceConfig::default()
            },
            false,
            dir,
            blocker.join("state.json"),
        );

        let cancel = CancellationToken::new();
        let scheduler = h.scheduler.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.state.load().await.last_run(), 0.0);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_startup() {
        let h = harness(
            ServiceConfig {
                run_on_startup: true,
                ..ServiceConfig::default()
            },
            false,
        );
        let cancel = CancellationToken::new();
        let scheduler = h.scheduler.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        cancel.cancel();
        task.await.unwrap();
    }
}
