//! Coalesces bursts of change notifications into one update call.
//!
//! ```text
//! notify(paths) ──> pending set ──(quiet period | batch full)──> drain
//!                                                               │
//!                                           sink.apply_changes(paths), outside the lock
//! ```

use crate::config::DebounceConfig;
use crate::coordinator::UpdateCoordinator;
use crate::error::{KeeperError, Result};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Receives a drained batch.
pub trait ChangeSink: Send + Sync {
    fn apply_changes(&self, paths: &[PathBuf]) -> anyhow::Result<bool>;
}

impl ChangeSink for UpdateCoordinator {
    fn apply_changes(&self, paths: &[PathBuf]) -> anyhow::Result<bool> {
        Ok(self.smart_update(paths))
    }
}

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// A scheduled callback that can be called off before it fires.
pub trait TimerHandle: Send {
    fn cancel(&self);
}

/// Delayed execution. Tasks may block, so implementations must not run
/// them on a latency-sensitive thread. Running a task inline from
/// `schedule` is allowed.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: TimerTask) -> Box<dyn TimerHandle>;
}

/// Sleeps on a Tokio runtime and runs the task on its blocking pool.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| KeeperError::Other(format!("no Tokio runtime available: {e}")))
    }
}

struct TokioTimer(JoinHandle<()>);

impl TimerHandle for TokioTimer {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> Box<dyn TimerHandle> {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // once started the drain runs to completion even if the timer is aborted
            let _ = tokio::task::spawn_blocking(task).await;
        });
        Box::new(TokioTimer(join))
    }
}

#[derive(Default)]
struct Pending {
    paths: BTreeSet<PathBuf>,
    timer: Option<Box<dyn TimerHandle>>,
    // bumped whenever the timer is replaced, cancelled or fires
    generation: u64,
}

impl Pending {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.generation += 1;
    }
}

enum Next {
    Drain,
    Schedule(u64),
    Idle,
}

struct Inner {
    sink: Arc<dyn ChangeSink>,
    scheduler: Arc<dyn Scheduler>,
    config: DebounceConfig,
    pending: Mutex<Pending>,
}

/// Thread-safe; clones share the same pending set.
#[derive(Clone)]
pub struct BatchDebouncer {
    inner: Arc<Inner>,
}

impl BatchDebouncer {
    pub fn new(
        sink: Arc<dyn ChangeSink>,
        scheduler: Arc<dyn Scheduler>,
        config: DebounceConfig,
    ) -> Result<Self> {
        if config.max_batch_size == 0 {
            return Err(KeeperError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                sink,
                scheduler,
                config,
                pending: Mutex::new(Pending::default()),
            }),
        })
    }

    pub fn notify<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let next = {
            let mut pending = self.inner.lock_pending();
            pending.paths.extend(paths.into_iter().map(Into::into));
            pending.cancel_timer();

            if pending.paths.len() >= self.inner.config.max_batch_size {
                Next::Drain
            } else if pending.paths.is_empty() {
                Next::Idle
            } else {
                Next::Schedule(pending.generation)
            }
        };

        // both the drain and the scheduled task take the lock themselves
        match next {
            Next::Drain => self.inner.drain(),
            Next::Schedule(generation) => self.schedule_drain(generation),
            Next::Idle => {}
        }
    }

    fn schedule_drain(&self, generation: u64) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.schedule(
            self.inner.config.quiet_period,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.timer_fired(generation);
                }
            }),
        );

        let mut pending = self.inner.lock_pending();
        if pending.generation == generation {
            pending.timer = Some(timer);
        } else {
            // superseded, or already fired
            timer.cancel();
        }
    }

    /// Drains whatever is pending right now, cancelling the timer.
    pub fn flush(&self) {
        self.inner.lock_pending().cancel_timer();
        self.inner.drain();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock_pending().paths.len()
    }

    pub fn has_pending_timer(&self) -> bool {
        self.inner.lock_pending().timer.is_some()
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn timer_fired(&self, generation: u64) {
        {
            let mut pending = self.lock_pending();
            if pending.generation != generation {
                // superseded after it had already started
                return;
            }
            pending.timer = None;
            pending.generation += 1;
        }
        self.drain();
    }

    fn drain(&self) {
        let batch: Vec<PathBuf> = {
            let mut pending = self.lock_pending();
            std::mem::take(&mut pending.paths).into_iter().collect()
        };
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.sink.apply_changes(&batch)));
        match outcome {
            Ok(Ok(true)) => log::info!("Processed batch of {count} changed path(s)"),
            Ok(Ok(false)) => log::error!("Update failed for batch of {count} changed path(s)"),
            Ok(Err(err)) => log::error!("Update error for batch of {count} path(s): {err:#}"),
            Err(_) => log::error!("Update panicked for batch of {count} changed path(s)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<PathBuf>>>,
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<Vec<PathBuf>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl ChangeSink for RecordingSink {
        fn apply_changes(&self, paths: &[PathBuf]) -> anyhow::Result<bool> {
            self.batches.lock().unwrap().push(paths.to_vec());
            Ok(true)
        }
    }

    struct ManualTimer {
        cancelled: Arc<AtomicBool>,
    }

    impl TimerHandle for ManualTimer {
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Fires scheduled tasks only when the test asks it to.
    #[derive(Default)]
    struct ManualScheduler {
        scheduled: Mutex<Vec<(Duration, Arc<AtomicBool>, Option<TimerTask>)>>,
    }

    impl ManualScheduler {
        fn live_timers(&self) -> usize {
            self.scheduled
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, cancelled, task)| {
                    !cancelled.load(Ordering::SeqCst) && task.is_some()
                })
                .count()
        }

        fn delays(&self) -> Vec<Duration> {
            self.scheduled.lock().unwrap().iter().map(|(d, _, _)| *d).collect()
        }

        fn fire_live(&self) {
            self.fire(false);
        }

        /// Also runs cancelled timers, as if the cancel lost the race.
        fn fire_all(&self) {
            self.fire(true);
        }

        fn fire(&self, include_cancelled: bool) {
            let tasks: Vec<TimerTask> = {
                let mut scheduled = self.scheduled.lock().unwrap();
                scheduled
                    .iter_mut()
                    .filter(|(_, cancelled, _)| {
                        include_cancelled || !cancelled.load(Ordering::SeqCst)
                    })
                    .filter_map(|(_, _, task)| task.take())
                    .collect()
            };
            for task in tasks {
                task();
            }
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, delay: Duration, task: TimerTask) -> Box<dyn TimerHandle> {
            let cancelled = Arc::new(AtomicBool::new(false));
            self.scheduled
                .lock()
                .unwrap()
                .push((delay, cancelled.clone(), Some(task)));
            Box::new(ManualTimer { cancelled })
        }
    }

    fn debouncer(
        max_batch_size: usize,
    ) -> (BatchDebouncer, Arc<RecordingSink>, Arc<ManualScheduler>) {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let debouncer = BatchDebouncer::new(
            sink.clone(),
            scheduler.clone(),
            DebounceConfig {
                quiet_period: Duration::from_secs(2),
                max_batch_size,
            },
        )
        .unwrap();
        (debouncer, sink, scheduler)
    }

    #[test]
    fn rapid_notifications_coalesce_into_one_drain() {
        let (debouncer, sink, scheduler) = debouncer(10);
        debouncer.notify(["a.py"]);
        debouncer.notify(["b.py", "a.py"]);
        debouncer.notify(vec![PathBuf::from("c.rs")]);

        assert_eq!(scheduler.live_timers(), 1);
        assert_eq!(scheduler.delays(), vec![Duration::from_secs(2); 3]);
        assert!(sink.batches().is_empty());
        assert_eq!(debouncer.pending_len(), 3);

        scheduler.fire_live();
        assert_eq!(
            sink.batches(),
            vec![vec![
                PathBuf::from("a.py"),
                PathBuf::from("b.py"),
                PathBuf::from("c.rs"),
            ]]
        );
        assert_eq!(debouncer.pending_len(), 0);
        assert!(!debouncer.has_pending_timer());
    }

    #[test]
    fn full_batch_drains_synchronously() {
        let (debouncer, sink, scheduler) = debouncer(3);
        debouncer.notify(["a.py", "b.py", "c.py"]);

        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.batches()[0].len(), 3);
        assert!(!debouncer.has_pending_timer());
        assert_eq!(scheduler.live_timers(), 0);
    }

    #[test]
    fn batch_threshold_counts_accumulated_paths() {
        let (debouncer, sink, scheduler) = debouncer(3);
        debouncer.notify(["a.py", "b.py"]);
        assert_eq!(scheduler.live_timers(), 1);
        debouncer.notify(["c.py"]);

        assert_eq!(sink.batches().len(), 1);
        assert_eq!(scheduler.live_timers(), 0);
        scheduler.fire_all();
        assert_eq!(sink.batches().len(), 1);
    }

    #[test]
    fn superseded_timer_that_fires_late_does_not_drain() {
        let (debouncer, sink, scheduler) = debouncer(10);
        debouncer.notify(["a.py"]);
        debouncer.notify(["b.py"]);

        // first timer was cancelled but runs anyway; only the live one drains
        scheduler.fire_all();
        assert_eq!(
            sink.batches(),
            vec![vec![PathBuf::from("a.py"), PathBuf::from("b.py")]]
        );
        assert!(!debouncer.has_pending_timer());
    }

    #[test]
    fn empty_notification_schedules_nothing() {
        let (debouncer, sink, scheduler) = debouncer(3);
        debouncer.notify(Vec::<PathBuf>::new());
        assert_eq!(scheduler.live_timers(), 0);
        debouncer.flush();
        assert!(sink.batches().is_empty());
    }

    #[test]
    fn flush_drains_and_cancels_timer() {
        let (debouncer, sink, scheduler) = debouncer(10);
        debouncer.notify(["a.py"]);
        debouncer.flush();
        assert_eq!(sink.batches(), vec![vec![PathBuf::from("a.py")]]);
        assert_eq!(scheduler.live_timers(), 0);
    }

    #[test]
    fn failing_sink_does_not_escape_drain() {
        struct PanickingSink;
        impl ChangeSink for PanickingSink {
            fn apply_changes(&self, _paths: &[PathBuf]) -> anyhow::Result<bool> {
                panic!("pipeline exploded");
            }
        }

        let debouncer = BatchDebouncer::new(
            Arc::new(PanickingSink),
            Arc::new(ManualScheduler::default()),
            DebounceConfig {
                quiet_period: Duration::from_secs(1),
                max_batch_size: 1,
            },
        )
        .unwrap();
        debouncer.notify(["a.py"]);
        debouncer.notify(["b.py"]);
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = BatchDebouncer::new(
            Arc::new(RecordingSink::default()),
            Arc::new(ManualScheduler::default()),
            DebounceConfig {
                quiet_period: Duration::from_secs(1),
                max_batch_size: 0,
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, KeeperError::InvalidConfig(_)));
    }

    /// Runs every task before `schedule` returns.
    struct InlineScheduler;

    impl Scheduler for InlineScheduler {
        fn schedule(&self, _delay: Duration, task: TimerTask) -> Box<dyn TimerHandle> {
            task();
            Box::new(ManualTimer {
                cancelled: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[test]
    fn scheduler_may_run_the_task_inline() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = BatchDebouncer::new(
            sink.clone(),
            Arc::new(InlineScheduler),
            DebounceConfig {
                quiet_period: Duration::ZERO,
                max_batch_size: 10,
            },
        )
        .unwrap();

        debouncer.notify(["a.py"]);
        debouncer.notify(["b.py"]);
        assert_eq!(
            sink.batches(),
            vec![vec![PathBuf::from("a.py")], vec![PathBuf::from("b.py")]]
        );
        assert!(!debouncer.has_pending_timer());
        assert_eq!(debouncer.pending_len(), 0);
    }

    /// Holds every drain inside the sink until released.
    struct GatedSink {
        entered: Mutex<mpsc::Sender<Vec<PathBuf>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ChangeSink for GatedSink {
        fn apply_changes(&self, paths: &[PathBuf]) -> anyhow::Result<bool> {
            self.entered.lock().unwrap().send(paths.to_vec())?;
            self.release.lock().unwrap().recv()?;
            Ok(true)
        }
    }

    #[test]
    fn notify_is_not_blocked_by_a_running_drain() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let scheduler = Arc::new(ManualScheduler::default());
        let debouncer = BatchDebouncer::new(
            Arc::new(GatedSink {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
            scheduler.clone(),
            DebounceConfig {
                quiet_period: Duration::from_secs(2),
                max_batch_size: 2,
            },
        )
        .unwrap();

        let draining = {
            let debouncer = debouncer.clone();
            thread::spawn(move || debouncer.notify(["a.py", "b.py"]))
        };
        let first = entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, vec![PathBuf::from("a.py"), PathBuf::from("b.py")]);

        // the first batch is still inside the sink
        let (done_tx, done_rx) = mpsc::channel();
        {
            let debouncer = debouncer.clone();
            thread::spawn(move || {
                debouncer.notify(["c.py"]);
                let _ = done_tx.send(());
            });
        }
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("notify waited for the drain");
        assert_eq!(debouncer.pending_len(), 1);
        assert!(debouncer.has_pending_timer());

        release_tx.send(()).unwrap();
        draining.join().unwrap();

        release_tx.send(()).unwrap();
        scheduler.fire_live();
        let second = entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second, vec![PathBuf::from("c.py")]);
    }

    #[test]
    fn concurrent_bursts_lose_no_paths() {
        let (debouncer, sink, _scheduler) = debouncer(16);
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let debouncer = debouncer.clone();
                thread::spawn(move || {
                    for n in 0..50 {
                        debouncer.notify([format!("w{worker}/f{n}.rs")]);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        debouncer.flush();

        let batches = sink.batches();
        let delivered: Vec<PathBuf> = batches.iter().flatten().cloned().collect();
        let unique: HashSet<&PathBuf> = delivered.iter().collect();
        assert_eq!(delivered.len(), 400);
        assert_eq!(unique.len(), 400);
        assert!(batches.iter().all(|batch| !batch.is_empty()));
        assert_eq!(debouncer.pending_len(), 0);
    }
}
