use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Generates a random timeout within the given inclusive range
pub fn random_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// How long a [`Timer`] waits before firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDuration {
    Fixed(Duration),
    /// Inclusive range, sampled in whole milliseconds every time the timer is armed.
    Range { min: Duration, max: Duration },
}

impl TimerDuration {
    pub fn range_ms(min_ms: u64, max_ms: u64) -> Self {
        TimerDuration::Range {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    pub fn sample(&self) -> Duration {
        match *self {
            TimerDuration::Fixed(duration) => duration,
            TimerDuration::Range { min, max } => {
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                if max_ms <= min_ms {
                    return min;
                }
                random_timeout(min_ms, max_ms)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Once,
    Indefinite,
}

/// Shared between the timer and its sleeping task. Every arm and every cancel
/// bumps `generation`, so a task (or an event it already posted) from an older
/// schedule can always be told apart from the live one.
#[derive(Debug, Default)]
struct Schedule {
    generation: u64,
    running: bool,
}

type Callback = Arc<dyn Fn(u64) + Send + Sync>;

/// One-shot or repeating timer backed by a spawned tokio task.
///
/// The callback receives the generation of the schedule that fired. Owners that
/// route firings through a queue should check it with [`Timer::accept`] before
/// acting, since a firing may already be queued when the timer is canceled.
pub struct Timer {
    duration: TimerDuration,
    callback: Callback,
    mode: Option<Mode>,
    schedule: Arc<Mutex<Schedule>>,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new<F>(duration: TimerDuration, callback: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Self {
            duration,
            callback: Arc::new(callback),
            mode: None,
            schedule: Arc::new(Mutex::new(Schedule::default())),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.schedule).running
    }

    /// Generation of the most recent schedule.
    pub fn generation(&self) -> u64 {
        lock(&self.schedule).generation
    }

    /// Returns true if a firing tagged with `generation` belongs to the live schedule.
    pub fn accept(&self, generation: u64) -> bool {
        lock(&self.schedule).generation == generation
    }

    /// Fire once after a sampled delay.
    pub fn once(&mut self) {
        self.abort_task();
        self.mode = Some(Mode::Once);
        let generation = self.arm();
        let delay = self.duration.sample();
        let schedule = self.schedule.clone();
        let callback = self.callback.clone();

        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut schedule = lock(&schedule);
                if schedule.generation != generation {
                    return;
                }
                schedule.running = false;
            }
            callback(generation);
        }));
    }

    /// Fire repeatedly. The period is sampled once per call, not per tick.
    pub fn indefinite(&mut self) {
        self.abort_task();
        self.mode = Some(Mode::Indefinite);
        let generation = self.arm();
        let period = self.duration.sample().max(Duration::from_millis(1));
        let schedule = self.schedule.clone();
        let callback = self.callback.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if lock(&schedule).generation != generation {
                    return;
                }
                callback(generation);
            }
        }));
    }

    /// Cancel and re-arm in the last used mode. Does nothing if never armed.
    pub fn reset(&mut self) {
        match self.mode {
            None => {}
            Some(Mode::Once) => {
                self.cancel();
                self.once();
            }
            Some(Mode::Indefinite) => {
                self.cancel();
                self.indefinite();
            }
        }
    }

    /// Stop any pending or repeating firing. Safe to call at any time.
    pub fn cancel(&mut self) -> &mut Self {
        {
            let mut schedule = lock(&self.schedule);
            schedule.generation += 1;
            schedule.running = false;
        }
        self.abort_task();
        self
    }

    fn arm(&mut self) -> u64 {
        let mut schedule = lock(&self.schedule);
        schedule.generation += 1;
        schedule.running = true;
        schedule.generation
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.abort_task();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("duration", &self.duration)
            .field("mode", &self.mode)
            .field("schedule", &*lock(&self.schedule))
            .finish()
    }
}

fn lock(schedule: &Mutex<Schedule>) -> MutexGuard<'_, Schedule> {
    schedule.lock().unwrap_or_else(PoisonError::into_inner)
}
