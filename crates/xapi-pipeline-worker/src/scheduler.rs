use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

/// Cooperative stop flag shared by every worker thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, wake) = &*self.inner;
        if let Ok(mut triggered) = flag.lock() {
            *triggered = true;
        }
        wake.notify_all();
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        let (flag, _) = &*self.inner;
        flag.lock().map_or(true, |triggered| *triggered)
    }

    /// Sleeps up to `timeout`, returning early with `true` once triggered.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let Ok(mut triggered) = flag.lock() else {
            return true;
        };

        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            triggered = match wake.wait_timeout(triggered, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return true,
            };
        }
        true
    }
}

/// Doubling delay between `initial` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    /// Delay the next failure will wait, without advancing.
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.next
    }
}

/// Runs `task` now and then every `interval` until `shutdown` fires.
/// A failing run is logged and the loop keeps its schedule.
pub fn run_periodic<F>(name: &str, interval: Duration, shutdown: &ShutdownSignal, mut task: F) -> usize
where
    F: FnMut() -> Result<()>,
{
    let mut runs = 0;
    tracing::info!(task = name, interval_secs = interval.as_secs(), "periodic task started");

    while !shutdown.is_triggered() {
        runs += 1;
        if let Err(err) = task() {
            tracing::error!(task = name, run = runs, error = %format!("{err:#}"), "periodic task failed");
        }
        if shutdown.wait_timeout(interval) {
            break;
        }
    }

    tracing::info!(task = name, runs, "periodic task stopped");
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));

        assert_eq!(backoff.peek(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn wait_timeout_returns_false_when_not_triggered() {
        let signal = ShutdownSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn trigger_wakes_waiters_on_clones() {
        let signal = ShutdownSignal::new();
        let remote = signal.clone();
        let handle = std::thread::spawn(move || remote.wait_timeout(Duration::from_secs(10)));

        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();

        match handle.join() {
            Ok(woke) => assert!(woke),
            Err(_) => panic!("test failure: waiter panicked"),
        }
        assert!(signal.is_triggered());
    }

    #[test]
    fn periodic_task_survives_failures_and_stops_on_shutdown() {
        let signal = ShutdownSignal::new();
        let stopper = signal.clone();
        let mut calls = 0;

        let runs = run_periodic("test", Duration::from_millis(1), &signal, || {
            calls += 1;
            if calls == 3 {
                stopper.trigger();
            }
            if calls % 2 == 1 {
                Err(anyhow!("scan failed"))
            } else {
                Ok(())
            }
        });

        assert_eq!(runs, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn periodic_task_does_not_run_after_shutdown() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let runs = run_periodic("test", Duration::from_secs(60), &signal, || Ok(()));
        assert_eq!(runs, 0);
    }
}
