//! # Playback Timer
//!
//! A restartable, pausable elapsed-time accumulator. Every backend owns one
//! per playback session and uses it to track position independently of the
//! engine's own (possibly high-latency) position reporting; authoritative
//! positions read from the engine are folded back in via [`Timer::set_passed`]
//! (resync).
//!
//! Lifetime is one playback session: backends drop and recreate the timer on
//! every track switch. [`Timer::stop`] is terminal; a stopped timer cannot be
//! restarted.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Callback invoked on every tick while the timer is running, with the
/// current accumulated value.
pub type TickFn = Box<dyn Fn(Duration) + Send + Sync>;

#[derive(Default)]
struct TimerState {
    /// Accumulated time from completed run segments.
    base: Duration,
    /// Start of the current run segment; `Some` iff running.
    run_started: Option<Instant>,
    /// First `run()` instant, for wall-clock runtime accounting.
    first_run: Option<Instant>,
    stopped: bool,
}

impl TimerState {
    fn passed(&self) -> Duration {
        self.base
            + self
                .run_started
                .map(|started| started.elapsed())
                .unwrap_or_default()
    }
}

/// Restartable stopwatch with a tick callback.
///
/// The tick loop runs on its own tokio task; the callback's job (assigned by
/// the owning backend) is to push the elapsed value onto the backend's time
/// stream with a non-blocking send.
pub struct Timer {
    state: Arc<Mutex<TimerState>>,
    cancel: CancellationToken,
}

impl Timer {
    /// Create the timer and start its tick loop (initially paused).
    pub fn new(tick_interval: Duration, on_tick: TickFn) -> Self {
        let state = Arc::new(Mutex::new(TimerState::default()));
        let cancel = CancellationToken::new();

        let tick_state = Arc::clone(&state);
        let tick_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let passed = {
                            let state = tick_state.lock();
                            if state.run_started.is_none() {
                                continue;
                            }
                            state.passed()
                        };
                        on_tick(passed);
                    }
                }
            }
        });

        Self { state, cancel }
    }

    /// Begin or resume accumulation. No-op while already running or after
    /// [`Timer::stop`].
    pub fn run(&self) {
        let mut state = self.state.lock();
        if state.stopped || state.run_started.is_some() {
            return;
        }
        let now = Instant::now();
        state.run_started = Some(now);
        state.first_run.get_or_insert(now);
    }

    /// Freeze accumulation. The next [`Timer::run`] resumes from the frozen
    /// value. Idempotent.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if let Some(started) = state.run_started.take() {
            state.base += started.elapsed();
        }
    }

    /// Terminate the tick loop. The timer is not reusable afterward.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if let Some(started) = state.run_started.take() {
                state.base += started.elapsed();
            }
            state.stopped = true;
        }
        self.cancel.cancel();
    }

    /// Overwrite the accumulated value without changing the run/pause state.
    /// Used on seek and when resyncing against an authoritative position.
    pub fn set_passed(&self, passed: Duration) {
        let mut state = self.state.lock();
        state.base = passed;
        if state.run_started.is_some() {
            state.run_started = Some(Instant::now());
        }
    }

    /// Current accumulated value, readable in any state.
    pub fn passed(&self) -> Duration {
        self.state.lock().passed()
    }

    /// Wall-clock time since the first `run()`, regardless of pauses.
    pub fn actual_runtime(&self) -> Duration {
        self.state
            .lock()
            .first_run
            .map(|first| first.elapsed())
            .unwrap_or_default()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    fn noop() -> TickFn {
        Box::new(|_| {})
    }

    #[tokio::test(start_paused = true)]
    async fn test_passed_advances_while_running() {
        let timer = Timer::new(Duration::from_millis(200), noop());
        timer.run();
        advance(Duration::from_secs(1)).await;
        assert_eq!(timer.passed(), Duration::from_secs(1));
        advance(Duration::from_secs(1)).await;
        assert_eq!(timer.passed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_accumulation() {
        let timer = Timer::new(Duration::from_millis(200), noop());
        timer.run();
        advance(Duration::from_millis(500)).await;
        timer.pause();
        let frozen = timer.passed();
        assert_eq!(frozen, Duration::from_millis(500));

        advance(Duration::from_secs(2)).await;
        assert_eq!(timer.passed(), frozen);

        // Double pause must not double-freeze.
        timer.pause();
        assert_eq!(timer.passed(), frozen);

        timer.run();
        advance(Duration::from_millis(250)).await;
        assert_eq!(timer.passed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_while_running_is_noop() {
        let timer = Timer::new(Duration::from_millis(200), noop());
        timer.run();
        advance(Duration::from_millis(300)).await;
        timer.run();
        advance(Duration::from_millis(300)).await;
        assert_eq!(timer.passed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_passed_keeps_run_state() {
        let timer = Timer::new(Duration::from_millis(200), noop());
        timer.run();
        advance(Duration::from_secs(5)).await;
        timer.set_passed(Duration::from_secs(60));
        assert_eq!(timer.passed(), Duration::from_secs(60));

        // Still running: accumulation continues from the new value.
        advance(Duration::from_secs(1)).await;
        assert_eq!(timer.passed(), Duration::from_secs(61));

        timer.pause();
        timer.set_passed(Duration::from_secs(10));
        advance(Duration::from_secs(1)).await;
        // Still paused: the overwritten value is frozen.
        assert_eq!(timer.passed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_terminal() {
        let timer = Timer::new(Duration::from_millis(200), noop());
        timer.run();
        advance(Duration::from_secs(1)).await;
        timer.stop();
        let at_stop = timer.passed();

        timer.run();
        advance(Duration::from_secs(1)).await;
        assert_eq!(timer.passed(), at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_while_running() {
        let timer = Timer::new(Duration::from_millis(200), noop());
        timer.run();
        let mut last = timer.passed();
        for _ in 0..10 {
            advance(Duration::from_millis(100)).await;
            let now = timer.passed();
            assert!(now >= last);
            last = now;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_callback_reports_passed() {
        let (tx, mut rx) = mpsc::channel(16);
        let timer = Timer::new(
            Duration::from_millis(200),
            Box::new(move |passed| {
                let _ = tx.try_send(passed);
            }),
        );
        timer.run();
        advance(Duration::from_millis(400)).await;
        tokio::task::yield_now().await;

        let first = rx.recv().await.expect("tick expected");
        assert!(first <= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_actual_runtime_ignores_pauses() {
        let timer = Timer::new(Duration::from_millis(200), noop());
        timer.run();
        advance(Duration::from_secs(1)).await;
        timer.pause();
        advance(Duration::from_secs(1)).await;
        assert_eq!(timer.passed(), Duration::from_secs(1));
        assert_eq!(timer.actual_runtime(), Duration::from_secs(2));
    }
}
