//! Monotonic watchdog.
//!
//! A background thread samples the time since the last kick on a fixed
//! schedule and invokes the registered callback once per overrun tick.
//! After the callback runs the watchdog re-arms itself, so a wedged process
//! gets exactly one full timeout between escalations. The sampling schedule
//! is absolute (each tick is computed from the previous deadline, not from
//! wakeup time) so the loop does not drift.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Called on overrun with the time elapsed since the last kick.
pub type WatchdogCallback = Box<dyn Fn(Duration) + Send + 'static>;

struct WdState {
    last_kick: Instant,
    timeout: Duration,
    stop: bool,
}

struct Inner {
    state: Mutex<WdState>,
    cv: Condvar,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, WdState> {
        self.state.lock().expect("watchdog lock poisoned")
    }
}

/// Cheap cloneable handle for kicking from worker threads.
#[derive(Clone)]
pub struct WatchdogHandle {
    inner: Arc<Inner>,
}

impl WatchdogHandle {
    /// Resets the timeout countdown.
    pub fn kick(&self) {
        self.inner.lock().last_kick = Instant::now();
    }

    /// Replaces the timeout. Does not kick.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().timeout = timeout;
    }
}

pub struct Watchdog {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts a watchdog that checks every `interval` whether more than
    /// `timeout` has passed since the last kick.
    pub fn new(
        interval: Duration,
        timeout: Duration,
        callback: WatchdogCallback,
    ) -> std::io::Result<Watchdog> {
        assert!(!interval.is_zero(), "watchdog interval must be nonzero");
        assert!(!timeout.is_zero(), "watchdog timeout must be nonzero");

        let inner = Arc::new(Inner {
            state: Mutex::new(WdState {
                last_kick: Instant::now(),
                timeout,
                stop: false,
            }),
            cv: Condvar::new(),
        });

        let monitor = inner.clone();
        let thread = std::thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    next += interval;

                    let (elapsed, timeout) = {
                        let state = monitor.lock();
                        if state.stop {
                            break;
                        }
                        (state.last_kick.elapsed(), state.timeout)
                    };

                    if elapsed > timeout {
                        callback(elapsed);
                        // Re-arm: one full timeout before the next escalation.
                        monitor.lock().last_kick = Instant::now();
                    }

                    let mut state = monitor.lock();
                    loop {
                        if state.stop {
                            return;
                        }
                        let now = Instant::now();
                        if now >= next {
                            break;
                        }
                        let (guard, _) = monitor
                            .cv
                            .wait_timeout(state, next - now)
                            .expect("watchdog lock poisoned");
                        state = guard;
                    }
                }
            })?;

        Ok(Watchdog { inner, thread: Some(thread) })
    }

    pub fn handle(&self) -> WatchdogHandle {
        WatchdogHandle { inner: self.inner.clone() }
    }

    /// Resets the timeout countdown.
    pub fn kick(&self) {
        self.inner.lock().last_kick = Instant::now();
    }

    /// Replaces the timeout. Does not kick.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().timeout = timeout;
    }

    /// Stops the monitor thread and waits for it to exit.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.inner.lock();
            state.stop = true;
        }
        self.inner.cv.notify_all();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
