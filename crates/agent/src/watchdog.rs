use crate::link::AgentLink;
use framehook_core::{log_info, log_warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Manual-reset event the entry point blocks on until the agent must unload.
#[derive(Default)]
pub struct ExitSignal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that actually set the signal.
    pub fn set(&self) -> bool {
        let mut set = self.set.lock();
        if *set {
            return false;
        }
        *set = true;
        self.cond.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Returns whether the signal was set before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            self.cond.wait_for(&mut set, timeout);
        }
        *set
    }
}

/// Pings the controller periodically and raises the exit signal once it stops answering.
///
/// Each cycle waits half the interval, then allows the rest of it for the pong,
/// so a controller that goes silent is noticed within one `interval`.
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Watchdog {
    const STEP: Duration = Duration::from_millis(10);

    /// Splits `interval` into the idle wait and the pong timeout.
    fn cycle(interval: Duration) -> (Duration, Duration) {
        let idle = interval / 2;
        (idle, interval - idle)
    }

    pub fn start(link: Arc<dyn AgentLink>, exit: Arc<ExitSignal>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("framehook-watchdog".into())
            .spawn(move || {
                let (idle, timeout) = Self::cycle(interval);
                'outer: loop {
                    let mut waited = Duration::ZERO;
                    while waited < idle {
                        if thread_stop.load(Ordering::Acquire) {
                            break 'outer;
                        }
                        thread::sleep(Self::STEP);
                        waited += Self::STEP;
                    }
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }

                    // Agent lines are buffered on render threads; this is the only
                    // steady writer while a session runs.
                    let _ = framehook_core::logger::flush_logs();

                    if let Err(e) = link.ping(timeout) {
                        log_warn!("Controller stopped answering: {}", e);
                        if exit.set() {
                            log_info!("Watchdog requested agent shutdown");
                        }
                        break;
                    }
                }
            })
            .ok();

        if handle.is_none() {
            log_warn!("Failed to spawn watchdog thread");
        }

        Self {
            stop,
            handle: Mutex::new(handle),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::ScriptedLink;
    use std::time::Instant;

    #[test]
    fn signal_reports_first_setter_only() {
        let signal = ExitSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn failed_ping_sets_exit() {
        let link = Arc::new(ScriptedLink::failing_after(2));
        let exit = Arc::new(ExitSignal::new());
        let watchdog = Watchdog::start(link.clone(), exit.clone(), Duration::from_millis(20));

        assert!(exit.wait_timeout(Duration::from_secs(2)));
        assert_eq!(link.pings(), 3);
        watchdog.stop();
    }

    #[test]
    fn cycle_fits_in_one_interval() {
        for ms in [1, 50, 999, 1000] {
            let interval = Duration::from_millis(ms);
            let (idle, timeout) = Watchdog::cycle(interval);
            assert_eq!(idle + timeout, interval);
        }
    }

    #[test]
    fn silent_controller_is_detected_within_one_interval() {
        let interval = Duration::from_millis(300);
        let link = Arc::new(ScriptedLink::silent());
        let exit = Arc::new(ExitSignal::new());

        let started = Instant::now();
        let watchdog = Watchdog::start(link.clone(), exit.clone(), interval);
        assert!(exit.wait_timeout(Duration::from_secs(2)));
        let elapsed = started.elapsed();
        watchdog.stop();

        assert!(elapsed <= interval + Duration::from_millis(100), "took {:?}", elapsed);
        assert_eq!(link.pings(), 1);
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let link = Arc::new(ScriptedLink::healthy());
        let exit = Arc::new(ExitSignal::new());
        let watchdog = Watchdog::start(link, exit.clone(), Duration::from_secs(5));

        let started = Instant::now();
        watchdog.stop();
        watchdog.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!exit.is_set());
    }
}
