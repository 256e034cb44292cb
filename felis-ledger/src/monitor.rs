use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Monitor a task which may take a long time, and log messages as needed.
/// After SILENT_INTERVAL: log activity
/// After each LOG_INTERVAL: log activity and duration
pub struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(move || {
            WaitMonitor::run(done, activity);
        });
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            if done.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(next_log.saturating_duration_since(Instant::now()));
            if done.load(Ordering::Relaxed) {
                break;
            }
            let elapsed = next_log.duration_since(start);
            if elapsed < Self::LOG_INTERVAL {
                tracing::info!("{}", activity);
            } else {
                tracing::info!("{} ({} s)", activity, elapsed.as_secs());
            }
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub fn done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}
