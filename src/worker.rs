//! Background thread with a cooperative stop flag and a bounded join.
//!
//! Every loop in the crate (sender, SAP, PTP tick) runs on one of these. The
//! thread body receives the shared `running` flag and must return soon after
//! it goes false. `stop` waits at most `timeout` for that to happen and
//! otherwise detaches the thread, so shutdown never hangs the caller.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{JOIN_TIMEOUT_MS, POLL_INTERVAL_MS};

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Thread exited and was joined
    Joined,
    /// Thread did not exit in time and was left to finish on its own
    Detached,
    /// Nothing was running
    NotRunning,
}

pub struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl Worker {
    /// Spawn a named thread running `body(running)`
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))?;

        Ok(Self {
            name: name.to_string(),
            running,
            handle: Some(handle),
            join_timeout: Duration::from_millis(JOIN_TIMEOUT_MS),
        })
    }

    /// Override the bounded join wait
    #[cfg(test)]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// True until `stop` is called or the body has returned
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Clear the running flag and wait (bounded) for the thread to exit
    pub fn stop(&mut self) -> StopOutcome {
        self.running.store(false, Ordering::SeqCst);

        let handle = match self.handle.take() {
            Some(h) => h,
            None => return StopOutcome::NotRunning,
        };

        let deadline = Instant::now() + self.join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "{} thread did not exit within {} ms, detaching",
                    self.name,
                    self.join_timeout.as_millis()
                );
                // Dropping the handle detaches the thread
                return StopOutcome::Detached;
            }
            thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }

        if handle.join().is_err() {
            log::warn!("{} thread panicked", self.name);
        }
        StopOutcome::Joined
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
