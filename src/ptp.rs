//! PTP client for wall-clock correlation.
//!
//! This client does not exchange IEEE 1588 messages or run a best master
//! clock election. A periodic tick marks the clock synchronized with a zero
//! offset on its first pass and keeps the counters moving. The contract the
//! rest of the crate relies on is the interface: a monotonic timestamp, a
//! synchronized flag and an offset. RTP media timestamps are never derived
//! from it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::PtpConfig;
use crate::worker::Worker;
use crate::{POLL_INTERVAL_MS, PTP_TICK_INTERVAL_MS};

// Message cadence in ticks (2 s announce, 1 s delay request)
const ANNOUNCE_EVERY_TICKS: u64 = 20;
const DELAY_REQ_EVERY_TICKS: u64 = 10;

/// PTP client state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PtpState {
    /// Not started
    #[default]
    Disabled = 0,
    /// Started, waiting for the first tick
    Listening = 1,
    /// Synchronized
    Slave = 2,
}

impl PtpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PtpState::Disabled => "DISABLED",
            PtpState::Listening => "LISTENING",
            PtpState::Slave => "SLAVE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => PtpState::Listening,
            2 => PtpState::Slave,
            _ => PtpState::Disabled,
        }
    }
}

/// PTP statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct PtpStats {
    pub state: PtpState,
    /// Local clock identity
    pub local_clock_id: u64,
    /// Offset from master in nanoseconds
    pub offset_ns: i64,
    pub sync_count: u64,
    pub announce_count: u64,
    pub delay_req_count: u64,
    pub domain: u8,
}

impl PtpStats {
    /// One-line status, e.g. "Slave (domain 0), δ 0.0µs, Syncs: 12"
    pub fn format_display(&self) -> String {
        match self.state {
            PtpState::Disabled => "PTP: Disabled".to_string(),
            PtpState::Listening => "PTP: Listening...".to_string(),
            PtpState::Slave => format!(
                "Slave (domain {}), δ {:.1}µs, Syncs: {}",
                self.domain,
                self.offset_ns as f64 / 1_000.0,
                self.sync_count
            ),
        }
    }
}

/// Monotonic nanoseconds since the first call in this process
pub fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Convert a nanosecond timestamp to a media clock sample count
pub fn ptp_to_rtp_timestamp(timestamp_ns: u64, sample_rate: u32) -> u64 {
    (timestamp_ns as u128 * sample_rate as u128 / 1_000_000_000) as u64
}

/// State shared with the tick thread
struct PtpShared {
    state: AtomicU8,
    synchronized: AtomicBool,
    offset_ns: AtomicI64,
    sync_count: AtomicU64,
    announce_count: AtomicU64,
    delay_req_count: AtomicU64,
    /// Highest timestamp handed out, keeps `timestamp_now` from regressing
    last_timestamp_ns: AtomicU64,
}

/// Cloneable view of the client's clock state
#[derive(Clone)]
pub struct PtpClock {
    shared: Arc<PtpShared>,
}

impl PtpClock {
    pub fn is_synchronized(&self) -> bool {
        self.shared.synchronized.load(Ordering::SeqCst)
    }

    pub fn offset_from_master_ns(&self) -> i64 {
        self.shared.offset_ns.load(Ordering::SeqCst)
    }

    pub fn timestamp_now(&self) -> u64 {
        let mut now = monotonic_ns();
        if self.is_synchronized() {
            now = now.saturating_add_signed(self.offset_from_master_ns());
        }
        let prev = self
            .shared
            .last_timestamp_ns
            .fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }
}

impl std::fmt::Debug for PtpClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtpClock")
            .field("synchronized", &self.is_synchronized())
            .finish()
    }
}

pub struct PtpClient {
    config: PtpConfig,
    local_clock_id: u64,
    shared: Arc<PtpShared>,
    worker: Option<Worker>,
}

impl PtpClient {
    pub fn new(config: PtpConfig) -> Self {
        // Clock identity from the wall clock: seconds in the high word, micros in the low
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let local_clock_id = (now.as_secs() << 32) | now.subsec_micros() as u64;

        Self {
            config,
            local_clock_id,
            shared: Arc::new(PtpShared {
                state: AtomicU8::new(PtpState::Disabled as u8),
                synchronized: AtomicBool::new(false),
                offset_ns: AtomicI64::new(0),
                sync_count: AtomicU64::new(0),
                announce_count: AtomicU64::new(0),
                delay_req_count: AtomicU64::new(0),
                last_timestamp_ns: AtomicU64::new(0),
            }),
            worker: None,
        }
    }

    /// Start the tick thread. Starting while running is a no-op.
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.is_running() {
            return Ok(());
        }

        self.shared
            .state
            .store(PtpState::Listening as u8, Ordering::SeqCst);
        let shared = self.shared.clone();

        let worker = Worker::spawn("ptp-client", move |running| {
            let tick = Duration::from_millis(PTP_TICK_INTERVAL_MS);
            while running.load(Ordering::SeqCst) {
                if !shared.synchronized.swap(true, Ordering::SeqCst) {
                    shared.offset_ns.store(0, Ordering::SeqCst);
                    shared.state.store(PtpState::Slave as u8, Ordering::SeqCst);
                    log::info!("PTP synchronization established");
                }
                let syncs = shared.sync_count.fetch_add(1, Ordering::Relaxed) + 1;
                if syncs % ANNOUNCE_EVERY_TICKS == 0 {
                    shared.announce_count.fetch_add(1, Ordering::Relaxed);
                }
                if syncs % DELAY_REQ_EVERY_TICKS == 0 {
                    shared.delay_req_count.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "PTP sync active, offset {} ns",
                        shared.offset_ns.load(Ordering::Relaxed)
                    );
                }

                let mut waited = Duration::ZERO;
                while waited < tick && running.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
                    waited += Duration::from_millis(POLL_INTERVAL_MS);
                }
            }
        });

        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                log::info!(
                    "PTP client started (domain {}, clock id 0x{:016X})",
                    self.config.domain,
                    self.local_clock_id
                );
                Ok(())
            }
            Err(e) => {
                self.shared
                    .state
                    .store(PtpState::Disabled as u8, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Stop the tick thread (bounded wait) and drop synchronization
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            log::info!("PTP client stopped");
        }
        self.shared.synchronized.store(false, Ordering::SeqCst);
        self.shared
            .state
            .store(PtpState::Disabled as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| w.is_running())
    }

    pub fn is_synchronized(&self) -> bool {
        self.clock().is_synchronized()
    }

    pub fn offset_from_master_ns(&self) -> i64 {
        self.clock().offset_from_master_ns()
    }

    /// Monotonic nanoseconds, plus the master offset while synchronized.
    ///
    /// Never returns less than a previous call, even if the offset changes.
    pub fn timestamp_now(&self) -> u64 {
        self.clock().timestamp_now()
    }

    /// Read-only handle for other threads
    pub fn clock(&self) -> PtpClock {
        PtpClock {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> PtpState {
        PtpState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn local_clock_id(&self) -> u64 {
        self.local_clock_id
    }

    /// PTP domain reported in stats and logs
    pub fn set_domain(&mut self, domain: u8) {
        self.config.domain = domain;
    }

    pub fn config(&self) -> &PtpConfig {
        &self.config
    }

    pub fn stats(&self) -> PtpStats {
        PtpStats {
            state: self.state(),
            local_clock_id: self.local_clock_id,
            offset_ns: self.offset_from_master_ns(),
            sync_count: self.shared.sync_count.load(Ordering::Relaxed),
            announce_count: self.shared.announce_count.load(Ordering::Relaxed),
            delay_req_count: self.shared.delay_req_count.load(Ordering::Relaxed),
            domain: self.config.domain,
        }
    }
}

impl Drop for PtpClient {
    fn drop(&mut self) {
        self.stop();
    }
}
