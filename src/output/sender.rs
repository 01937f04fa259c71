//! Sender loop: drain the ring buffer, convert, packetize, transmit.
//!
//! One [`SenderCore`] lives on the sender thread and owns everything the loop
//! mutates (RTP state, converter, PLL, per-packet buffers). Everything shared
//! with the controlling thread sits in [`SenderShared`].

use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use super::rtp::{RtpPacketBuilder, RTP_HEADER_LEN};
use crate::config::{AudioFormat, ProcessingConfig, StreamConfig};
use crate::convert::{ConvertConfig, SampleConverter};
use crate::pll::{CorrectionAccumulator, SoftwarePll};
use crate::ptp::{monotonic_ns, PtpClock};
use crate::ringbuffer::RingBuffer;
use crate::{POLL_INTERVAL_MS, RING_BUFFER_PACKETS, SILENCE_THRESHOLD};

/// Minimum spacing of PLL correction log lines
const PLL_LOG_INTERVAL_NS: u64 = 5_000_000_000;

/// Sleep after an empty read or a silent block
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Where packets go. `UdpSocket` in production, mocks in tests.
pub trait PacketSink: Send {
    fn send_packet(&self, packet: &[u8], dest: SocketAddrV4) -> io::Result<usize>;
}

impl PacketSink for UdpSocket {
    fn send_packet(&self, packet: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.send_to(packet, dest)
    }
}

impl<T: PacketSink + Sync + ?Sized> PacketSink for Arc<T> {
    fn send_packet(&self, packet: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        (**self).send_packet(packet, dest)
    }
}

/// Statistics for the sender (atomic for lock-free access)
#[derive(Default)]
pub(crate) struct AtomicStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub silent_skips: AtomicU64,
    pub empty_reads: AtomicU64,
    pub partial_reads: AtomicU64,
    /// Bytes the ring discarded because the producer outran the sender
    pub overflow_bytes: AtomicU64,
    /// Current PLL correction (ppm scaled by 1000)
    pub pll_ppm_x1000: AtomicI64,
    /// PTP time at the last successful send (0 = unsynchronized)
    pub last_ptp_time_ns: AtomicU64,
}

/// Statistics snapshot for external access
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SenderStats {
    /// Packets transmitted
    pub packets_sent: u64,
    /// Bytes transmitted (RTP header included)
    pub bytes_sent: u64,
    /// Transmission errors
    pub send_errors: u64,
    /// Blocks skipped because they were silent
    pub silent_skips: u64,
    /// Iterations that found the ring empty
    pub empty_reads: u64,
    /// Blocks padded with silence after a short read
    pub partial_reads: u64,
    /// Queued bytes discarded on ring overflow
    pub overflow_bytes: u64,
    /// Current PLL correction in ppm
    pub pll_correction_ppm: f64,
    /// PTP time of the last packet sent, in ns (0 if PTP was not synchronized)
    pub last_ptp_time_ns: u64,
}

impl AtomicStats {
    pub fn snapshot(&self) -> SenderStats {
        SenderStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            silent_skips: self.silent_skips.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            partial_reads: self.partial_reads.load(Ordering::Relaxed),
            overflow_bytes: self.overflow_bytes.load(Ordering::Relaxed),
            pll_correction_ppm: self.pll_ppm_x1000.load(Ordering::Relaxed) as f64 / 1000.0,
            last_ptp_time_ns: self.last_ptp_time_ns.load(Ordering::Relaxed),
        }
    }
}

/// Ring capacity for a format: 256 packet periods of float input
pub(crate) fn ring_capacity(format: &AudioFormat) -> usize {
    format.float_block_bytes() * RING_BUFFER_PACKETS
}

/// State shared between the controlling thread and the sender thread
pub(crate) struct SenderShared {
    /// Read once per iteration. The ring is only swapped while this is write-locked.
    pub config: RwLock<StreamConfig>,
    pub ring: RwLock<RingBuffer>,
    pub active: AtomicBool,
    pub stats: AtomicStats,
}

impl SenderShared {
    pub fn new(config: StreamConfig) -> Self {
        let ring = RingBuffer::new(ring_capacity(&config.format));
        Self {
            config: RwLock::new(config),
            ring: RwLock::new(ring),
            active: AtomicBool::new(false),
            stats: AtomicStats::default(),
        }
    }

    /// Switch to a new audio format. Queued audio is in the old layout and is discarded.
    pub fn apply_format(&self, format: AudioFormat) {
        let mut config = self.config.write();
        if config.format == format {
            return;
        }
        config.format = format;
        *self.ring.write() = RingBuffer::new(ring_capacity(&format));
    }

    /// Queue whole frames of producer audio, returning the trailing bytes ignored.
    ///
    /// The frame size and the ring are read under one config guard, so a
    /// concurrent format change cannot put old-layout bytes in the new ring.
    pub fn push_frames(&self, data: &[u8]) -> usize {
        let config = self.config.read();
        let frame_bytes = config.format.frame_bytes();
        let usable = data.len() - data.len() % frame_bytes;
        if usable > 0 {
            self.push_audio(&data[..usable]);
        }
        drop(config);
        data.len() - usable
    }

    /// Queue producer audio, counting anything the ring had to drop
    pub fn push_audio(&self, data: &[u8]) {
        let dropped = self.ring.read().write(data);
        if dropped > 0 {
            self.stats
                .overflow_bytes
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }
}

/// Per-packet working buffers, always sized together from one format
#[derive(Debug, Default)]
pub(crate) struct PacketBuffers {
    /// One packet of interleaved float input
    pub samples: Vec<f32>,
    /// One packet of encoded PCM payload
    pub payload: Vec<u8>,
}

impl PacketBuffers {
    pub fn for_format(format: &AudioFormat) -> Self {
        let mut buffers = Self::default();
        buffers.resize(format);
        buffers
    }

    pub fn resize(&mut self, format: &AudioFormat) {
        self.samples.clear();
        self.samples.resize(format.samples_per_block(), 0.0);
        self.payload.clear();
        self.payload.resize(format.payload_bytes(), 0);
    }
}

/// What one loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Iteration {
    Inactive,
    NoDestination,
    Empty,
    Silent,
    Sent,
    SendFailed,
}

pub(crate) struct SenderCore<S: PacketSink> {
    sink: S,
    shared: Arc<SenderShared>,
    rtp: RtpPacketBuilder,
    converter: SampleConverter,
    pll_enabled: bool,
    pll_window_s: f64,
    pll: Option<SoftwarePll>,
    correction: CorrectionAccumulator,
    /// Whole-sample timestamp adjustment not yet applied to a sent packet
    pending_adjust: i64,
    last_pll_log_ns: u64,
    /// Monotonic time source for PLL observations
    now_ns: fn() -> u64,
    clock: Option<PtpClock>,
    /// Format the buffers are currently sized for
    format: AudioFormat,
    buffers: PacketBuffers,
}

impl<S: PacketSink> SenderCore<S> {
    pub fn new(
        sink: S,
        shared: Arc<SenderShared>,
        ssrc: u32,
        processing: &ProcessingConfig,
        clock: Option<PtpClock>,
    ) -> Self {
        let format = shared.config.read().format;
        let mut core = Self {
            sink,
            shared,
            rtp: RtpPacketBuilder::new(ssrc, format.bit_depth.payload_type()),
            converter: SampleConverter::new(ConvertConfig::from(processing)),
            pll_enabled: processing.pll_enabled,
            pll_window_s: processing.pll_window_s,
            pll: None,
            correction: CorrectionAccumulator::new(),
            pending_adjust: 0,
            last_pll_log_ns: 0,
            now_ns: monotonic_ns,
            clock,
            format,
            buffers: PacketBuffers::for_format(&format),
        };
        core.reset_pll();
        core
    }

    fn reset_pll(&mut self) {
        self.correction.reset();
        self.pending_adjust = 0;
        self.pll = if self.pll_enabled {
            match SoftwarePll::new(self.format.sample_rate as f64, self.pll_window_s) {
                Ok(pll) => Some(pll),
                Err(e) => {
                    log::warn!("PLL disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
    }

    /// Resize every per-packet buffer for a new format in one step
    fn apply_format(&mut self, format: AudioFormat) {
        log::debug!(
            "Sender format change: {} Hz, {} ch, {}-bit, {} ms",
            format.sample_rate,
            format.channels,
            format.bit_depth.bits(),
            format.packet_duration_ms
        );
        self.format = format;
        self.buffers.resize(&format);
        self.rtp.set_payload_type(format.bit_depth.payload_type());
        self.reset_pll();
    }

    /// Run one iteration of the sender loop
    pub fn run_once(&mut self) -> Iteration {
        let shared = self.shared.clone();
        let stats = &shared.stats;
        if !shared.active.load(Ordering::SeqCst) {
            return Iteration::Inactive;
        }

        // Config and ring are read under the same guard so the block size
        // always matches the ring's layout
        let (format, dest, bytes_read) = {
            let config = shared.config.read();
            let format = config.format;
            let dest = match config.destination_addr() {
                Some(dest) => dest,
                None => return Iteration::NoDestination,
            };
            if format != self.format {
                self.apply_format(format);
            }
            let float_bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.buffers.samples[..]);
            let bytes_read = shared.ring.read().read_up_to(float_bytes);
            (format, dest, bytes_read)
        };

        if bytes_read == 0 {
            stats.empty_reads.fetch_add(1, Ordering::Relaxed);
            return Iteration::Empty;
        }

        let required = format.float_block_bytes();
        if bytes_read < required {
            // Whole samples only; a trailing fragment cannot occur with frame-aligned writes
            let filled = bytes_read / crate::config::FLOAT_BYTES;
            self.buffers.samples[filled..].fill(0.0);
            stats.partial_reads.fetch_add(1, Ordering::Relaxed);
            log::debug!("Partial read: {} of {} bytes, padded", bytes_read, required);
        }

        // Known deviation from constant AES67 cadence: silent blocks are not sent
        if is_silent(&self.buffers.samples) {
            stats.silent_skips.fetch_add(1, Ordering::Relaxed);
            return Iteration::Silent;
        }

        let spp = format.samples_per_packet();
        if let Some(pll) = self.pll.as_mut() {
            let now_ns = (self.now_ns)();
            pll.update(now_ns, spp);
            let ppm = pll.correction_ppm();
            stats
                .pll_ppm_x1000
                .store((ppm * 1000.0) as i64, Ordering::Relaxed);

            let whole = self.correction.accumulate(spp, ppm);
            if whole != 0 {
                self.pending_adjust += whole as i64;
                if now_ns.saturating_sub(self.last_pll_log_ns) > PLL_LOG_INTERVAL_NS {
                    log::debug!("PLL correction applied: {:+} samples ({:.2} ppm)", whole, ppm);
                    self.last_pll_log_ns = now_ns;
                }
            }
        }

        let payload_len = match self.converter.convert_block(
            format.bit_depth,
            &self.buffers.samples,
            &mut self.buffers.payload,
        ) {
            Ok(n) => n,
            Err(e) => {
                log::debug!("Conversion failed: {}", e);
                stats.send_errors.fetch_add(1, Ordering::Relaxed);
                return Iteration::SendFailed;
            }
        };

        let packet = self.rtp.build_packet(&self.buffers.payload[..payload_len]);
        match self.sink.send_packet(packet, dest) {
            Ok(sent) => {
                stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);

                let advance = (spp as i64 + self.pending_adjust).max(0);
                self.pending_adjust = 0;
                self.rtp.commit_sent(advance as u32);

                if let Some(clock) = &self.clock {
                    let ptp_time = if clock.is_synchronized() {
                        clock.timestamp_now()
                    } else {
                        0
                    };
                    stats.last_ptp_time_ns.store(ptp_time, Ordering::Relaxed);
                }
                Iteration::Sent
            }
            Err(e) => {
                stats.send_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "RTP send to {} failed ({} bytes): {}",
                    dest,
                    RTP_HEADER_LEN + payload_len,
                    e
                );
                Iteration::SendFailed
            }
        }
    }

    /// Loop until `running` clears
    pub fn run(mut self, running: Arc<AtomicBool>) {
        // Set thread priority high for better timing (Windows)
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Threading::{
                GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
            };
            unsafe {
                SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL);
            }
        }

        log::debug!("Sender loop started (SSRC 0x{:08X})", self.rtp.ssrc());

        while running.load(Ordering::SeqCst) {
            match self.run_once() {
                Iteration::Inactive | Iteration::NoDestination => {
                    thread::sleep(Duration::from_millis(POLL_INTERVAL_MS))
                }
                Iteration::Empty | Iteration::Silent => thread::sleep(IDLE_SLEEP),
                Iteration::Sent | Iteration::SendFailed => {}
            }
        }

        log::debug!("Sender loop exited");
    }

    #[cfg(test)]
    pub fn rtp(&self) -> &RtpPacketBuilder {
        &self.rtp
    }

    #[cfg(test)]
    pub fn with_time_source(mut self, now_ns: fn() -> u64) -> Self {
        self.now_ns = now_ns;
        self
    }
}

/// True if no sample exceeds the silence threshold
fn is_silent(samples: &[f32]) -> bool {
    samples.iter().all(|s| s.abs() <= SILENCE_THRESHOLD)
}
