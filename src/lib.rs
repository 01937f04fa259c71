//! AES67 RTP multicast sender
//!
//! Streams a float PCM feed as an AES67 RTP session and makes it discoverable.
//! - Output: ring-buffered float input, converted to L16/L24 and sent as RTP/UDP
//! - Discovery: SDP session description, periodically announced over SAP
//! - Clocking: software PLL for producer drift, PTP client for wall-clock correlation
//!
//! Audio format notes:
//! - The producer writes interleaved 32-bit float at the configured rate/channels
//! - 16-bit streams use payload type 10 (L16), 24-bit use dynamic type 96 (L24)
//! - RTP timestamps advance by a fixed sample count per packet; the PLL only
//!   nudges that advance by whole samples

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pll;
pub mod ptp;
pub mod ringbuffer;
pub mod sap;
pub mod sdp;
mod socket;
mod worker;

use std::net::Ipv4Addr;

pub use config::{
    AudioFormat, BitDepth, DitherMode, ProcessingConfig, PtpConfig, SapConfig, SenderConfig,
    SessionConfig, StreamConfig,
};
pub use convert::{ConvertConfig, SampleConverter};
pub use error::{ConfigError, ConvertError, Error, PllError, Result, SapError, SdpError};
pub use output::{Aes67Sender, PacketSink, RtpPacketBuilder, SenderStats};
pub use pll::{CorrectionAccumulator, SoftwarePll};
pub use ptp::{PtpClient, PtpClock, PtpState, PtpStats};
pub use ringbuffer::RingBuffer;
pub use sap::SapAnnouncer;
pub use sdp::SdpGenerator;

// Stream defaults
pub const DEFAULT_DESTINATION: Ipv4Addr = Ipv4Addr::new(239, 69, 145, 58);
pub const DEFAULT_PORT: u16 = 5004;
pub const DEFAULT_TTL: u32 = 32;
pub const DEFAULT_DSCP: u8 = 46; // EF

// Packet duration limits in milliseconds
pub const MIN_PACKET_DURATION_MS: f32 = 0.125;
pub const MAX_PACKET_DURATION_MS: f32 = 4.0;

/// Ring buffer capacity in packet periods
pub const RING_BUFFER_PACKETS: usize = 256;

/// Blocks whose peak magnitude stays at or below this are treated as silence
pub const SILENCE_THRESHOLD: f32 = 1e-4;

// SAP defaults (RFC 2974 well-known group)
pub const SAP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 2, 127, 254);
pub const SAP_DEFAULT_PORT: u16 = 9875;
pub const SAP_DEFAULT_INTERVAL_MS: u64 = 5000;

/// PTP stub tick period
pub const PTP_TICK_INTERVAL_MS: u64 = 100;

/// Sleep granularity of every background loop, bounds stop latency
pub const POLL_INTERVAL_MS: u64 = 10;

/// Upper bound on waiting for a background thread to exit before detaching it
pub const JOIN_TIMEOUT_MS: u64 = 500;

/// Write timeout on the RTP socket
pub const SEND_TIMEOUT_MS: u64 = 50;
