//! RTP packet builder for AES67 output streams.
//! Builds RFC 3550 packets around an already-encoded PCM payload.

/// Fixed RTP header length (no CSRCs, no extension)
pub const RTP_HEADER_LEN: usize = 12;

/// RTP packet builder for transmitting audio.
///
/// The sequence number advances on every build, sent or not. The timestamp
/// only advances when the caller reports a successful send through
/// [`commit_sent`](Self::commit_sent).
pub struct RtpPacketBuilder {
    /// Synchronization source identifier (random per stream)
    ssrc: u32,
    /// Sequence number of the next packet (wraps at 65535)
    sequence: u16,
    /// Timestamp of the next packet (sample count)
    timestamp: u32,
    /// Payload type (10 for L16, 96 for L24)
    payload_type: u8,
    /// Reused packet buffer
    packet_buffer: Vec<u8>,
}

impl RtpPacketBuilder {
    /// Create a new RTP packet builder starting at sequence 0, timestamp 0.
    ///
    /// # Arguments
    /// * `ssrc` - Synchronization source identifier (use random value)
    /// * `payload_type` - RTP payload type
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        Self::with_state(ssrc, payload_type, 0, 0)
    }

    /// Create a builder resuming from a given sequence number and timestamp
    pub fn with_state(ssrc: u32, payload_type: u8, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence,
            timestamp,
            payload_type,
            // 12 byte header + 4 ms of stereo L24 at 48 kHz
            packet_buffer: Vec::with_capacity(RTP_HEADER_LEN + 1152),
        }
    }

    /// Build an RTP packet around `payload` and advance the sequence number.
    ///
    /// Returns the complete packet ready to send.
    pub fn build_packet(&mut self, payload: &[u8]) -> &[u8] {
        let packet_size = RTP_HEADER_LEN + payload.len();

        self.packet_buffer.clear();
        self.packet_buffer.resize(packet_size, 0);

        // Byte 0: V=2, P=0, X=0, CC=0 -> 0x80
        self.packet_buffer[0] = 0x80;
        // Byte 1: M=0, PT
        self.packet_buffer[1] = self.payload_type & 0x7F;
        self.packet_buffer[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        self.packet_buffer[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        self.packet_buffer[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        self.packet_buffer[RTP_HEADER_LEN..].copy_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);

        &self.packet_buffer[..packet_size]
    }

    /// Advance the timestamp after the last built packet went out
    pub fn commit_sent(&mut self, advance: u32) {
        self.timestamp = self.timestamp.wrapping_add(advance);
    }

    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.payload_type = payload_type;
    }

    /// Sequence number the next packet will carry
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp the next packet will carry
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }
}

/// Random SSRC from the clock (xorshift32 over the nanosecond count)
pub fn generate_ssrc() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut x = (now.as_nanos() as u32) ^ 0xDEAD_BEEF;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}
