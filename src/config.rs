//! Stream and processing configuration.
//!
//! Everything here is plain data. `SenderConfig` aggregates the sections and
//! can be loaded from TOML; every section falls back to its defaults when
//! omitted.

use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{
    DEFAULT_DESTINATION, DEFAULT_DSCP, DEFAULT_PORT, DEFAULT_TTL, MAX_PACKET_DURATION_MS,
    MIN_PACKET_DURATION_MS, SAP_DEFAULT_INTERVAL_MS, SAP_DEFAULT_PORT, SAP_MULTICAST_ADDR,
};

/// Bytes per float sample in the producer feed
pub const FLOAT_BYTES: usize = 4;

/// PCM sample width on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BitDepth {
    /// L16, static payload type 10
    Pcm16,
    /// L24, dynamic payload type 96
    Pcm24,
}

impl BitDepth {
    pub fn bits(self) -> u8 {
        match self {
            BitDepth::Pcm16 => 16,
            BitDepth::Pcm24 => 24,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            BitDepth::Pcm16 => 2,
            BitDepth::Pcm24 => 3,
        }
    }

    /// RTP payload type used on the wire and in the SDP media line
    pub fn payload_type(self) -> u8 {
        match self {
            BitDepth::Pcm16 => 10,
            BitDepth::Pcm24 => 96,
        }
    }

    /// Encoding name for `a=rtpmap`
    pub fn encoding_name(self) -> &'static str {
        match self {
            BitDepth::Pcm16 => "L16",
            BitDepth::Pcm24 => "L24",
        }
    }
}

impl TryFrom<u8> for BitDepth {
    type Error = ConfigError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(BitDepth::Pcm16),
            24 => Ok(BitDepth::Pcm24),
            other => Err(ConfigError::UnsupportedBitDepth(other)),
        }
    }
}

impl From<BitDepth> for u8 {
    fn from(depth: BitDepth) -> u8 {
        depth.bits()
    }
}

/// The four parameters every per-packet buffer size derives from.
///
/// Kept as one `Copy` value so readers always see a consistent set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: BitDepth,
    /// Packet duration in milliseconds (0.125 to 4.0)
    pub packet_duration_ms: f32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            bit_depth: BitDepth::Pcm24,
            packet_duration_ms: 1.0,
        }
    }
}

impl AudioFormat {
    /// Samples per channel in one packet: `round(rate * duration / 1000)`
    pub fn samples_per_packet(&self) -> usize {
        (self.sample_rate as f64 * self.packet_duration_ms as f64 / 1000.0).round() as usize
    }

    /// Interleaved samples (all channels) in one packet
    pub fn samples_per_block(&self) -> usize {
        self.samples_per_packet() * self.channels as usize
    }

    /// Bytes of float input consumed per packet
    pub fn float_block_bytes(&self) -> usize {
        self.samples_per_block() * FLOAT_BYTES
    }

    /// Bytes of PCM payload per packet
    pub fn payload_bytes(&self) -> usize {
        self.samples_per_block() * self.bit_depth.bytes_per_sample()
    }

    /// Bytes per interleaved float frame
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * FLOAT_BYTES
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_packet_duration(self.packet_duration_ms)?;
        if self.sample_rate == 0 || self.sample_rate > 384_000 {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.channels == 0 || self.channels > 64 {
            return Err(ConfigError::InvalidChannels(self.channels));
        }
        if self.samples_per_packet() == 0 {
            return Err(ConfigError::InvalidPacketDuration(self.packet_duration_ms));
        }
        Ok(())
    }
}

pub(crate) fn validate_packet_duration(duration_ms: f32) -> Result<(), ConfigError> {
    if (MIN_PACKET_DURATION_MS..=MAX_PACKET_DURATION_MS).contains(&duration_ms) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPacketDuration(duration_ms))
    }
}

/// Static stream parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Multicast group or unicast host (None = unset)
    pub destination: Option<Ipv4Addr>,
    /// UDP port (0 = unset)
    pub port: u16,
    pub format: AudioFormat,
    /// Multicast hop limit
    pub ttl: u32,
    /// DSCP code point (46 = EF)
    pub dscp: u8,
    /// Interface address for outgoing multicast (None = default route)
    pub interface: Option<Ipv4Addr>,
    pub multicast_loopback: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            destination: Some(DEFAULT_DESTINATION),
            port: DEFAULT_PORT,
            format: AudioFormat::default(),
            ttl: DEFAULT_TTL,
            dscp: DEFAULT_DSCP,
            interface: None,
            multicast_loopback: true,
        }
    }
}

impl StreamConfig {
    /// Destination socket address, if both address and port are set
    pub fn destination_addr(&self) -> Option<SocketAddrV4> {
        match (self.destination, self.port) {
            (Some(ip), port) if port != 0 => Some(SocketAddrV4::new(ip, port)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.format.validate()?;
        validate_ttl(self.ttl)?;
        validate_dscp(self.dscp)?;
        Ok(())
    }
}

pub(crate) fn validate_ttl(ttl: u32) -> Result<(), ConfigError> {
    if (1..=255).contains(&ttl) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTtl(ttl))
    }
}

pub(crate) fn validate_dscp(dscp: u8) -> Result<(), ConfigError> {
    if dscp <= 0x3F {
        Ok(())
    } else {
        Err(ConfigError::InvalidDscp(dscp))
    }
}

/// Dither noise shape for the 16-bit path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DitherMode {
    None,
    /// Triangular PDF (sum of two uniform draws)
    #[default]
    Tpdf,
    /// Rectangular PDF (single uniform draw)
    Rpdf,
}

/// Tunables owned by the host's configuration store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Use the chunked conversion path when no dither is requested
    pub dsp_acceleration: bool,
    pub dither: DitherMode,
    /// Clamp input to [-1, 1] before scaling
    pub clip_protection: bool,
    pub pll_enabled: bool,
    /// PLL measurement window in seconds
    pub pll_window_s: f64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            dsp_acceleration: true,
            dither: DitherMode::Tpdf,
            clip_protection: true,
            pll_enabled: false,
            pll_window_s: 1.0,
        }
    }
}

impl ProcessingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pll_window_s.is_finite() && self.pll_window_s > 0.0 {
            Ok(())
        } else {
            Err(ConfigError::InvalidPllWindow(self.pll_window_s))
        }
    }
}

/// Human-readable session fields for the SDP document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub name: String,
    pub info: String,
    /// `o=` username
    pub username: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "AES67 Stream".to_string(),
            info: "AES67 Audio Stream".to_string(),
            username: "aes67-sender".to_string(),
        }
    }
}

/// SAP announcement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SapConfig {
    /// Start announcements whenever the stream is enabled
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
    pub interval_ms: u64,
}

impl Default for SapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: SAP_MULTICAST_ADDR,
            port: SAP_DEFAULT_PORT,
            interval_ms: SAP_DEFAULT_INTERVAL_MS,
        }
    }
}

/// PTP client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtpConfig {
    /// Start the PTP client at init
    pub enabled: bool,
    /// PTP domain, also advertised in the SDP reference clock
    pub domain: u8,
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domain: 0,
        }
    }
}

/// Complete sender configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub stream: StreamConfig,
    pub processing: ProcessingConfig,
    pub session: SessionConfig,
    pub sap: SapConfig,
    pub ptp: PtpConfig,
}

impl SenderConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SenderConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream.validate()?;
        self.processing.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_per_packet_rounds() {
        let mut format = AudioFormat::default();
        assert_eq!(format.samples_per_packet(), 48);

        format.packet_duration_ms = 0.125;
        assert_eq!(format.samples_per_packet(), 6);

        format.sample_rate = 44100;
        format.packet_duration_ms = 1.0;
        // 44.1 rounds down
        assert_eq!(format.samples_per_packet(), 44);

        format.packet_duration_ms = 0.25;
        // 11.025 -> 11
        assert_eq!(format.samples_per_packet(), 11);
    }

    #[test]
    fn test_derived_sizes() {
        let format = AudioFormat::default();
        assert_eq!(format.samples_per_block(), 96);
        assert_eq!(format.float_block_bytes(), 384);
        assert_eq!(format.payload_bytes(), 288);

        let pcm16 = AudioFormat {
            bit_depth: BitDepth::Pcm16,
            ..format
        };
        assert_eq!(pcm16.payload_bytes(), 192);
    }

    #[test]
    fn test_packet_duration_bounds() {
        assert!(validate_packet_duration(0.125).is_ok());
        assert!(validate_packet_duration(4.0).is_ok());
        assert!(validate_packet_duration(0.1).is_err());
        assert!(validate_packet_duration(4.5).is_err());
        assert!(validate_packet_duration(f32::NAN).is_err());
    }

    #[test]
    fn test_destination_requires_port() {
        let mut config = StreamConfig::default();
        assert!(config.destination_addr().is_some());
        config.port = 0;
        assert!(config.destination_addr().is_none());
        config.port = 5004;
        config.destination = None;
        assert!(config.destination_addr().is_none());
    }

    #[test]
    fn test_toml_partial_document() {
        let config = SenderConfig::from_toml_str(
            r#"
            [stream]
            destination = "239.1.2.3"
            port = 5006
            ttl = 16

            [stream.format]
            bit_depth = 16
            packet_duration_ms = 0.25

            [processing]
            dither = "rpdf"
            pll_enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.stream.destination, Some(Ipv4Addr::new(239, 1, 2, 3)));
        assert_eq!(config.stream.port, 5006);
        assert_eq!(config.stream.ttl, 16);
        assert_eq!(config.stream.format.bit_depth, BitDepth::Pcm16);
        assert_eq!(config.stream.format.sample_rate, 48000);
        assert_eq!(config.processing.dither, DitherMode::Rpdf);
        assert!(config.processing.pll_enabled);
        assert_eq!(config.sap, SapConfig::default());
    }

    #[test]
    fn test_toml_rejects_bad_values() {
        let err = SenderConfig::from_toml_str("[stream.format]\nbit_depth = 20\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err =
            SenderConfig::from_toml_str("[stream.format]\npacket_duration_ms = 8.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPacketDuration(_)));

        let err = SenderConfig::from_toml_str("[stream]\ndscp = 64\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDscp(64)));
    }
}
