//! Error types for the AES67 sender.

use std::io;

use thiserror::Error;

/// Crate-level error
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("SDP error: {0}")]
    Sdp(#[from] SdpError),

    #[error("SAP error: {0}")]
    Sap(#[from] SapError),

    /// Socket creation, buffer allocation or thread spawn failed during init.
    #[error("setup failed while {stage}: {source}")]
    Setup {
        stage: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn setup(stage: &'static str, source: io::Error) -> Self {
        Error::Setup { stage, source }
    }
}

/// Rejected configuration values. Nothing is mutated when one of these is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("packet duration {0} ms is outside 0.125..=4.0 ms")]
    InvalidPacketDuration(f32),

    #[error("unsupported bit depth {0} (expected 16 or 24)")]
    UnsupportedBitDepth(u8),

    #[error("invalid channel count {0}")]
    InvalidChannels(u16),

    #[error("invalid sample rate {0}")]
    InvalidSampleRate(u32),

    #[error("DSCP value {0} does not fit in 6 bits")]
    InvalidDscp(u8),

    #[error("TTL {0} is outside 1..=255")]
    InvalidTtl(u32),

    #[error("PLL window {0} s must be positive")]
    InvalidPllWindow(f64),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),
}

/// SDP generation prerequisites
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("destination address is not set")]
    MissingDestination,

    #[error("destination port is not set")]
    MissingPort,
}

/// SAP announcer failures
#[derive(Error, Debug)]
pub enum SapError {
    #[error("no SDP content set")]
    NoContent,

    #[error("SAP socket error: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to spawn SAP thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Sample conversion failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    OutputTooSmall { needed: usize, available: usize },
}

/// Software PLL construction failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PllError {
    #[error("target sample rate must be positive")]
    InvalidTargetRate,

    #[error("measurement window must be positive")]
    InvalidWindow,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
