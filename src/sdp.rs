//! SDP session description for an AES67 stream (RFC 4566 + AES67 attributes).
//!
//! Documents are rebuilt from the stream configuration on demand. Every
//! regeneration bumps the session and media versions so receivers and SAP
//! listeners can tell a changed description from a repeat.

use std::fmt::Write as _;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{BitDepth, SessionConfig, StreamConfig};
use crate::error::SdpError;

/// Builds and caches the session description
#[derive(Debug, Clone)]
pub struct SdpGenerator {
    session: SessionConfig,
    /// Origin address override (None = interface or routed address)
    origin_address: Option<Ipv4Addr>,
    /// PTP domain advertised in `a=ts-refclk`
    ptp_domain: u8,
    session_id: u64,
    /// Number of documents generated so far
    generations: u64,
    current: Option<String>,
}

impl SdpGenerator {
    /// Create a generator whose session id is the current Unix time in seconds
    pub fn new(session: SessionConfig) -> Self {
        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::with_session_id(session, session_id)
    }

    pub fn with_session_id(session: SessionConfig, session_id: u64) -> Self {
        Self {
            session,
            origin_address: None,
            ptp_domain: 0,
            session_id,
            generations: 0,
            current: None,
        }
    }

    /// Build a fresh document from `stream`.
    ///
    /// Fails without touching the cached document or the version counters if
    /// the destination address or port is unset.
    pub fn generate(&mut self, stream: &StreamConfig, ssrc: u32) -> Result<String, SdpError> {
        let destination = stream.destination.ok_or(SdpError::MissingDestination)?;
        if stream.port == 0 {
            return Err(SdpError::MissingPort);
        }

        let origin = self
            .origin_address
            .or(stream.interface)
            .unwrap_or_else(local_ipv4_address);

        self.generations += 1;
        let session_version = self.session_version();

        let format = &stream.format;
        let pt = format.bit_depth.payload_type();
        let ptime = format_ptime(format.packet_duration_ms);

        let mut sdp = String::with_capacity(512);
        // Writing to a String cannot fail
        let _ = write!(
            sdp,
            "v=0\r\n\
             o={} {} {} IN IP4 {}\r\n\
             s={}\r\n\
             i={}\r\n\
             t=0 0\r\n\
             c=IN IP4 {}/{}\r\n\
             m=audio {} RTP/AVP {}\r\n\
             a=rtpmap:{} {}/{}/{}\r\n",
            self.session.username,
            self.session_id,
            session_version,
            origin,
            self.session.name,
            self.session.info,
            destination,
            stream.ttl,
            stream.port,
            pt,
            pt,
            format.bit_depth.encoding_name(),
            format.sample_rate,
            format.channels,
        );
        if format.bit_depth == BitDepth::Pcm24 {
            let _ = write!(sdp, "a=fmtp:{} channel-order=SMPTE2110\r\n", pt);
        }
        let _ = write!(
            sdp,
            "a=ptime:{}\r\n\
             a=maxptime:{}\r\n\
             a=ssrc:{} cname:{}\r\n\
             a=source-filter:incl IP4 {} {}\r\n\
             a=mediaclk:direct=0\r\n\
             a=ts-refclk:ptp=IEEE1588-2008:domain={}\r\n",
            ptime,
            ptime,
            ssrc,
            self.session.username,
            destination,
            origin,
            self.ptp_domain,
        );

        log::debug!(
            "Generated SDP v{} ({} bytes) for {}:{}",
            session_version,
            sdp.len(),
            destination,
            stream.port
        );

        self.current = Some(sdp.clone());
        Ok(sdp)
    }

    /// Last generated document
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Update the `s=` and `i=` lines used by the next generation
    pub fn set_session_info(&mut self, name: Option<&str>, info: Option<&str>) {
        if let Some(name) = name {
            self.session.name = name.to_string();
        }
        if let Some(info) = info {
            self.session.info = info.to_string();
        }
    }

    /// Override the `o=` username and/or address
    pub fn set_origin(&mut self, username: Option<&str>, address: Option<Ipv4Addr>) {
        if let Some(username) = username {
            self.session.username = username.to_string();
        }
        if address.is_some() {
            self.origin_address = address;
        }
    }

    /// PTP domain for the reference clock attribute
    pub fn set_ptp_domain(&mut self, domain: u8) {
        self.ptp_domain = domain;
    }

    /// Domain currently advertised
    pub fn ptp_domain(&self) -> u8 {
        self.ptp_domain
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Version in the `o=` line: equal to the session id for the first
    /// document, then one higher per regeneration
    pub fn session_version(&self) -> u64 {
        self.session_id
            .wrapping_add(self.generations.saturating_sub(1))
    }

    /// Number of media descriptions generated
    pub fn media_version(&self) -> u64 {
        self.generations
    }
}

/// Packet time for `a=ptime`, without trailing zeros (1.0 -> "1", 0.125 -> "0.125")
fn format_ptime(duration_ms: f32) -> String {
    format!("{}", duration_ms)
}

/// Address of the interface the default route leaves through.
///
/// Connecting a UDP socket sends nothing; it only selects a route. Falls back
/// to loopback when there is no route.
pub fn local_ipv4_address() -> Ipv4Addr {
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 53))?;
            socket.local_addr()
        })
        .ok()
        .and_then(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        });

    routed.unwrap_or(Ipv4Addr::LOCALHOST)
}
