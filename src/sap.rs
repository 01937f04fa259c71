//! SAP announcer: periodically multicasts the SDP document.
//!
//! Message layout (8-byte header, then the raw SDP text):
//! ```text
//! byte 0     0x20 (version 2, no encryption, no authentication)
//! byte 1     message type (0 = announce, 1 = delete)
//! bytes 2-5  content hash, big-endian
//! bytes 6-7  authentication data length (always 0)
//! ```

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::SapConfig;
use crate::error::SapError;
use crate::socket::{self, create_multicast_sender, MulticastOptions};
use crate::worker::Worker;
use crate::{DEFAULT_TTL, POLL_INTERVAL_MS};

/// SAP header byte 0
const SAP_VERSION_BYTE: u8 = 0x20;
/// SAP header length
pub const SAP_HEADER_LEN: usize = 8;

/// SAP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SapMessageType {
    Announce = 0,
    Delete = 1,
}

/// Rolling hash of the SDP bytes: `hash = hash * 33 + byte`, seeded at 0
pub fn sap_hash(content: &[u8]) -> u32 {
    content
        .iter()
        .fold(0u32, |hash, &b| hash.wrapping_mul(33).wrapping_add(b as u32))
}

/// Build a complete SAP datagram carrying `sdp`
pub fn build_sap_message(msg_type: SapMessageType, sdp: &str) -> Vec<u8> {
    let body = sdp.as_bytes();
    let hash = sap_hash(body);

    let mut message = Vec::with_capacity(SAP_HEADER_LEN + body.len());
    message.push(SAP_VERSION_BYTE);
    message.push(msg_type as u8);
    message.extend_from_slice(&hash.to_be_bytes());
    message.extend_from_slice(&0u16.to_be_bytes());
    message.extend_from_slice(body);
    message
}

/// Periodic announcer for one session description
pub struct SapAnnouncer {
    config: SapConfig,
    ttl: u32,
    interface: Option<Ipv4Addr>,
    loopback: bool,
    content: Arc<RwLock<Option<String>>>,
    socket: Option<Arc<UdpSocket>>,
    worker: Option<Worker>,
    announcements: Arc<AtomicU64>,
}

impl SapAnnouncer {
    pub fn new(config: SapConfig) -> Self {
        Self {
            config,
            ttl: DEFAULT_TTL,
            interface: None,
            loopback: true,
            content: Arc::new(RwLock::new(None)),
            socket: None,
            worker: None,
            announcements: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Multicast TTL, interface and loopback for the announcement socket.
    ///
    /// A running loop gets the new options on its socket right away. The
    /// cached socket is released so the next start or one-shot send binds a
    /// fresh one.
    pub fn set_network(&mut self, ttl: u32, interface: Option<Ipv4Addr>, loopback: bool) {
        if (ttl, interface, loopback) == (self.ttl, self.interface, self.loopback) {
            return;
        }
        self.ttl = ttl;
        self.interface = interface;
        self.loopback = loopback;

        if let Some(live) = self.socket.take() {
            if let Err(e) = socket::set_ttl(&live, ttl) {
                log::warn!("Failed to set SAP multicast TTL {}: {}", ttl, e);
            }
            if let Err(e) = socket::set_multicast_loopback(&live, loopback) {
                log::warn!("Failed to set SAP multicast loopback: {}", e);
            }
            if let Some(iface) = interface {
                if let Err(e) = socket::set_interface(&live, iface) {
                    log::warn!("Failed to set SAP multicast interface {}: {}", iface, e);
                }
            }
        }
    }

    /// Replace the announced SDP. Does not send anything by itself.
    pub fn set_content(&self, sdp: &str) {
        *self.content.write() = Some(sdp.to_string());
    }

    pub fn content(&self) -> Option<String> {
        self.content.read().clone()
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.config.group, self.config.port)
    }

    fn socket(&mut self) -> Result<Arc<UdpSocket>, SapError> {
        if let Some(socket) = &self.socket {
            return Ok(socket.clone());
        }
        let socket = create_multicast_sender(&MulticastOptions {
            ttl: self.ttl,
            dscp: None,
            interface: self.interface,
            loopback: self.loopback,
            write_timeout: None,
        })
        .map_err(SapError::Socket)?;
        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());
        Ok(socket)
    }

    /// Start the periodic loop. The first announcement goes out immediately.
    ///
    /// Content must be set first. Starting while running is a no-op.
    pub fn start(&mut self) -> Result<(), SapError> {
        if self.is_running() {
            return Ok(());
        }
        if self.content.read().is_none() {
            return Err(SapError::NoContent);
        }

        let socket = self.socket()?;
        let content = self.content.clone();
        let announcements = self.announcements.clone();
        let dest = self.destination();
        let interval = Duration::from_millis(self.config.interval_ms.max(POLL_INTERVAL_MS));

        let worker = Worker::spawn("sap-announcer", move |running| {
            while running.load(Ordering::SeqCst) {
                let message = content
                    .read()
                    .as_deref()
                    .map(|sdp| build_sap_message(SapMessageType::Announce, sdp));
                if let Some(message) = message {
                    match socket.send_to(&message, dest) {
                        Ok(_) => {
                            announcements.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => log::warn!("SAP announcement to {} failed: {}", dest, e),
                    }
                }

                // Short sleeps so a stop request is seen quickly
                let mut waited = Duration::ZERO;
                while waited < interval && running.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
                    waited += Duration::from_millis(POLL_INTERVAL_MS);
                }
            }
        })
        .map_err(SapError::Spawn)?;

        self.worker = Some(worker);
        log::info!(
            "SAP announcements started to {} (interval {} ms)",
            dest,
            interval.as_millis()
        );
        Ok(())
    }

    /// Stop the periodic loop (bounded wait)
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            log::info!("SAP announcements stopped");
        }
    }

    /// Send one announcement now, returning the datagram size
    pub fn send_announcement(&mut self) -> Result<usize, SapError> {
        let sent = self.send_message(SapMessageType::Announce)?;
        self.announcements.fetch_add(1, Ordering::Relaxed);
        Ok(sent)
    }

    /// Tell listeners the session is gone
    pub fn send_deletion(&mut self) -> Result<usize, SapError> {
        self.send_message(SapMessageType::Delete)
    }

    fn send_message(&mut self, msg_type: SapMessageType) -> Result<usize, SapError> {
        let message = match self.content.read().as_deref() {
            Some(sdp) => build_sap_message(msg_type, sdp),
            None => return Err(SapError::NoContent),
        };
        let socket = self.socket()?;
        socket
            .send_to(&message, self.destination())
            .map_err(SapError::Socket)
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| w.is_running())
    }

    /// Announcements successfully sent since creation
    pub fn announcements_sent(&self) -> u64 {
        self.announcements.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &SapConfig {
        &self.config
    }
}

impl Drop for SapAnnouncer {
    fn drop(&mut self) {
        self.stop();
    }
}
