//! AES67 sender: lifecycle and control surface for one stream.
//!
//! Two macro-states. Disabled: no audio is accepted and nothing is announced.
//! Enabled: the sender loop drains the ring and SAP announces the session.
//! The socket and sender thread are created on the first `enable` and kept
//! across `disable`, so re-enabling is cheap. `shutdown` (or drop) releases
//! them and returns the sender to "Uninitialized".
//!
//! Every method takes `&self`: the producer thread can call `send` while a
//! control thread reconfigures the stream.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use super::rtp::generate_ssrc;
use super::sender::{SenderCore, SenderShared, SenderStats};
use crate::config::{
    validate_dscp, validate_packet_duration, validate_ttl, AudioFormat, BitDepth,
    ProcessingConfig, SenderConfig, StreamConfig, FLOAT_BYTES,
};
use crate::error::{Error, Result};
use crate::ptp::{PtpClient, PtpStats};
use crate::sap::SapAnnouncer;
use crate::sdp::SdpGenerator;
use crate::socket;
use crate::worker::Worker;

/// Control-side state, serialized by one mutex
struct ControlState {
    /// Sender thread (None = not initialized)
    worker: Option<Worker>,
    /// RTP socket shared with the sender thread, kept for live option updates
    socket: Option<Arc<UdpSocket>>,
    sdp: SdpGenerator,
    sap: SapAnnouncer,
    sap_enabled: bool,
    ptp: PtpClient,
}

/// AES67 stream sender
pub struct Aes67Sender {
    shared: Arc<SenderShared>,
    processing: ProcessingConfig,
    ssrc: u32,
    control: Mutex<ControlState>,
}

impl Aes67Sender {
    /// Create a sender. Nothing is allocated on the network until `enable`.
    pub fn new(config: SenderConfig) -> Result<Self> {
        config.validate()?;

        let SenderConfig {
            stream,
            processing,
            session,
            sap: sap_config,
            ptp: ptp_config,
        } = config;

        let mut sap = SapAnnouncer::new(sap_config.clone());
        sap.set_network(stream.ttl, stream.interface, stream.multicast_loopback);

        let mut ptp = PtpClient::new(ptp_config.clone());
        if ptp_config.enabled {
            ptp.start()
                .map_err(|e| Error::setup("starting PTP client", e))?;
        }

        let ssrc = generate_ssrc();
        log::info!(
            "AES67 sender created (SSRC 0x{:08X}, {} Hz, {} ch, {}-bit)",
            ssrc,
            stream.format.sample_rate,
            stream.format.channels,
            stream.format.bit_depth.bits()
        );

        let mut sdp = SdpGenerator::new(session);
        sdp.set_ptp_domain(ptp_config.domain);

        Ok(Self {
            shared: Arc::new(SenderShared::new(stream)),
            processing,
            ssrc,
            control: Mutex::new(ControlState {
                worker: None,
                socket: None,
                sdp,
                sap,
                sap_enabled: sap_config.enabled,
                ptp,
            }),
        })
    }

    /// Create the socket and start the sender thread, once.
    ///
    /// Resources are built into locals and only stored when every step
    /// succeeded, so a failure leaves the sender uninitialized.
    fn initialize(&self, control: &mut ControlState) -> Result<()> {
        if control.worker.is_some() {
            return Ok(());
        }

        let config = self.shared.config.read().clone();
        let socket = socket::create_stream_socket(&config)
            .map(Arc::new)
            .map_err(|e| Error::setup("creating RTP socket", e))?;

        let core = SenderCore::new(
            socket.clone(),
            self.shared.clone(),
            self.ssrc,
            &self.processing,
            Some(control.ptp.clock()),
        );
        let worker = Worker::spawn("aes67-sender", move |running| core.run(running))
            .map_err(|e| Error::setup("spawning sender thread", e))?;

        control.socket = Some(socket);
        control.worker = Some(worker);
        log::info!(
            "AES67 sender initialized for {}:{}",
            config
                .destination
                .map_or_else(|| "<unset>".to_string(), |ip| ip.to_string()),
            config.port
        );
        Ok(())
    }

    /// Start streaming. Initializes on first use; enabling twice is a no-op.
    pub fn enable(&self) -> Result<()> {
        let mut control = self.control.lock();
        self.initialize(&mut control)?;

        if self.shared.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("AES67 stream enabled");

        if control.sap_enabled {
            if let Err(e) = self.start_sap_locked(&mut control) {
                log::warn!("SAP announcements not started: {}", e);
            }
        }
        Ok(())
    }

    /// Stop streaming and announcing. Socket and thread are kept.
    pub fn disable(&self) {
        let mut control = self.control.lock();
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }
        control.sap.stop();
        log::info!("AES67 stream disabled");
    }

    /// Release the socket and threads, withdraw the SAP announcement.
    ///
    /// The sender returns to "Uninitialized"; a later `enable` starts over.
    pub fn shutdown(&self) {
        let mut control = self.control.lock();
        self.shared.active.store(false, Ordering::SeqCst);

        let was_announcing = control.sap.is_running();
        control.sap.stop();
        if was_announcing {
            if let Err(e) = control.sap.send_deletion() {
                log::warn!("SAP deletion not sent: {}", e);
            }
        }

        if let Some(mut worker) = control.worker.take() {
            worker.stop();
        }
        control.socket = None;
        control.ptp.stop();
        self.shared.ring.read().clear();

        log::info!("AES67 sender shut down");
    }

    /// Queue interleaved 32-bit float audio (native endian).
    ///
    /// A no-op while the stream is not active. Trailing bytes that do not
    /// form a whole frame are ignored.
    pub fn send(&self, audio: &[u8]) -> Result<()> {
        if !self.shared.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let ignored = self.shared.push_frames(audio);
        if ignored > 0 {
            log::debug!("Ignoring {} trailing bytes of a partial frame", ignored);
        }
        Ok(())
    }

    /// Queue interleaved float samples
    pub fn send_samples(&self, samples: &[f32]) -> Result<()> {
        self.send(bytemuck::cast_slice(samples))
    }

    /// Set the destination address and port
    pub fn set_destination(&self, destination: Ipv4Addr, port: u16) {
        {
            let mut config = self.shared.config.write();
            config.destination = Some(destination);
            config.port = port;
        }
        self.refresh_announcement();
    }

    /// Change rate, channels and bit depth together. Queued audio is discarded.
    pub fn set_audio_format(&self, sample_rate: u32, channels: u16, bit_depth: u8) -> Result<()> {
        let bit_depth = BitDepth::try_from(bit_depth)?;
        let format = AudioFormat {
            sample_rate,
            channels,
            bit_depth,
            ..self.format()
        };
        format.validate()?;
        self.shared.apply_format(format);
        self.refresh_announcement();
        Ok(())
    }

    /// Change the packet duration (0.125 to 4.0 ms). Queued audio is discarded.
    pub fn set_packet_duration(&self, duration_ms: f32) -> Result<()> {
        validate_packet_duration(duration_ms)?;
        let format = AudioFormat {
            packet_duration_ms: duration_ms,
            ..self.format()
        };
        format.validate()?;
        self.shared.apply_format(format);
        self.refresh_announcement();
        Ok(())
    }

    /// Multicast TTL for RTP packets, also advertised in the SDP
    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        validate_ttl(ttl)?;
        self.shared.config.write().ttl = ttl;
        {
            let control = self.control.lock();
            if let Some(socket) = &control.socket {
                if let Err(e) = socket::set_ttl(socket, ttl) {
                    log::warn!("Failed to set multicast TTL {}: {}", ttl, e);
                }
            }
        }
        self.update_sap_network();
        self.refresh_announcement();
        Ok(())
    }

    /// DSCP class for RTP packets (0 to 63)
    pub fn set_dscp(&self, dscp: u8) -> Result<()> {
        validate_dscp(dscp)?;
        self.shared.config.write().dscp = dscp;
        let control = self.control.lock();
        if let Some(socket) = &control.socket {
            if let Err(e) = socket::set_dscp(socket, dscp) {
                log::warn!("Failed to set DSCP {}: {}", dscp, e);
            }
        }
        Ok(())
    }

    /// Outgoing interface for multicast (None = default route)
    pub fn set_interface(&self, interface: Option<Ipv4Addr>) {
        self.shared.config.write().interface = interface;
        {
            let control = self.control.lock();
            if let (Some(socket), Some(iface)) = (&control.socket, interface) {
                if let Err(e) = socket::set_interface(socket, iface) {
                    log::warn!("Failed to set multicast interface {}: {}", iface, e);
                }
            }
        }
        self.update_sap_network();
        self.refresh_announcement();
    }

    /// Deliver our own multicast packets to local receivers
    pub fn set_multicast_loopback(&self, enabled: bool) {
        self.shared.config.write().multicast_loopback = enabled;
        {
            let control = self.control.lock();
            if let Some(socket) = &control.socket {
                if let Err(e) = socket::set_multicast_loopback(socket, enabled) {
                    log::warn!("Failed to set multicast loopback: {}", e);
                }
            }
        }
        self.update_sap_network();
    }

    /// Start or stop the PTP client
    pub fn enable_ptp(&self, enabled: bool) -> Result<()> {
        let mut control = self.control.lock();
        if enabled {
            control
                .ptp
                .start()
                .map_err(|e| Error::setup("starting PTP client", e))?;
        } else {
            control.ptp.stop();
        }
        Ok(())
    }

    /// PTP domain used by the client and advertised in the SDP
    pub fn set_ptp_domain(&self, domain: u8) {
        {
            let mut control = self.control.lock();
            control.ptp.set_domain(domain);
            control.sdp.set_ptp_domain(domain);
        }
        self.refresh_announcement();
    }

    /// Whether the PTP client reports lock
    pub fn is_ptp_synchronized(&self) -> bool {
        self.control.lock().ptp.is_synchronized()
    }

    /// Current PTP client state
    pub fn ptp_stats(&self) -> PtpStats {
        self.control.lock().ptp.stats()
    }

    /// Turn SAP announcements on or off. Takes effect immediately while active.
    pub fn set_sap_enabled(&self, enabled: bool) -> Result<()> {
        let mut control = self.control.lock();
        control.sap_enabled = enabled;
        if !enabled {
            control.sap.stop();
        } else if self.is_active() {
            self.start_sap_locked(&mut control)?;
        }
        Ok(())
    }

    /// Generate the SDP and start announcing it now
    pub fn start_sap(&self) -> Result<()> {
        let mut control = self.control.lock();
        self.start_sap_locked(&mut control)
    }

    /// Withdraw the announcement and stop the SAP thread
    pub fn stop_sap(&self) {
        self.control.lock().sap.stop();
    }

    /// Whether announcements are currently being sent
    pub fn is_sap_running(&self) -> bool {
        self.control.lock().sap.is_running()
    }

    fn start_sap_locked(&self, control: &mut ControlState) -> Result<()> {
        let config = self.shared.config.read().clone();
        let sdp = control.sdp.generate(&config, self.ssrc)?;
        control.sap.set_content(&sdp);
        control.sap.start()?;
        Ok(())
    }

    /// Build a fresh SDP document from the current configuration
    pub fn generate_sdp(&self) -> Result<String> {
        let mut control = self.control.lock();
        let config = self.shared.config.read().clone();
        let sdp = control.sdp.generate(&config, self.ssrc)?;
        Ok(sdp)
    }

    /// Last generated SDP document
    pub fn sdp(&self) -> Option<String> {
        self.control.lock().sdp.current().map(str::to_string)
    }

    /// Update the SDP session name and/or info
    pub fn set_session_info(&self, name: Option<&str>, info: Option<&str>) {
        self.control.lock().sdp.set_session_info(name, info);
        self.refresh_announcement();
    }

    /// Regenerate the announced SDP after a configuration change
    fn refresh_announcement(&self) {
        let mut control = self.control.lock();
        if !control.sap.is_running() {
            return;
        }
        let config = self.shared.config.read().clone();
        match control.sdp.generate(&config, self.ssrc) {
            Ok(sdp) => control.sap.set_content(&sdp),
            Err(e) => log::warn!("SDP not refreshed: {}", e),
        }
    }

    fn update_sap_network(&self) {
        let (ttl, interface, loopback) = {
            let config = self.shared.config.read();
            (config.ttl, config.interface, config.multicast_loopback)
        };
        self.control
            .lock()
            .sap
            .set_network(ttl, interface, loopback);
    }

    /// "Uninitialized", "Inactive" or "Active"
    pub fn status(&self) -> &'static str {
        if !self.is_initialized() {
            "Uninitialized"
        } else if self.is_active() {
            "Active"
        } else {
            "Inactive"
        }
    }

    /// Buffered audio plus one packet, in milliseconds (None before init)
    pub fn estimated_latency_ms(&self) -> Option<f32> {
        if !self.is_initialized() {
            return None;
        }
        let format = self.format();
        let buffered = self.shared.ring.read().filled();
        let bytes_per_second = format.sample_rate as f32 * format.channels as f32 * FLOAT_BYTES as f32;
        Some(buffered as f32 / bytes_per_second * 1000.0 + format.packet_duration_ms)
    }

    /// True while audio is being packetized and sent
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// True once the socket and sender thread exist
    pub fn is_initialized(&self) -> bool {
        self.control.lock().worker.is_some()
    }

    /// Transmission counters from the sender thread
    pub fn stats(&self) -> SenderStats {
        self.shared.stats.snapshot()
    }

    /// RTP synchronization source of this stream
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Snapshot of the stream configuration
    pub fn config(&self) -> StreamConfig {
        self.shared.config.read().clone()
    }

    fn format(&self) -> AudioFormat {
        self.shared.config.read().format
    }
}

impl Drop for Aes67Sender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SapConfig;
    use crate::error::{ConfigError, SdpError};
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Sender pointed at a loopback receiver, SAP off
    fn loopback_sender() -> (Aes67Sender, UdpSocket) {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut config = SenderConfig::default();
        config.stream.destination = Some(Ipv4Addr::LOCALHOST);
        config.stream.port = port;
        config.processing.dither = crate::config::DitherMode::None;
        config.sap = SapConfig {
            enabled: false,
            ..SapConfig::default()
        };
        (Aes67Sender::new(config).unwrap(), receiver)
    }

    fn tone(samples: usize) -> Vec<f32> {
        (0..samples).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect()
    }

    #[test]
    fn test_status_transitions() {
        let (sender, _rx) = loopback_sender();
        assert_eq!(sender.status(), "Uninitialized");
        assert_eq!(sender.estimated_latency_ms(), None);

        sender.enable().unwrap();
        assert_eq!(sender.status(), "Active");

        sender.disable();
        assert_eq!(sender.status(), "Inactive");
        // Disabling twice is a no-op
        sender.disable();
        assert_eq!(sender.status(), "Inactive");

        sender.shutdown();
        assert_eq!(sender.status(), "Uninitialized");
    }

    #[test]
    fn test_double_enable_is_noop() {
        let (sender, _rx) = loopback_sender();
        sender.enable().unwrap();
        let first = sender.control.lock().socket.as_ref().map(Arc::as_ptr);

        sender.enable().unwrap();
        let second = sender.control.lock().socket.as_ref().map(Arc::as_ptr);
        assert_eq!(first, second);
        assert!(sender.is_active());
    }

    #[test]
    fn test_send_while_inactive_is_ignored() {
        let (sender, _rx) = loopback_sender();
        sender.send_samples(&tone(96)).unwrap();
        assert_eq!(sender.shared.ring.read().filled(), 0);
    }

    #[test]
    fn test_audio_reaches_receiver() {
        let (sender, receiver) = loopback_sender();
        sender.enable().unwrap();
        sender.send_samples(&tone(96 * 4)).unwrap();

        let mut buf = [0u8; 1500];
        let mut sequences = Vec::new();
        for _ in 0..4 {
            let (len, _) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(len, 12 + 288);
            assert_eq!(buf[0], 0x80);
            assert_eq!(buf[1], 96);
            assert_eq!(
                u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
                sender.ssrc()
            );
            sequences.push(u16::from_be_bytes([buf[2], buf[3]]));
        }
        assert_eq!(sequences, vec![0, 1, 2, 3]);

        let deadline = Instant::now() + Duration::from_secs(2);
        while sender.stats().packets_sent < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sender.stats().packets_sent, 4);
    }

    #[test]
    fn test_partial_frames_are_trimmed() {
        let (sender, _rx) = loopback_sender();
        // Keep the sender thread from draining the ring
        sender.set_destination(Ipv4Addr::LOCALHOST, 0);
        sender.enable().unwrap();
        sender.send(&[0u8; 8 + 5]).unwrap();
        assert_eq!(sender.shared.ring.read().filled(), 8);
    }

    #[test]
    fn test_latency_includes_buffered_audio() {
        let (sender, _rx) = loopback_sender();
        sender.set_destination(Ipv4Addr::LOCALHOST, 0);
        sender.enable().unwrap();
        assert_eq!(sender.estimated_latency_ms(), Some(1.0));

        // 480 stereo frames = 10 ms
        sender.send_samples(&vec![0.1f32; 960]).unwrap();
        let latency = sender.estimated_latency_ms().unwrap();
        assert!((latency - 11.0).abs() < 1e-3, "latency {}", latency);
    }

    #[test]
    fn test_invalid_settings_are_rejected_without_change() {
        let (sender, _rx) = loopback_sender();
        let before = sender.config();

        assert!(matches!(
            sender.set_packet_duration(5.0),
            Err(Error::Config(ConfigError::InvalidPacketDuration(_)))
        ));
        assert!(matches!(
            sender.set_audio_format(48000, 2, 20),
            Err(Error::Config(ConfigError::UnsupportedBitDepth(20)))
        ));
        assert!(sender.set_ttl(0).is_err());
        assert!(sender.set_dscp(64).is_err());
        assert_eq!(sender.config(), before);
    }

    #[test]
    fn test_format_change_flushes_queue() {
        let (sender, _rx) = loopback_sender();
        sender.set_destination(Ipv4Addr::LOCALHOST, 0);
        sender.enable().unwrap();
        sender.send_samples(&tone(96)).unwrap();
        assert!(sender.shared.ring.read().filled() > 0);

        sender.set_packet_duration(0.25).unwrap();
        assert_eq!(sender.shared.ring.read().filled(), 0);
        assert_eq!(sender.config().format.samples_per_packet(), 12);

        sender.set_audio_format(48000, 2, 16).unwrap();
        assert_eq!(sender.config().format.bit_depth, BitDepth::Pcm16);
        assert_eq!(sender.config().format.packet_duration_ms, 0.25);
    }

    #[test]
    fn test_format_switch_keeps_queue_frame_aligned() {
        let (sender, _rx) = loopback_sender();
        sender.set_destination(Ipv4Addr::LOCALHOST, 0);
        sender.set_audio_format(48000, 1, 24).unwrap();
        sender.enable().unwrap();

        let done = AtomicBool::new(false);
        let mut misaligned = 0;
        thread::scope(|s| {
            // Mono producer racing the switch to stereo
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    let _ = sender.send_samples(&[0.5]);
                }
            });
            for _ in 0..300 {
                if sender.set_audio_format(48000, 1, 24).is_err() {
                    break;
                }
                thread::sleep(Duration::from_micros(100));
                if sender.set_audio_format(48000, 2, 24).is_err() {
                    break;
                }
                if sender.shared.ring.read().filled() % 8 != 0 {
                    misaligned += 1;
                }
            }
            done.store(true, Ordering::SeqCst);
        });
        assert_eq!(misaligned, 0);
        assert_eq!(sender.config().format.channels, 2);
    }

    #[test]
    fn test_sdp_follows_configuration() {
        let (sender, _rx) = loopback_sender();
        sender.set_destination(Ipv4Addr::new(239, 1, 2, 3), 5006);
        sender.set_audio_format(48000, 2, 16).unwrap();

        let sdp = sender.generate_sdp().unwrap();
        assert!(sdp.contains("c=IN IP4 239.1.2.3/32\r\n"));
        assert!(sdp.contains("m=audio 5006 RTP/AVP 10\r\n"));
        assert!(sdp.contains(&format!("a=ssrc:{} ", sender.ssrc())));
        assert_eq!(sender.sdp(), Some(sdp));
    }

    #[test]
    fn test_ptp_domain_reaches_sdp() {
        let mut config = SenderConfig::default();
        config.ptp.domain = 3;
        let sender = Aes67Sender::new(config).unwrap();
        let sdp = sender.generate_sdp().unwrap();
        assert!(sdp.contains("a=ts-refclk:ptp=IEEE1588-2008:domain=3\r\n"));

        sender.set_ptp_domain(7);
        assert_eq!(sender.ptp_stats().domain, 7);
        let sdp = sender.generate_sdp().unwrap();
        assert!(sdp.contains("a=ts-refclk:ptp=IEEE1588-2008:domain=7\r\n"));
    }

    #[test]
    fn test_sap_requires_destination() {
        let mut config = SenderConfig::default();
        config.stream.destination = None;
        let sender = Aes67Sender::new(config).unwrap();
        assert!(matches!(
            sender.start_sap(),
            Err(Error::Sdp(SdpError::MissingDestination))
        ));
        assert!(!sender.is_sap_running());
    }

    #[test]
    fn test_ptp_toggle() {
        let (sender, _rx) = loopback_sender();
        sender.enable_ptp(true).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !sender.is_ptp_synchronized() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(sender.is_ptp_synchronized());

        sender.enable_ptp(false).unwrap();
        assert!(!sender.is_ptp_synchronized());
    }

    #[test]
    fn test_reenable_after_shutdown() {
        let (sender, receiver) = loopback_sender();
        sender.enable().unwrap();
        sender.shutdown();
        sender.enable().unwrap();
        assert_eq!(sender.status(), "Active");

        sender.send_samples(&tone(96)).unwrap();
        let mut buf = [0u8; 1500];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(len, 12 + 288);
    }
}
