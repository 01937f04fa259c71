//! AES67 output module.
//! Provides functionality to transmit float audio as an AES67/RTP multicast stream.

mod rtp;
mod sender;
pub mod stream;

pub use rtp::{generate_ssrc, RtpPacketBuilder, RTP_HEADER_LEN};
pub use sender::{PacketSink, SenderStats};
pub use stream::Aes67Sender;
