//! Sine tone to an AES67 multicast stream.
//!
//! Usage: cargo run --example sine_to_aes67 [config.toml] [seconds]
//!
//! Streams a 1 kHz tone to the configured group (239.69.145.58:5004 by
//! default) and announces it over SAP, so any AES67 receiver on the LAN can
//! subscribe. Prints sender statistics once per second.
//!
//! Set RUST_LOG=debug for per-packet detail.

use std::env;
use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use aes67_sender::{Aes67Sender, SenderConfig};

/// Producer chunk size in milliseconds
const CHUNK_MS: u64 = 5;
const TONE_HZ: f32 = 1000.0;
const AMPLITUDE: f32 = 0.25;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = match args.first() {
        Some(path) if path.ends_with(".toml") => SenderConfig::load(path)?,
        _ => SenderConfig::default(),
    };
    let seconds: u64 = args
        .iter()
        .find_map(|a| a.parse().ok())
        .unwrap_or(30);

    let format = config.stream.format;
    println!("=== AES67 Sine Sender ===\n");
    println!(
        "Destination: {}:{}",
        config
            .stream
            .destination
            .map_or_else(|| "<unset>".to_string(), |ip| ip.to_string()),
        config.stream.port
    );
    println!(
        "Format: {} Hz, {} ch, {}-bit, {} ms packets",
        format.sample_rate,
        format.channels,
        format.bit_depth.bits(),
        format.packet_duration_ms
    );
    println!("Duration: {} s\n", seconds);

    let sender = Aes67Sender::new(config)?;
    sender.enable()?;

    if let Some(sdp) = sender.sdp() {
        println!("--- SDP ---\n{}-----------\n", sdp);
    }

    let channels = format.channels as usize;
    let frames_per_chunk = (format.sample_rate as u64 * CHUNK_MS / 1000) as usize;
    let step = TAU * TONE_HZ / format.sample_rate as f32;
    let mut phase = 0.0f32;
    let mut chunk = vec![0.0f32; frames_per_chunk * channels];

    let start = Instant::now();
    let mut next_chunk = start;
    let mut next_report = start + Duration::from_secs(1);

    while start.elapsed() < Duration::from_secs(seconds) {
        for frame in chunk.chunks_exact_mut(channels) {
            frame.fill(phase.sin() * AMPLITUDE);
            phase = (phase + step) % TAU;
        }
        sender.send_samples(&chunk)?;

        let now = Instant::now();
        if now >= next_report {
            let stats = sender.stats();
            println!(
                "[{:>3}s] pkts={} bytes={} errors={} overflow={} latency={:.2} ms",
                start.elapsed().as_secs(),
                stats.packets_sent,
                stats.bytes_sent,
                stats.send_errors,
                stats.overflow_bytes,
                sender.estimated_latency_ms().unwrap_or(0.0)
            );
            next_report += Duration::from_secs(1);
        }

        next_chunk += Duration::from_millis(CHUNK_MS);
        if let Some(wait) = next_chunk.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    println!("\nShutting down...");
    sender.shutdown();
    println!("Done.");
    Ok(())
}
