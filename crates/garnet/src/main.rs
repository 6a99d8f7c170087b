use bytes::Bytes;
use garnet_log::GarnetLogger;
use garnet_transport::{Endpoint, TransportError};
use log::{Level, SetLoggerError, error, info, logger};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::stats::LatencyStats;

pub mod config;
pub mod stats;

#[tokio::main]
async fn main() -> Result<(), SetLoggerError> {
    GarnetLogger::init(Level::Info, 4096)?;

    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            logger().flush();
            std::process::exit(1);
        }
    };

    let remote = match resolve_remote(&config) {
        Ok(remote) => remote,
        Err(message) => {
            error!("{message}");
            logger().flush();
            std::process::exit(1);
        }
    };

    let result = match remote {
        Some(remote) => run_sender(&config, remote).await,
        None => run_receiver(&config).await,
    };

    if let Err(e) = result {
        error!("Endpoint failed: {e}");
        logger().flush();
        std::process::exit(1);
    }

    logger().flush();
    Ok(())
}

fn resolve_remote(config: &Config) -> Result<Option<SocketAddr>, String> {
    let (Some(host), Some(port)) = (&config.network.remote_host, config.network.remote_port)
    else {
        return Ok(None);
    };
    match (host.as_str(), port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => Ok(Some(addr)),
            None => Err(format!("Remote {host}:{port} resolved to no addresses.")),
        },
        Err(e) => Err(format!("Failed to resolve remote {host}:{port}: {e}")),
    }
}

/// Traffic generator: submits payloads at a fixed rate, flipping a weighted
/// coin per packet to pick the reliable or the unreliable channel.
async fn run_sender(config: &Config, remote: SocketAddr) -> Result<(), TransportError> {
    let mut endpoint =
        Endpoint::bind(config.network.local_port, Some(remote), config.channel.clone()).await?;

    let traffic = &config.traffic;
    info!(
        "Generating {} pps for {}s ({:.0}% reliable, {} byte payloads)",
        traffic.rate_pps,
        traffic.duration_secs,
        traffic.reliable_ratio * 100.0,
        traffic.payload_bytes
    );

    let interval = Duration::from_secs_f64(1.0 / traffic.rate_pps as f64);
    let started = Instant::now();
    let mut packet_id: u64 = 0;
    let mut reliable_sent: u64 = 0;
    let mut unreliable_sent: u64 = 0;

    while started.elapsed() < Duration::from_secs(traffic.duration_secs) {
        packet_id += 1;
        let payload = build_payload(packet_id, traffic.payload_bytes);
        let reliable = rand::random::<f64>() < traffic.reliable_ratio;

        endpoint.send(payload, reliable).await?;
        if reliable {
            reliable_sent += 1;
        } else {
            unreliable_sent += 1;
        }

        tokio::time::sleep(interval).await;
    }

    info!("Traffic run finished");
    info!("  Reliable sent:   {reliable_sent}");
    info!("  Unreliable sent: {unreliable_sent}");
    info!("  Total sent:      {}", reliable_sent + unreliable_sent);
    logger().flush();

    endpoint.close().await;
    Ok(())
}

/// Delivery sink: drains the endpoint for the configured duration (plus a
/// grace period for stragglers), then reports per-channel latency, jitter,
/// and throughput.
async fn run_receiver(config: &Config) -> Result<(), TransportError> {
    let mut endpoint =
        Endpoint::bind(config.network.local_port, None, config.channel.clone()).await?;

    let run_for = Duration::from_secs(config.traffic.duration_secs + 5);
    info!("Sinking deliveries for {}s", run_for.as_secs());

    let started = Instant::now();
    let mut reliable_stats = LatencyStats::default();
    let mut unreliable_stats = LatencyStats::default();
    let mut total_bytes: u64 = 0;

    while started.elapsed() < run_for {
        let Some(item) = endpoint.receive() else {
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        };

        total_bytes += item.payload.len() as u64;
        let preview = hex::encode(&item.payload[..item.payload.len().min(8)]);
        match item.seq {
            Some(seq) => {
                info!(
                    "reliable   seq={seq:<5} ts={:<10} rtt={:<4}ms payload[..8]={preview}",
                    item.sender_ts_ms, item.rtt_ms
                );
                reliable_stats.record(item.rtt_ms);
            }
            None => {
                info!(
                    "unreliable seq=n/a   ts={:<10} rtt={:<4}ms payload[..8]={preview}",
                    item.sender_ts_ms, item.rtt_ms
                );
                unreliable_stats.record(item.rtt_ms);
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    let throughput_kbps = (total_bytes as f64 * 8.0) / elapsed / 1000.0;

    info!("Run finished");
    info!("  Total bytes received: {total_bytes}");
    info!("  Average throughput:   {throughput_kbps:.2} kbps");
    info!("  Reliable received:    {}", reliable_stats.count());
    info!("  Unreliable received:  {}", unreliable_stats.count());
    report_latency("Reliable", &reliable_stats);
    report_latency("Unreliable", &unreliable_stats);
    logger().flush();

    endpoint.close().await;
    Ok(())
}

fn report_latency(label: &str, stats: &LatencyStats) {
    if stats.count() == 0 {
        return;
    }
    info!(
        "  {label} latency: mean={:.2}ms min={}ms max={}ms jitter={:.2}ms",
        stats.mean(),
        stats.min().unwrap_or(0),
        stats.max().unwrap_or(0),
        stats.jitter()
    );
}

/// Payload with the packet id up front so the sink's previews stay legible.
fn build_payload(packet_id: u64, size: usize) -> Bytes {
    let mut payload = Vec::with_capacity(size);
    payload.extend_from_slice(&packet_id.to_be_bytes());
    while payload.len() < size {
        payload.push(b'a');
    }
    payload.truncate(size);
    Bytes::from(payload)
}
