//! The endpoint facade and its I/O pump.
//!
//! An [`Endpoint`] owns the UDP socket and two background tasks: the pump,
//! which reads datagrams and demultiplexes them by channel tag, and the
//! retransmit driver (only when a remote is configured). Applications submit
//! with [`Endpoint::send`] and poll deliveries with [`Endpoint::receive`].

use crate::config::ChannelConfig;
use crate::error::{Result, TransportError};
use crate::receiver::{Delivered, RecvWindow};
use crate::sender::SendWindow;
use crate::time::{now_ms32, time_to_deadline};
use crate::timer;
use crate::wire::{Channel, HEADER_SIZE, Header, MAX_DATAGRAM_SIZE};
use bytes::Bytes;
use garnet_binary::{BinaryReader, Readable};
use log::{debug, error, info, trace};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Bound on waiting for a worker task to exit during shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One side of a reliable/unreliable datagram link.
pub struct Endpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    sender: Option<Arc<Mutex<SendWindow>>>,
    delivery_rx: UnboundedReceiver<Delivered>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    pump: Option<JoinHandle<()>>,
    retransmit_driver: Option<JoinHandle<()>>,
    closed: bool,
}

impl Endpoint {
    /// Binds a socket on `local_port` (0 picks an ephemeral port) and starts
    /// the worker tasks. Without a remote the endpoint is receive-only and
    /// every send fails with [`TransportError::NoRemote`].
    pub async fn bind(
        local_port: u16,
        remote: Option<SocketAddr>,
        config: ChannelConfig,
    ) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port)).await?);
        let local_addr = socket.local_addr()?;

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(RecvWindow::new(
            socket.clone(),
            delivery_tx,
            &config,
        )));
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let sender = remote.map(|remote| {
            Arc::new(Mutex::new(SendWindow::new(
                socket.clone(),
                remote,
                wake.clone(),
                &config,
            )))
        });
        let retransmit_driver = sender.clone().map(|sender| {
            tokio::spawn(timer::run_retransmit_driver(
                sender,
                wake.clone(),
                stop.clone(),
            ))
        });

        match remote {
            Some(remote) => info!("endpoint bound to {local_addr}, sending to {remote}"),
            None => info!("endpoint bound to {local_addr}, receive only"),
        }

        let pump = tokio::spawn(run_pump(
            socket.clone(),
            sender.clone(),
            receiver,
            stop.clone(),
            config.default_recv_timeout_ms,
        ));

        Ok(Self {
            socket,
            local_addr,
            sender,
            delivery_rx,
            stop,
            wake,
            pump: Some(pump),
            retransmit_driver,
            closed: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Submits a payload. Reliable submissions past window capacity queue
    /// and drain as acknowledgments free space; the call never blocks on
    /// the window.
    pub async fn send(&self, data: Bytes, reliable: bool) -> Result<()> {
        if self.closed || self.stop.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let sender = self.sender.as_ref().ok_or(TransportError::NoRemote)?;
        let mut window = sender.lock().await;
        if reliable {
            window.send_reliable(data).await;
        } else {
            window.send_unreliable(data).await;
        }
        Ok(())
    }

    /// Non-blocking poll of the delivery queue.
    pub fn receive(&mut self) -> Option<Delivered> {
        self.delivery_rx.try_recv().ok()
    }

    /// Shuts the endpoint down: raises the stop flag, cancels every
    /// retransmit deadline, wakes the pump with a self-addressed datagram,
    /// and joins both workers with a bounded wait. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop.store(true, Ordering::Relaxed);

        if let Some(sender) = &self.sender {
            sender.lock().await.cancel_all();
        }
        self.wake.notify_one();

        // The pump blocks on the socket for up to its read timeout; an empty
        // datagram to our own port makes it notice the stop flag at once.
        if let Err(e) = self.socket.send_to(&[], self.wake_addr()).await {
            debug!("shutdown wake-up send failed: {e}");
        }

        if let Some(pump) = self.pump.take() {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, pump).await.is_err() {
                error!("pump did not exit within {SHUTDOWN_JOIN_TIMEOUT:?}");
            }
        }
        if let Some(driver) = self.retransmit_driver.take() {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, driver).await.is_err() {
                error!("retransmit driver did not exit within {SHUTDOWN_JOIN_TIMEOUT:?}");
            }
        }
        info!("endpoint {} closed", self.local_addr);
    }

    fn wake_addr(&self) -> SocketAddr {
        if self.local_addr.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_addr.port())
        } else {
            self.local_addr
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }
}

/// Single reader of the socket. Computes an adaptive timeout from the
/// receiver's skip deadline, dispatches packets by channel tag, and feeds
/// idle ticks to the receiver when the socket stays quiet.
async fn run_pump(
    socket: Arc<UdpSocket>,
    sender: Option<Arc<Mutex<SendWindow>>>,
    receiver: Arc<Mutex<RecvWindow>>,
    stop: Arc<AtomicBool>,
    default_recv_timeout_ms: u32,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let timeout_ms = {
            let window = receiver.lock().await;
            match window.next_skip_deadline() {
                Some(deadline) => {
                    time_to_deadline(now_ms32(), deadline).min(default_recv_timeout_ms)
                }
                None => default_recv_timeout_ms,
            }
        };

        let read = tokio::time::timeout(
            Duration::from_millis(timeout_ms as u64),
            socket.recv_from(&mut buf),
        )
        .await;

        match read {
            Err(_) => {
                receiver.lock().await.on_idle(now_ms32());
            }
            Ok(Err(e)) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                error!("socket receive failed: {e}");
            }
            Ok(Ok((len, src))) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let data = Bytes::copy_from_slice(&buf[..len]);
                match decode_packet(data) {
                    Ok((header, payload)) => {
                        dispatch(header, payload, src, &sender, &receiver).await;
                    }
                    Err(e) => trace!("dropping packet from {src}: {e}"),
                }
            }
        }
    }
    debug!("pump exited");
}

/// Splits a datagram into header and payload. Anything that cannot be
/// dispatched comes back as a typed error for the pump to log and drop.
fn decode_packet(data: Bytes) -> Result<(Header, Bytes)> {
    if data.len() < HEADER_SIZE {
        return Err(TransportError::TruncatedPacket { len: data.len() });
    }
    let tag = data[0];
    if Channel::from_tag(tag).is_none() {
        return Err(TransportError::UnknownChannel(tag));
    }
    let mut reader = BinaryReader::new(data);
    let header = Header::read(&mut reader)?;
    Ok((header, reader.read_remaining()))
}

async fn dispatch(
    header: Header,
    payload: Bytes,
    src: SocketAddr,
    sender: &Option<Arc<Mutex<SendWindow>>>,
    receiver: &Arc<Mutex<RecvWindow>>,
) {
    match header.channel {
        Channel::Data => {
            let mut window = receiver.lock().await;
            window
                .handle_reliable(header.seq, header.ts_ms, payload, src)
                .await;
            // A steady stream of arrivals can keep the socket from ever
            // timing out; run the skip check here too so an armed deadline
            // still fires under load.
            window.on_idle(now_ms32());
        }
        Channel::Unreliable => {
            receiver.lock().await.handle_unreliable(header.ts_ms, payload);
        }
        Channel::Ack => match sender {
            Some(sender) => {
                sender
                    .lock()
                    .await
                    .handle_sack(header.ts_ms, &payload)
                    .await;
            }
            None => trace!("ignoring acknowledgment on receive-only endpoint"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_packets_are_typed_as_truncated() {
        let err = decode_packet(Bytes::from_static(&[0x00, 0x00, 0x01])).unwrap_err();
        assert!(matches!(err, TransportError::TruncatedPacket { len: 3 }));
        let err = decode_packet(Bytes::new()).unwrap_err();
        assert!(matches!(err, TransportError::TruncatedPacket { len: 0 }));
    }

    #[test]
    fn unknown_channel_tags_are_typed() {
        let mut raw = Header::new(Channel::Data, 9, 100).frame(b"x").to_vec();
        raw[0] = 7;
        let err = decode_packet(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, TransportError::UnknownChannel(7)));
    }

    #[test]
    fn binary_errors_convert_into_transport_errors() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[0x00, 0x01]));
        let err: TransportError = Header::read(&mut reader).unwrap_err().into();
        assert!(matches!(err, TransportError::Binary(_)));
    }

    #[test]
    fn valid_packets_split_into_header_and_payload() {
        let packet = Header::new(Channel::Unreliable, 4, 42).frame(b"ping");
        let (header, payload) = decode_packet(packet).unwrap();
        assert_eq!(header.channel, Channel::Unreliable);
        assert_eq!(header.seq, 4);
        assert_eq!(header.ts_ms, 42);
        assert_eq!(payload.as_ref(), b"ping");
    }
}
