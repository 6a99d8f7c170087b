//! Reliable-channel receive side: the reorder buffer, in-order delivery,
//! selective-acknowledgment generation, and the skip deadline that bounds
//! how long a single missing packet may stall delivery. Unreliable packets
//! pass straight through.

use crate::config::ChannelConfig;
use crate::seq::{in_window, seq_before, seq_inc};
use crate::time::{deadline_after, elapsed_since, now_ms32, time_to_deadline};
use crate::wire::{Channel, Header, MAX_SACK_BLOCKS, SackBlock, SackPayload};
use bytes::Bytes;
use log::{trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;

/// One item handed to the application.
#[derive(Debug, Clone)]
pub struct Delivered {
    /// Sequence number for reliable deliveries, absent for unreliable ones.
    pub seq: Option<u16>,
    /// Millisecond timestamp the sender stamped into the packet.
    pub sender_ts_ms: u32,
    pub payload: Bytes,
    /// Milliseconds between the sender's stamp and local delivery.
    pub rtt_ms: u32,
}

/// Receive side of one endpoint, guarded by its own lock.
pub struct RecvWindow {
    socket: Arc<UdpSocket>,
    delivery: UnboundedSender<Delivered>,
    /// Lowest sequence not yet delivered.
    next_expected: u16,
    /// Out-of-order packets waiting for the gap below them to fill. Every
    /// key is strictly after `next_expected` and inside the receive window.
    buffer: HashMap<u16, (Bytes, u32)>,
    /// Armed only while the buffer holds packets and `next_expected` is
    /// missing. When it expires the gap is abandoned.
    skip_deadline_ms: Option<u32>,
    recv_win: u16,
    skip_timeout_ms: u32,
}

impl RecvWindow {
    pub fn new(
        socket: Arc<UdpSocket>,
        delivery: UnboundedSender<Delivered>,
        config: &ChannelConfig,
    ) -> Self {
        Self {
            socket,
            delivery,
            next_expected: 0,
            buffer: HashMap::new(),
            skip_deadline_ms: None,
            recv_win: config.recv_win,
            skip_timeout_ms: config.skip_timeout_ms,
        }
    }

    /// Processes one reliable data packet. The packet is absorbed first and
    /// the acknowledgment sent after, so the reply always reflects the state
    /// the packet produced. Old, duplicate, and out-of-window sequences are
    /// acknowledged and then dropped: the acknowledgment is what lets the
    /// sender retire its copy.
    pub async fn handle_reliable(
        &mut self,
        seq: u16,
        ts_ms: u32,
        payload: Bytes,
        src: SocketAddr,
    ) {
        if seq_before(seq, self.next_expected) {
            trace!("stale seq {seq} (next expected {})", self.next_expected);
        } else if self.buffer.contains_key(&seq) {
            trace!("duplicate seq {seq}, already buffered");
        } else if !in_window(seq, self.next_expected, self.recv_win) {
            warn!(
                "seq {seq} outside receive window [{}, +{}), dropping",
                self.next_expected, self.recv_win
            );
        } else {
            self.buffer.insert(seq, (payload, ts_ms));
            trace!(
                "buffered seq {seq} (next expected {}, {} buffered)",
                self.next_expected,
                self.buffer.len()
            );
            self.drain();
            if self.has_gap() && self.skip_deadline_ms.is_none() {
                self.skip_deadline_ms =
                    Some(deadline_after(now_ms32(), self.skip_timeout_ms));
            }
        }

        self.send_sack(seq, src).await;
    }

    /// Hands an unreliable packet straight to the application. No buffering,
    /// no acknowledgment, no state change.
    pub fn handle_unreliable(&mut self, ts_ms: u32, payload: Bytes) {
        let rtt_ms = elapsed_since(ts_ms);
        self.deliver(Delivered {
            seq: None,
            sender_ts_ms: ts_ms,
            payload,
            rtt_ms,
        });
    }

    /// Runs the skip state machine. Called by the pump on every read timeout
    /// and opportunistically between packets. When the armed deadline has
    /// expired and the gap is still open, the missing sequence is abandoned:
    /// delivery jumps over it and the application sees the hole as a jump in
    /// delivered sequence numbers.
    pub fn on_idle(&mut self, now_ms: u32) {
        if self.buffer.is_empty() {
            self.skip_deadline_ms = None;
            return;
        }

        let expired = self
            .skip_deadline_ms
            .is_some_and(|deadline| time_to_deadline(now_ms, deadline) == 0);
        if expired && !self.buffer.contains_key(&self.next_expected) {
            let missing = self.next_expected;
            warn!("skip timeout reached, abandoning missing seq {missing}");
            self.next_expected = seq_inc(self.next_expected);
            self.skip_deadline_ms = None;
            self.drain();
            if self.has_gap() {
                self.skip_deadline_ms = Some(deadline_after(now_ms, self.skip_timeout_ms));
            }
        }
    }

    /// Deadline the pump should wake up for, if one is armed.
    pub fn next_skip_deadline(&self) -> Option<u32> {
        self.skip_deadline_ms
    }

    /// Delivers every consecutively buffered packet starting at
    /// `next_expected`. Any progress clears the skip deadline, since the gap
    /// it was armed for no longer exists.
    fn drain(&mut self) {
        let mut progressed = false;
        while let Some((payload, sender_ts_ms)) = self.buffer.remove(&self.next_expected) {
            let seq = self.next_expected;
            let rtt_ms = elapsed_since(sender_ts_ms);
            self.deliver(Delivered {
                seq: Some(seq),
                sender_ts_ms,
                payload,
                rtt_ms,
            });
            self.next_expected = seq_inc(self.next_expected);
            progressed = true;
        }
        if progressed {
            self.skip_deadline_ms = None;
        }
    }

    fn has_gap(&self) -> bool {
        !self.buffer.is_empty() && !self.buffer.contains_key(&self.next_expected)
    }

    fn deliver(&self, item: Delivered) {
        if self.delivery.send(item).is_err() {
            trace!("delivery queue closed, dropping item");
        }
    }

    /// Coalesces the buffered sequences into maximal runs, nearest to
    /// `next_expected` first. Runs beyond the wire limit are dropped; the
    /// sender learns them from later acknowledgments.
    fn sack_blocks(&self) -> Vec<SackBlock> {
        let mut seqs: Vec<u16> = self.buffer.keys().copied().collect();
        seqs.sort_unstable_by_key(|&seq| seq.wrapping_sub(self.next_expected));

        let mut blocks: Vec<SackBlock> = Vec::new();
        for seq in seqs {
            match blocks.last_mut() {
                Some(block) if seq == seq_inc(block.end) => block.end = seq,
                _ => blocks.push(SackBlock::new(seq, seq)),
            }
        }
        blocks.truncate(MAX_SACK_BLOCKS);
        blocks
    }

    async fn send_sack(&self, echo_seq: u16, dst: SocketAddr) {
        let sack = SackPayload::new(self.next_expected, self.sack_blocks());
        let packet = Header::new(Channel::Ack, echo_seq, now_ms32()).frame(&sack.encode());
        if let Err(e) = self.socket.send_to(&packet, dst).await {
            warn!("ack send failed (seq={echo_seq}): {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_binary::{BinaryReader, Readable};
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        window: RecvWindow,
        delivered: UnboundedReceiver<Delivered>,
        peer: UdpSocket,
        peer_addr: SocketAddr,
    }

    async fn harness() -> Harness {
        harness_with_config(&ChannelConfig::default()).await
    }

    async fn harness_with_config(config: &ChannelConfig) -> Harness {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let (tx, delivered) = mpsc::unbounded_channel();
        let window = RecvWindow::new(socket, tx, config);
        Harness {
            window,
            delivered,
            peer,
            peer_addr,
        }
    }

    impl Harness {
        async fn ingest(&mut self, seq: u16) {
            self.window
                .handle_reliable(seq, now_ms32(), Bytes::from(format!("m{seq}")), self.peer_addr)
                .await;
        }

        async fn next_sack(&mut self) -> (Header, SackPayload) {
            let mut buf = [0u8; 64];
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), self.peer.recv_from(&mut buf))
                .await
                .expect("timed out waiting for ack")
                .unwrap();
            let mut reader = BinaryReader::new(Bytes::copy_from_slice(&buf[..len]));
            let header = Header::read(&mut reader).unwrap();
            (header, SackPayload::parse(&reader.read_remaining()))
        }

        fn delivered_seqs(&mut self) -> Vec<Option<u16>> {
            let mut seqs = Vec::new();
            while let Ok(item) = self.delivered.try_recv() {
                seqs.push(item.seq);
            }
            seqs
        }
    }

    // Padding in an otherwise empty block list reads back as a degenerate
    // (0, 0) block; tests spell that out rather than hide it.
    fn no_blocks() -> Vec<SackBlock> {
        vec![SackBlock::new(0, 0)]
    }

    #[tokio::test]
    async fn in_order_packets_deliver_immediately() {
        let mut h = harness().await;
        for seq in 0..3 {
            h.ingest(seq).await;
        }

        assert_eq!(h.delivered_seqs(), vec![Some(0), Some(1), Some(2)]);
        for expected_cum in 1..=3u16 {
            let (header, sack) = h.next_sack().await;
            assert_eq!(header.channel, Channel::Ack);
            assert_eq!(header.seq, expected_cum - 1);
            assert_eq!(sack.cum_ack, expected_cum);
            assert_eq!(sack.blocks, no_blocks());
        }
    }

    #[tokio::test]
    async fn delivery_reports_payload_and_rtt() {
        let mut h = harness().await;
        h.ingest(0).await;
        let item = h.delivered.try_recv().unwrap();
        assert_eq!(item.seq, Some(0));
        assert_eq!(item.payload.as_ref(), b"m0");
        assert!(item.rtt_ms < 1_000);
    }

    #[tokio::test]
    async fn reordered_arrivals_deliver_in_sequence() {
        let mut h = harness().await;

        h.ingest(2).await;
        let (_, sack) = h.next_sack().await;
        assert_eq!(sack.cum_ack, 0);
        assert_eq!(sack.blocks, vec![SackBlock::new(2, 2)]);

        h.ingest(0).await;
        let (_, sack) = h.next_sack().await;
        assert_eq!(sack.cum_ack, 1);
        assert_eq!(sack.blocks, vec![SackBlock::new(2, 2)]);

        h.ingest(1).await;
        let (_, sack) = h.next_sack().await;
        assert_eq!(sack.cum_ack, 3);
        assert_eq!(sack.blocks, no_blocks());

        h.ingest(4).await;
        let (_, sack) = h.next_sack().await;
        assert_eq!(sack.cum_ack, 3);
        assert_eq!(sack.blocks, vec![SackBlock::new(4, 4)]);

        h.ingest(3).await;
        let (_, sack) = h.next_sack().await;
        assert_eq!(sack.cum_ack, 5);
        assert_eq!(sack.blocks, no_blocks());

        assert_eq!(
            h.delivered_seqs(),
            vec![Some(0), Some(1), Some(2), Some(3), Some(4)]
        );
    }

    #[tokio::test]
    async fn sack_blocks_coalesce_runs() {
        let mut h = harness().await;
        for seq in [2u16, 3, 4, 7, 9, 10] {
            h.ingest(seq).await;
        }
        // Drain the acknowledgments; the final one has the full picture.
        let mut last = None;
        for _ in 0..6 {
            last = Some(h.next_sack().await);
        }
        let (_, sack) = last.unwrap();
        assert_eq!(sack.cum_ack, 0);
        assert_eq!(
            sack.blocks,
            vec![
                SackBlock::new(2, 4),
                SackBlock::new(7, 7),
                SackBlock::new(9, 10)
            ]
        );
        assert!(h.delivered_seqs().is_empty());
    }

    #[tokio::test]
    async fn stale_and_duplicate_packets_still_acknowledged() {
        let mut h = harness().await;
        h.ingest(0).await;
        h.next_sack().await;
        assert_eq!(h.delivered_seqs(), vec![Some(0)]);

        // Same packet again: stale now, acknowledged, not redelivered.
        h.ingest(0).await;
        let (_, sack) = h.next_sack().await;
        assert_eq!(sack.cum_ack, 1);
        assert!(h.delivered_seqs().is_empty());

        // A buffered duplicate is also dropped without a second entry.
        h.ingest(5).await;
        h.ingest(5).await;
        let (_, first) = h.next_sack().await;
        let (_, second) = h.next_sack().await;
        assert_eq!(first.blocks, vec![SackBlock::new(5, 5)]);
        assert_eq!(second.blocks, vec![SackBlock::new(5, 5)]);
        assert!(h.delivered_seqs().is_empty());
    }

    #[tokio::test]
    async fn out_of_window_sequences_are_not_buffered() {
        let mut h = harness_with_config(&ChannelConfig {
            recv_win: 8,
            ..ChannelConfig::default()
        })
        .await;

        h.ingest(100).await;
        let (_, sack) = h.next_sack().await;
        assert_eq!(sack.cum_ack, 0);
        assert_eq!(sack.blocks, no_blocks());

        // An in-window arrival shows the rejected one left no trace.
        h.ingest(2).await;
        let (_, sack) = h.next_sack().await;
        assert_eq!(sack.blocks, vec![SackBlock::new(2, 2)]);
    }

    #[tokio::test]
    async fn skip_abandons_a_timed_out_gap() {
        let mut h = harness().await;
        for seq in 0..3 {
            h.ingest(seq).await;
        }
        for seq in 4..10 {
            h.ingest(seq).await;
        }
        assert_eq!(h.delivered_seqs(), vec![Some(0), Some(1), Some(2)]);
        assert!(h.window.next_skip_deadline().is_some());

        // Before the deadline nothing moves.
        h.window.on_idle(now_ms32());
        assert!(h.delivered_seqs().is_empty());

        // After it, the hole is abandoned and everything behind it drains.
        let late = now_ms32().wrapping_add(h.window.skip_timeout_ms + 10);
        h.window.on_idle(late);
        assert_eq!(
            h.delivered_seqs(),
            vec![Some(4), Some(5), Some(6), Some(7), Some(8), Some(9)]
        );
        assert!(h.window.next_skip_deadline().is_none());
        assert!(h.window.buffer.is_empty());
    }

    #[tokio::test]
    async fn skip_rearms_when_another_gap_remains() {
        let mut h = harness().await;
        h.ingest(1).await;
        h.ingest(3).await;
        assert!(h.window.next_skip_deadline().is_some());

        let late = now_ms32().wrapping_add(h.window.skip_timeout_ms + 10);
        h.window.on_idle(late);
        // Seq 0 was skipped, 1 delivered, and a fresh deadline now guards
        // the gap in front of 3.
        assert_eq!(h.delivered_seqs(), vec![Some(1)]);
        assert!(h.window.next_skip_deadline().is_some());

        let later = late.wrapping_add(h.window.skip_timeout_ms + 10);
        h.window.on_idle(later);
        assert_eq!(h.delivered_seqs(), vec![Some(3)]);
        assert!(h.window.next_skip_deadline().is_none());
    }

    #[tokio::test]
    async fn filling_the_gap_clears_the_deadline() {
        let mut h = harness().await;
        h.ingest(1).await;
        assert!(h.window.next_skip_deadline().is_some());

        h.ingest(0).await;
        assert_eq!(h.delivered_seqs(), vec![Some(0), Some(1)]);
        assert!(h.window.next_skip_deadline().is_none());
    }

    #[tokio::test]
    async fn idle_with_empty_buffer_clears_the_deadline() {
        let mut h = harness().await;
        h.window.skip_deadline_ms = Some(now_ms32());
        h.window.on_idle(now_ms32());
        assert!(h.window.next_skip_deadline().is_none());
    }

    #[tokio::test]
    async fn unreliable_passes_through_without_acks() {
        let mut h = harness().await;
        h.window.handle_unreliable(now_ms32(), Bytes::from_static(b"u"));

        let item = h.delivered.try_recv().unwrap();
        assert_eq!(item.seq, None);
        assert_eq!(item.payload.as_ref(), b"u");

        // No acknowledgment goes out for unreliable traffic.
        let mut buf = [0u8; 64];
        let got = tokio::time::timeout(Duration::from_millis(100), h.peer.recv_from(&mut buf)).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn delivery_continues_across_sequence_wrap() {
        let mut h = harness().await;
        h.window.next_expected = 0xFFFE;
        for seq in [0xFFFEu16, 0xFFFF, 0x0000, 0x0001] {
            h.ingest(seq).await;
        }
        assert_eq!(
            h.delivered_seqs(),
            vec![Some(0xFFFE), Some(0xFFFF), Some(0x0000), Some(0x0001)]
        );
        // Everything delivered; the final cumulative point wrapped past zero.
        let mut last = None;
        for _ in 0..4 {
            last = Some(h.next_sack().await);
        }
        assert_eq!(last.unwrap().1.cum_ack, 0x0002);
    }
}
