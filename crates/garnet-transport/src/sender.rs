//! Reliable-channel send side: sequence allocation, the fixed send window,
//! per-packet retransmit deadlines, and selective-acknowledgment ingestion.
//! Also owns the fire-and-forget unreliable channel.

use crate::config::ChannelConfig;
use crate::rto::RtoEstimator;
use crate::seq::{seq_before, seq_inc};
use crate::time::{elapsed_since, now_ms32, now_ms64};
use crate::timer::TimerEntry;
use crate::wire::{Channel, Header, SackPayload};
use bytes::Bytes;
use log::{debug, trace, warn};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Minimum spacing between consecutive reliable transmissions.
const PACING_GAP_MS: u64 = 1;

/// One transmitted-but-unacknowledged packet. The packet bytes and sequence
/// never change after the first transmission; only the deadline and the
/// attempt counter do.
#[derive(Debug)]
struct InflightEntry {
    packet: Bytes,
    retransmit_count: u32,
    deadline_ms: u64,
    timer_generation: u64,
}

/// Send side of one endpoint. All state is guarded by a single lock held by
/// the owner; the application, the I/O pump, and the retransmit driver all
/// call in through it.
pub struct SendWindow {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    /// Next sequence number to allocate.
    next_seq: u16,
    /// Oldest unacknowledged sequence. `next_seq - base` never exceeds
    /// `snd_win` in wraparound arithmetic.
    base: u16,
    /// Every sequence in `[base, next_seq)`.
    inflight: HashMap<u16, InflightEntry>,
    /// Payloads submitted while the window was full, oldest first.
    pending: VecDeque<Bytes>,
    estimator: RtoEstimator,
    snd_win: u16,
    rto_max: u32,
    last_send_ms: u64,
    /// Sequence counter for the unreliable channel. No retransmit state.
    useq: u16,
    /// Armed deadlines, nearest first. Entries are invalidated lazily: a
    /// popped entry whose generation no longer matches its inflight record
    /// is ignored, so each sequence has at most one live timer.
    timer_heap: BinaryHeap<Reverse<TimerEntry>>,
    generation_counter: u64,
    wake: Arc<Notify>,
}

impl SendWindow {
    pub fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        wake: Arc<Notify>,
        config: &ChannelConfig,
    ) -> Self {
        Self {
            socket,
            remote,
            next_seq: 0,
            base: 0,
            inflight: HashMap::new(),
            pending: VecDeque::new(),
            estimator: RtoEstimator::new(config.rdt_timeout_ms, config.rto_max_ms),
            snd_win: config.snd_win,
            rto_max: config.rto_max_ms,
            last_send_ms: 0,
            useq: 0,
            timer_heap: BinaryHeap::new(),
            generation_counter: 0,
            wake,
        }
    }

    /// Reliable packets currently in flight.
    pub fn inflight_len(&self) -> u16 {
        self.next_seq.wrapping_sub(self.base)
    }

    /// Payloads queued behind a full window.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Submits a reliable payload. Emits immediately while the window has
    /// room, otherwise queues; the queue drains in FIFO order as
    /// acknowledgments arrive. Never fails and never blocks the caller
    /// beyond the 1 ms pacing gap.
    pub async fn send_reliable(&mut self, payload: Bytes) {
        if self.inflight_len() < self.snd_win {
            self.emit_one(payload).await;
        } else {
            trace!("send window full, queueing payload ({} pending)", self.pending.len() + 1);
            self.pending.push_back(payload);
        }
    }

    /// Sends a best-effort packet: one transmission, no acknowledgment, no
    /// retransmission. Transmit errors are logged and swallowed.
    pub async fn send_unreliable(&mut self, payload: Bytes) {
        let packet = Header::new(Channel::Unreliable, self.useq, now_ms32()).frame(&payload);
        if let Err(e) = self.socket.send_to(&packet, self.remote).await {
            warn!("unreliable send failed: {e}");
        }
        self.useq = seq_inc(self.useq);
    }

    /// Allocates the next sequence, transmits, and arms its retransmit
    /// deadline. Precondition: the window has room.
    async fn emit_one(&mut self, payload: Bytes) {
        let seq = self.next_seq;
        let packet = Header::new(Channel::Data, seq, now_ms32()).frame(&payload);

        self.pace().await;
        if let Err(e) = self.socket.send_to(&packet, self.remote).await {
            warn!("reliable send failed (seq={seq}): {e}");
        }

        let deadline_ms = now_ms64() + self.estimator.rto() as u64;
        let generation = self.next_generation();
        self.inflight.insert(
            seq,
            InflightEntry {
                packet,
                retransmit_count: 0,
                deadline_ms,
                timer_generation: generation,
            },
        );
        self.schedule_timer(deadline_ms, seq, generation);
        self.next_seq = seq_inc(self.next_seq);
        trace!("sent seq {seq} ({} in flight)", self.inflight.len());
    }

    /// Keeps at least [`PACING_GAP_MS`] between consecutive transmissions.
    async fn pace(&mut self) {
        let gap = now_ms64().saturating_sub(self.last_send_ms);
        if gap < PACING_GAP_MS {
            tokio::time::sleep(Duration::from_millis(PACING_GAP_MS - gap)).await;
        }
        self.last_send_ms = now_ms64();
    }

    /// Ingests one acknowledgment packet: feeds the round-trip sample to the
    /// estimator, retires everything below the cumulative point, retires the
    /// selectively acknowledged ranges, then refills the window from the
    /// pending queue. Late or duplicate acknowledgments are no-ops.
    pub async fn handle_sack(&mut self, ack_ts_ms: u32, sack_payload: &[u8]) {
        let rtt_sample = elapsed_since(ack_ts_ms);
        if self.estimator.on_sample(rtt_sample) {
            self.rebase_deadlines();
        }

        let sack = SackPayload::parse(sack_payload);
        trace!(
            "sack: cum_ack={}, {} blocks, rtt_sample={}ms",
            sack.cum_ack,
            sack.blocks.len(),
            rtt_sample
        );

        // A peer cannot acknowledge past what was sent; stopping at
        // `next_seq` keeps the window accounting intact against a bogus
        // cumulative point.
        while seq_before(self.base, sack.cum_ack) && self.base != self.next_seq {
            self.inflight.remove(&self.base);
            self.base = seq_inc(self.base);
        }

        for block in &sack.blocks {
            let mut cur = block.start;
            loop {
                self.inflight.remove(&cur);
                if cur == block.end {
                    break;
                }
                cur = seq_inc(cur);
            }
        }

        while !self.pending.is_empty() && self.inflight_len() < self.snd_win {
            if let Some(payload) = self.pending.pop_front() {
                self.emit_one(payload).await;
            }
        }
    }

    /// Re-arms every inflight deadline at `now + rto` after an abrupt
    /// timeout shift, so deadlines computed under the old estimate do not
    /// dominate. Retransmit counters are preserved.
    fn rebase_deadlines(&mut self) {
        if self.inflight.is_empty() {
            return;
        }
        debug!(
            "rto moved to {}ms, rebasing {} inflight deadlines",
            self.estimator.rto(),
            self.inflight.len()
        );
        let deadline_ms = now_ms64() + self.estimator.rto() as u64;
        for (&seq, entry) in self.inflight.iter_mut() {
            self.generation_counter += 1;
            entry.deadline_ms = deadline_ms;
            entry.timer_generation = self.generation_counter;
            self.timer_heap.push(Reverse(TimerEntry {
                deadline_ms,
                seq,
                generation: self.generation_counter,
            }));
        }
        self.wake.notify_one();
    }

    /// Fires one retransmit deadline. Entries already acknowledged, or
    /// superseded by a newer deadline, are ignored. A live entry is resent
    /// as-is and re-armed with binary exponential backoff capped at the
    /// timeout ceiling.
    pub(crate) async fn on_timer(&mut self, seq: u16, generation: u64) {
        self.generation_counter += 1;
        let next_generation = self.generation_counter;

        let Some(entry) = self.inflight.get_mut(&seq) else {
            return;
        };
        if entry.timer_generation != generation {
            return;
        }

        entry.retransmit_count += 1;
        debug!("retransmit: seq {seq} timed out (attempt {})", entry.retransmit_count);
        if let Err(e) = self.socket.send_to(&entry.packet, self.remote).await {
            warn!("retransmit failed (seq={seq}): {e}");
        }

        let backoff_ms = ((self.estimator.rto() as u64) << entry.retransmit_count.min(16))
            .min(self.rto_max as u64);
        let deadline_ms = now_ms64() + backoff_ms;
        entry.deadline_ms = deadline_ms;
        entry.timer_generation = next_generation;
        self.timer_heap.push(Reverse(TimerEntry {
            deadline_ms,
            seq,
            generation: next_generation,
        }));
    }

    /// Pops the nearest due deadline. The inflight record is the source of
    /// truth: heap entries left behind by acknowledgments or reschedules are
    /// purged as they surface.
    pub(crate) fn pop_due_timer(&mut self, now_ms: u64) -> Option<(u16, u64)> {
        while let Some(&Reverse(entry)) = self.timer_heap.peek() {
            match self.inflight.get(&entry.seq) {
                Some(record) if record.timer_generation == entry.generation => {
                    if record.deadline_ms > now_ms {
                        return None;
                    }
                    self.timer_heap.pop();
                    return Some((entry.seq, entry.generation));
                }
                _ => {
                    self.timer_heap.pop();
                }
            }
        }
        None
    }

    /// Nearest armed deadline, if any.
    pub(crate) fn next_timer_deadline(&self) -> Option<u64> {
        self.timer_heap.peek().map(|entry| entry.0.deadline_ms)
    }

    /// Drops all send state: every timer, every inflight packet, every
    /// queued payload. Called once on shutdown.
    pub fn cancel_all(&mut self) {
        let dropped = self.inflight.len() + self.pending.len();
        if dropped > 0 {
            debug!("dropping {dropped} unacknowledged or queued payloads on shutdown");
        }
        self.inflight.clear();
        self.pending.clear();
        self.timer_heap.clear();
        self.next_seq = 0;
        self.base = 0;
        self.wake.notify_one();
    }

    fn schedule_timer(&mut self, deadline_ms: u64, seq: u16, generation: u64) {
        self.timer_heap.push(Reverse(TimerEntry {
            deadline_ms,
            seq,
            generation,
        }));
        self.wake.notify_one();
    }

    fn next_generation(&mut self) -> u64 {
        self.generation_counter += 1;
        self.generation_counter
    }
}
