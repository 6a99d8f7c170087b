//! Retransmit timing. One driver task per endpoint serves every inflight
//! packet's deadline off a shared min-heap, instead of a timer task per
//! packet.

use crate::sender::SendWindow;
use crate::time::now_ms64;
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// One armed deadline for an inflight sequence. Ordering is by deadline, so
/// a `BinaryHeap<Reverse<TimerEntry>>` pops the nearest one first. Entries
/// are never removed early: a popped entry whose generation no longer
/// matches its inflight record is simply discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerEntry {
    pub deadline_ms: u64,
    pub seq: u16,
    pub generation: u64,
}

/// Sleep bound while no deadline is armed; `wake` cuts any sleep short.
const IDLE_WAIT_MS: u64 = 500;

/// Drives the sender's retransmit deadlines until `stop` is raised. The
/// sender notifies `wake` whenever it arms or clears a deadline.
pub(crate) async fn run_retransmit_driver(
    sender: Arc<Mutex<SendWindow>>,
    wake: Arc<Notify>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let next_deadline = {
            let mut window = sender.lock().await;
            let now = now_ms64();
            while let Some((seq, generation)) = window.pop_due_timer(now) {
                window.on_timer(seq, generation).await;
            }
            window.next_timer_deadline()
        };

        let wait_ms = next_deadline
            .map(|deadline| deadline.saturating_sub(now_ms64()).max(1))
            .unwrap_or(IDLE_WAIT_MS);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            _ = wake.notified() => {}
        }
    }
    trace!("retransmit driver exited");
}
