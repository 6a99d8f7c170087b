use serde::{Deserialize, Serialize};

/// Tunables for one endpoint. Defaults match the protocol's reference
/// parameters; both peers may run with different values, only the wire
/// layout has to agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum reliable packets in flight before submissions queue.
    pub snd_win: u16,
    /// Reorder-buffer span accepted beyond the next expected sequence.
    pub recv_win: u16,
    /// Initial round-trip estimate, seeds the retransmission timeout.
    pub rdt_timeout_ms: u32,
    /// How long a gap may stall delivery before the receiver skips it.
    pub skip_timeout_ms: u32,
    /// Socket read timeout when no skip deadline is pending.
    pub default_recv_timeout_ms: u32,
    /// Hard ceiling on the retransmission timeout.
    pub rto_max_ms: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            snd_win: 512,
            recv_win: 512,
            rdt_timeout_ms: 100,
            skip_timeout_ms: 200,
            default_recv_timeout_ms: 50,
            rto_max_ms: 60_000,
        }
    }
}
