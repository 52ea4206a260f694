/// In-process message bus.
///
/// The core publishes shares, found blocks, job broadcasts and telemetry
/// here; persistence, payout and API consumers subscribe out-of-core.
/// Fire-and-forget: a publish with no subscribers is dropped silently and
/// nothing downstream can backpressure the share path.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::shares::Share;

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryCategory {
    RpcRequest,
    ShareValidation,
    BlockSubmission,
}

#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub pool_id: String,
    pub category: TelemetryCategory,
    pub elapsed: Duration,
    pub success: bool,
    pub total: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    ClientShare {
        pool_id: String,
        share: Share,
    },
    BlockFound {
        pool_id: String,
        block_height: u64,
        block_hash: String,
    },
    JobBroadcast {
        pool_id: String,
        job_id: String,
        clean_jobs: bool,
    },
    Telemetry(TelemetryEvent),
}

pub struct MessageBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: PoolEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

/// Known bits of the 32-bit share-relay flags word.
pub const SHARE_FLAG_BLOCK_CANDIDATE: u32 = 0x01;
pub const SHARE_FLAG_STRATUM_V2: u32 = 0x02;
pub const FLAGS_MASK: u32 = SHARE_FLAG_BLOCK_CANDIDATE | SHARE_FLAG_STRATUM_V2;

/// Decode a share-relay flags word that may arrive in either byte order.
///
/// Upstream senders disagree on the endianness of this field. Valid flag
/// words only use the low bits, so when the little-endian reading carries
/// bits outside the known mask but the byte-swapped reading does not, the
/// word was big-endian. Returns `(flags, raw_le_word)` so the original
/// encoding stays recorded.
pub fn decode_share_flags(raw: [u8; 4]) -> (u32, u32) {
    let le = u32::from_le_bytes(raw);
    if le & !FLAGS_MASK == 0 {
        return (le, le);
    }
    let swapped = le.swap_bytes();
    if swapped & !FLAGS_MASK == 0 {
        return (swapped, le);
    }
    // Neither reading is clean; keep the in-mask little-endian bits.
    (le & FLAGS_MASK, le)
}
