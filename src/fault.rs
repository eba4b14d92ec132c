use crate::segment::{Segment, SegmentType, OFFSET_CHECKSUM};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Deliberate corruption of outgoing traffic, for exercising the checksum and
///  retransmission paths against a live peer (the console's `LOSS` directive)
///  and in tests. Inert until armed; while the countdown is positive, each
///  Data or Text segment leaves with one checksum bit flipped, so the
///  receiver drops it as corrupted.
#[derive(Debug, Default)]
pub struct FaultInjector {
    pending_corruptions: AtomicU32,
}

impl FaultInjector {
    pub fn new() -> FaultInjector {
        FaultInjector {
            pending_corruptions: AtomicU32::new(0),
        }
    }

    /// Arms corruption of the next `n` outgoing Data/Text segments,
    ///  replacing any previous countdown.
    pub fn arm_corruption(&self, n: u32) {
        self.pending_corruptions.store(n, Ordering::Relaxed);
    }

    /// Applied by the connection after serialization, right before the
    ///  segment goes out on the socket.
    pub(crate) fn maybe_corrupt(&self, segment: &Segment, serialized: &mut [u8]) {
        match segment.segment_type() {
            SegmentType::Data | SegmentType::Text => {}
            _ => return,
        }
        if self.try_consume() {
            serialized[OFFSET_CHECKSUM] ^= 0x01;
            warn!("fault injection: flipped a checksum bit of outgoing {}", segment);
        }
    }

    fn try_consume(&self) -> bool {
        self.pending_corruptions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}
