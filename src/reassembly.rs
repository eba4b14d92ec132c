use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::trace;

/// Receiver-side sequencing of one file transfer. Fragments arrive in
///  arbitrary order and arbitrarily duplicated; the destination file must be
///  written strictly in ascending, contiguous fragment order. A cursor tracks
///  the next fragment the file needs, early arrivals wait in a min-heap until
///  the gap before them closes, and stale duplicates (below the cursor) are
///  dropped, which makes the whole thing idempotent under retransmission.
///
/// Also accumulates the selective-ack report: the fragment ids accepted since
///  the report was last taken. Stale duplicates are not reported - the report
///  never names an id the cursor has already passed.
pub(crate) struct Reassembly {
    next_fragment_id: u16,
    early_arrivals: BinaryHeap<Reverse<(u16, Bytes)>>,
    report: Vec<u16>,
}

impl Reassembly {
    pub fn new() -> Reassembly {
        Reassembly {
            next_fragment_id: 0,
            early_arrivals: BinaryHeap::new(),
            report: Vec::new(),
        }
    }

    /// Feeds one arriving fragment, returning the chunks that became due for
    ///  writing, in order.
    pub fn offer(&mut self, fragment_id: u16, data: Bytes) -> Vec<Bytes> {
        if fragment_id < self.next_fragment_id {
            trace!("stale duplicate of fragment {} - dropping", fragment_id);
            return Vec::new();
        }
        self.report.push(fragment_id);

        let mut ready = Vec::new();
        if fragment_id == self.next_fragment_id {
            ready.push(data);
            self.next_fragment_id = self.next_fragment_id.wrapping_add(1);
        }
        else {
            self.early_arrivals.push(Reverse((fragment_id, data)));
        }

        while let Some(Reverse((id, _))) = self.early_arrivals.peek() {
            if *id > self.next_fragment_id {
                break;
            }
            if let Some(Reverse((id, data))) = self.early_arrivals.pop() {
                if id == self.next_fragment_id {
                    ready.push(data);
                    self.next_fragment_id = self.next_fragment_id.wrapping_add(1);
                }
                // ids below the cursor are duplicates of already-written fragments
            }
        }
        ready
    }

    /// Takes the selective-ack report, leaving it empty for the next round.
    pub fn take_report(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.report)
    }

    /// Number of fragments written so far (the cursor).
    pub fn fragments_written(&self) -> u16 {
        self.next_fragment_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload(fragment_id: u16) -> Bytes {
        Bytes::from(format!("fragment {}", fragment_id))
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3])]
    #[case::reversed(vec![3, 2, 1, 0])]
    #[case::interleaved(vec![1, 0, 3, 2])]
    #[case::gap_closing_late(vec![1, 2, 3, 0])]
    #[case::duplicates_behind_cursor(vec![0, 0, 1, 2, 1, 3])]
    #[case::duplicates_ahead_of_cursor(vec![2, 2, 0, 1, 3])]
    #[case::everything_twice(vec![3, 1, 0, 2, 3, 1, 0, 2])]
    fn test_writes_in_order_exactly_once(#[case] arrivals: Vec<u16>) {
        let mut reassembly = Reassembly::new();

        let mut written = Vec::new();
        for fragment_id in arrivals {
            written.extend(reassembly.offer(fragment_id, payload(fragment_id)));
        }

        let expected = (0..4).map(payload).collect::<Vec<_>>();
        assert_eq!(written, expected);
        assert_eq!(reassembly.fragments_written(), 4);
    }

    #[test]
    fn test_report_contains_ids_since_last_take() {
        let mut reassembly = Reassembly::new();

        reassembly.offer(0, payload(0));
        reassembly.offer(2, payload(2));
        assert_eq!(reassembly.take_report(), vec![0, 2]);

        reassembly.offer(1, payload(1));
        assert_eq!(reassembly.take_report(), vec![1]);

        assert_eq!(reassembly.take_report(), Vec::<u16>::new());
    }

    #[test]
    fn test_report_never_names_stale_duplicates() {
        let mut reassembly = Reassembly::new();

        reassembly.offer(0, payload(0));
        reassembly.offer(1, payload(1));
        reassembly.take_report();

        // retransmissions of fragments the cursor has passed
        assert!(reassembly.offer(0, payload(0)).is_empty());
        assert!(reassembly.offer(1, payload(1)).is_empty());
        reassembly.offer(2, payload(2));

        assert_eq!(reassembly.take_report(), vec![2]);
    }

    #[test]
    fn test_early_arrival_waits_for_the_gap() {
        let mut reassembly = Reassembly::new();

        assert!(reassembly.offer(1, payload(1)).is_empty());
        assert_eq!(reassembly.fragments_written(), 0);

        let ready = reassembly.offer(0, payload(0));
        assert_eq!(ready, vec![payload(0), payload(1)]);
        assert_eq!(reassembly.fragments_written(), 2);
    }
}
