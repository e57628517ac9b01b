use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::protocol::record::{AckKind, AckPacket, Record};
use crate::util::u24::U24;

/// Gaps bigger than this are not tracked as individual missing sequence numbers: a peer jumping
///  that far ahead is either broken or malicious, and NAK'ing the gap would only amplify traffic
const MAX_TRACKED_GAP: u32 = 1024;

/// Tracks incoming datagram sequence numbers for a session, providing the content of the next
///  ACK and NACK packets.
///
/// `received` holds sequence numbers seen since the last ACK flush, `missing` holds gaps that
///  were inferred from sequence numbers arriving out of order. Both are cleared when flushed:
///  a gap that is filled later is acknowledged normally, and a gap that stays open is not NAK'ed
///  again (the sender's resend timeout takes care of it).
#[derive(Default)]
pub struct AckTracker {
    received: FxHashSet<U24>,
    missing: FxHashSet<U24>,
    highest_seen: Option<U24>,
}

impl AckTracker {
    /// Registers an incoming frame set's sequence number. Returns `false` for a duplicate that
    ///  should be discarded.
    pub fn on_frame_set(&mut self, sequence_number: U24) -> bool {
        if !self.received.insert(sequence_number) {
            trace!("duplicate frame set #{}", sequence_number);
            return false;
        }
        self.missing.remove(&sequence_number);

        match self.highest_seen {
            None => {
                self.highest_seen = Some(sequence_number);
            }
            Some(highest) if sequence_number.is_after(highest) => {
                let gap_start = highest.next();
                let gap_len = sequence_number.distance_from(gap_start);
                if gap_len > MAX_TRACKED_GAP {
                    debug!("sequence number jumped from {} to {} - not tracking the gap", highest, sequence_number);
                }
                else {
                    for n in gap_start.to(sequence_number) {
                        if !self.received.contains(&n) {
                            self.missing.insert(n);
                        }
                    }
                }
                self.highest_seen = Some(sequence_number);
            }
            Some(_) => {}
        }
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.received.is_empty() || !self.missing.is_empty()
    }

    pub fn take_acks(&mut self) -> Vec<AckPacket> {
        Self::to_packets(AckKind::Ack, self.received.drain())
    }

    pub fn take_nacks(&mut self) -> Vec<AckPacket> {
        Self::to_packets(AckKind::Nack, self.missing.drain())
    }

    fn to_packets(kind: AckKind, sequence_numbers: impl Iterator<Item = U24>) -> Vec<AckPacket> {
        Record::compress(sequence_numbers)
            .chunks(AckPacket::MAX_RECORDS)
            .map(|records| AckPacket { kind, records: records.to_vec() })
            .collect()
    }
}

/// The range of reliable indices above the watermark that is tracked at all - anything beyond
///  is dropped rather than letting a peer grow the set without bounds
const RELIABLE_WINDOW_SIZE: u32 = 0x1_0000;

/// Remembers which reliable indices were received so that reliable frames are delivered at most
///  once, even if their frame set is retransmitted under a new sequence number.
///
/// All indices below the `watermark` were received; `above` holds the ones received out of
///  order beyond it.
#[derive(Default)]
pub struct ReliableWindow {
    watermark: U24,
    above: FxHashSet<U24>,
}

impl ReliableWindow {
    /// Checks if the index lies inside the window and was not received before, without
    ///  recording it
    pub fn is_new(&self, reliable_index: U24) -> bool {
        if reliable_index.is_before(self.watermark) {
            return false;
        }
        if reliable_index.distance_from(self.watermark) >= RELIABLE_WINDOW_SIZE {
            debug!("reliable index {} is too far ahead of {} - dropping", reliable_index, self.watermark);
            return false;
        }
        !self.above.contains(&reliable_index)
    }

    /// Records the index, returning `true` if it was not received before
    pub fn insert(&mut self, reliable_index: U24) -> bool {
        if !self.is_new(reliable_index) {
            return false;
        }

        if reliable_index == self.watermark {
            self.watermark = self.watermark.next();
            while self.above.remove(&self.watermark) {
                self.watermark = self.watermark.next();
            }
            true
        }
        else {
            self.above.insert(reliable_index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn raw(n: u32) -> U24 {
        U24::from_raw(n)
    }

    fn flatten(packets: &[AckPacket]) -> Vec<u32> {
        let mut result = packets.iter()
            .flat_map(|p| p.sequence_numbers())
            .map(U24::to_raw)
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![0, 1, 2], vec![])]
    #[case::gap(vec![0, 3], vec![0, 3], vec![1, 2])]
    #[case::gap_filled(vec![0, 3, 1], vec![0, 1, 3], vec![2])]
    #[case::late_start(vec![5, 6], vec![5, 6], vec![])]
    #[case::duplicates(vec![0, 0, 2, 2], vec![0, 2], vec![1])]
    #[case::wrap_around(vec![0xff_fffe, 1], vec![1, 0xff_fffe], vec![0xff_ffff, 0])]
    fn test_ack_nack(#[case] incoming: Vec<u32>, #[case] expected_acks: Vec<u32>, #[case] expected_nacks: Vec<u32>) {
        let mut tracker = AckTracker::default();
        for n in incoming {
            tracker.on_frame_set(raw(n));
        }

        let acks = tracker.take_acks();
        let nacks = tracker.take_nacks();
        assert!(acks.iter().all(|p| p.kind == AckKind::Ack));
        assert!(nacks.iter().all(|p| p.kind == AckKind::Nack));
        assert_eq!(flatten(&acks), expected_acks);

        let mut expected_nacks = expected_nacks;
        expected_nacks.sort();
        assert_eq!(flatten(&nacks), expected_nacks);

        assert!(!tracker.has_pending());
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = AckTracker::default();
        assert!(tracker.on_frame_set(raw(4)));
        assert!(!tracker.on_frame_set(raw(4)));
        assert!(tracker.on_frame_set(raw(5)));
    }

    #[test]
    fn test_gap_not_nacked_twice() {
        let mut tracker = AckTracker::default();
        tracker.on_frame_set(raw(0));
        tracker.on_frame_set(raw(2));
        assert_eq!(flatten(&tracker.take_nacks()), vec![1]);

        tracker.on_frame_set(raw(3));
        assert!(tracker.take_nacks().is_empty());

        tracker.on_frame_set(raw(1));
        assert_eq!(flatten(&tracker.take_acks()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_huge_gap_is_not_tracked() {
        let mut tracker = AckTracker::default();
        tracker.on_frame_set(raw(0));
        tracker.on_frame_set(raw(100_000));
        assert!(tracker.take_nacks().is_empty());
        assert_eq!(flatten(&tracker.take_acks()), vec![0, 100_000]);
    }

    #[test]
    fn test_many_records_are_split() {
        let mut tracker = AckTracker::default();
        for n in 0..200 {
            tracker.on_frame_set(raw(n * 2));
        }
        let acks = tracker.take_acks();
        assert_eq!(acks.len(), 200usize.div_ceil(AckPacket::MAX_RECORDS));
        assert!(acks.iter().all(|p| p.records.len() <= AckPacket::MAX_RECORDS));
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![true, true, true])]
    #[case::duplicate(vec![0, 0], vec![true, false])]
    #[case::out_of_order(vec![2, 0, 1, 2], vec![true, true, true, false])]
    #[case::below_watermark(vec![0, 1, 0], vec![true, true, false])]
    #[case::duplicate_above(vec![5, 5], vec![true, false])]
    #[case::too_far_ahead(vec![0x1_0000], vec![false])]
    fn test_reliable_window(#[case] indices: Vec<u32>, #[case] expected: Vec<bool>) {
        let mut window = ReliableWindow::default();
        let actual = indices.into_iter()
            .map(|n| window.insert(raw(n)))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_reliable_window_drains_above() {
        let mut window = ReliableWindow::default();
        window.insert(raw(1));
        window.insert(raw(2));
        window.insert(raw(0));
        assert_eq!(window.watermark, raw(3));
        assert!(window.above.is_empty());
    }

    #[test]
    fn test_is_new_does_not_record() {
        let mut window = ReliableWindow::default();
        window.insert(raw(2));

        assert!(window.is_new(raw(1)));
        assert!(window.is_new(raw(1)));
        assert!(!window.is_new(raw(2)));
        assert!(!window.is_new(raw(RELIABLE_WINDOW_SIZE)));

        window.insert(raw(0));
        assert!(!window.is_new(raw(0)));
        assert_eq!(window.watermark, raw(1));
    }
}
