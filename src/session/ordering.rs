use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::protocol::frame::OrderInfo;
use crate::util::u24::U24;

/// Upper bound for how far ahead of the expected order index a frame may be buffered. This
///  bounds the memory a single channel can hold on to while waiting for a gap to be filled.
const MAX_ORDER_DISTANCE: u32 = 0x1_0000;

#[derive(Default)]
struct OrderChannel {
    /// the next index to be delivered - everything before it was delivered or skipped
    expected_index: U24,
    /// frames that arrived ahead of `expected_index`
    buffer: FxHashMap<U24, Bytes>,
    highest_sequence_index: Option<U24>,
}

impl OrderChannel {
    fn check_ordered(&self, index: U24) -> anyhow::Result<()> {
        if !index.is_before(self.expected_index) && index.distance_from(self.expected_index) >= MAX_ORDER_DISTANCE {
            return Err(ProtocolError::malformed(format!("ordered frame #{} is too far ahead of #{}", index, self.expected_index)));
        }
        Ok(())
    }

    fn on_ordered(&mut self, index: U24, payload: Bytes) -> Vec<Bytes> {
        if index.is_before(self.expected_index) {
            trace!("ordered frame #{} was already delivered - dropping", index);
            return Vec::new();
        }

        if index != self.expected_index {
            if index.distance_from(self.expected_index) >= MAX_ORDER_DISTANCE {
                debug!("ordered frame #{} is too far ahead of #{} - dropping", index, self.expected_index);
            }
            else {
                trace!("buffering ordered frame #{}, waiting for #{}", index, self.expected_index);
                self.buffer.entry(index).or_insert(payload);
            }
            return Vec::new();
        }

        let mut result = vec![payload];
        self.expected_index = self.expected_index.next();
        while let Some(buffered) = self.buffer.remove(&self.expected_index) {
            result.push(buffered);
            self.expected_index = self.expected_index.next();
        }
        result
    }

    fn on_sequenced(&mut self, sequence_index: U24, order_index: U24, payload: Bytes) -> Option<Bytes> {
        if order_index.is_before(self.expected_index) {
            trace!("sequenced frame refers to outdated order index #{} - dropping", order_index);
            return None;
        }
        if let Some(highest) = self.highest_sequence_index {
            if !sequence_index.is_after(highest) {
                trace!("sequenced frame #{} is not newer than #{} - dropping", sequence_index, highest);
                return None;
            }
        }
        self.highest_sequence_index = Some(sequence_index);
        Some(payload)
    }
}

/// Per-channel reassembly of ordered and sequenced frames.
///
/// Within a channel, ordered payloads come out strictly in order index order without gaps or
///  duplicates. Sequenced payloads never wait for gaps; they are delivered if they are newer
///  than everything delivered before on the channel, and dropped as stale otherwise. Channels
///  are independent of each other.
pub struct OrderingChannels {
    channels: Vec<OrderChannel>,
}

impl OrderingChannels {
    pub fn new(num_channels: u8) -> OrderingChannels {
        OrderingChannels {
            channels: (0..num_channels).map(|_| OrderChannel::default()).collect(),
        }
    }

    fn invalid_channel(&self, channel: u8) -> anyhow::Error {
        ProtocolError::malformed(format!("order channel {} out of range, there are {} channels", channel, self.channels.len()))
    }

    fn channel(&mut self, channel: u8) -> anyhow::Result<&mut OrderChannel> {
        if channel as usize >= self.channels.len() {
            return Err(self.invalid_channel(channel));
        }
        Ok(&mut self.channels[channel as usize])
    }

    /// Fails if a frame with this ordering metadata would be rejected, without changing any
    ///  state. Sequenced frames are never too far ahead since they do not wait for gaps.
    pub fn check(&self, order: OrderInfo, is_sequenced: bool) -> anyhow::Result<()> {
        let Some(channel) = self.channels.get(order.channel as usize) else {
            return Err(self.invalid_channel(order.channel));
        };
        if is_sequenced {
            Ok(())
        }
        else {
            channel.check_ordered(order.index)
        }
    }

    /// Returns the payloads that became deliverable, in order
    pub fn on_ordered(&mut self, order: OrderInfo, payload: Bytes) -> anyhow::Result<Vec<Bytes>> {
        Ok(self.channel(order.channel)?.on_ordered(order.index, payload))
    }

    pub fn on_sequenced(&mut self, sequence_index: U24, order: OrderInfo, payload: Bytes) -> anyhow::Result<Option<Bytes>> {
        Ok(self.channel(order.channel)?.on_sequenced(sequence_index, order.index, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::error::is_malformed;

    fn order(index: u32, channel: u8) -> OrderInfo {
        OrderInfo { index: U24::from_raw(index), channel }
    }

    fn payload(n: u32) -> Bytes {
        Bytes::from(n.to_string())
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0], vec![0, 1, 2])]
    #[case::gap_never_filled(vec![0, 2, 3], vec![0])]
    #[case::duplicates(vec![0, 0, 1, 1, 0], vec![0, 1])]
    #[case::duplicate_buffered(vec![2, 2, 0, 1], vec![0, 1, 2])]
    #[case::interleaved(vec![1, 0, 3, 2, 4], vec![0, 1, 2, 3, 4])]
    fn test_ordered(#[case] incoming: Vec<u32>, #[case] expected: Vec<u32>) {
        let mut ordering = OrderingChannels::new(4);
        let mut delivered = Vec::new();
        for n in incoming {
            delivered.extend(ordering.on_ordered(order(n, 1), payload(n)).unwrap());
        }
        assert_eq!(delivered, expected.into_iter().map(payload).collect::<Vec<_>>());
    }

    #[test]
    fn test_channels_are_independent() {
        let mut ordering = OrderingChannels::new(4);
        assert!(ordering.on_ordered(order(1, 0), payload(1)).unwrap().is_empty());
        assert_eq!(ordering.on_ordered(order(0, 3), payload(0)).unwrap(), vec![payload(0)]);
        assert_eq!(ordering.on_ordered(order(0, 0), payload(0)).unwrap(), vec![payload(0), payload(1)]);
    }

    #[test]
    fn test_ordered_across_wrap_around() {
        let mut ordering = OrderingChannels::new(1);
        ordering.channels[0].expected_index = U24::from_raw(0xff_ffff);
        assert!(ordering.on_ordered(order(0, 0), payload(0)).unwrap().is_empty());
        assert_eq!(ordering.on_ordered(order(0xff_ffff, 0), payload(9)).unwrap(), vec![payload(9), payload(0)]);
    }

    #[test]
    fn test_too_far_ahead_is_dropped() {
        let mut ordering = OrderingChannels::new(1);
        assert!(ordering.on_ordered(order(MAX_ORDER_DISTANCE, 0), payload(1)).unwrap().is_empty());
        assert!(ordering.channels[0].buffer.is_empty());
    }

    #[rstest]
    #[case::next(0, false, true)]
    #[case::buffered_range(MAX_ORDER_DISTANCE - 1, false, true)]
    #[case::too_far_ahead(MAX_ORDER_DISTANCE, false, false)]
    #[case::sequenced_far_ahead(MAX_ORDER_DISTANCE, true, true)]
    fn test_check(#[case] index: u32, #[case] is_sequenced: bool, #[case] accepted: bool) {
        let ordering = OrderingChannels::new(2);
        let result = ordering.check(order(index, 1), is_sequenced);
        assert_eq!(result.is_ok(), accepted);
        if let Err(e) = result {
            assert!(is_malformed(&e));
        }
    }

    #[test]
    fn test_check_behind_expected() {
        let mut ordering = OrderingChannels::new(1);
        ordering.on_ordered(order(0, 0), payload(0)).unwrap();
        // already delivered frames pass the check and are dropped as duplicates
        ordering.check(order(0, 0), false).unwrap();
        assert!(ordering.on_ordered(order(0, 0), payload(0)).unwrap().is_empty());
    }

    #[rstest]
    #[case::increasing(vec![0, 1, 2], vec![0, 1, 2])]
    #[case::gaps_do_not_block(vec![0, 5, 6], vec![0, 5, 6])]
    #[case::stale(vec![3, 1, 2, 4], vec![3, 4])]
    #[case::duplicate(vec![3, 3], vec![3])]
    fn test_sequenced(#[case] incoming: Vec<u32>, #[case] expected: Vec<u32>) {
        let mut ordering = OrderingChannels::new(1);
        let delivered = incoming.into_iter()
            .filter_map(|n| ordering.on_sequenced(U24::from_raw(n), order(0, 0), payload(n)).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(delivered, expected.into_iter().map(payload).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequenced_behind_ordered_watermark() {
        let mut ordering = OrderingChannels::new(1);
        ordering.on_ordered(order(0, 0), payload(0)).unwrap();
        ordering.on_ordered(order(1, 0), payload(1)).unwrap();

        assert!(ordering.on_sequenced(U24::from_raw(0), order(1, 0), payload(7)).unwrap().is_none());
        assert_eq!(ordering.on_sequenced(U24::from_raw(1), order(2, 0), payload(8)).unwrap(), Some(payload(8)));
    }

    #[test]
    fn test_invalid_channel() {
        let mut ordering = OrderingChannels::new(2);
        assert!(is_malformed(&ordering.on_ordered(order(0, 2), payload(0)).unwrap_err()));
        assert!(is_malformed(&ordering.on_sequenced(U24::ZERO, order(0, 5), payload(0)).unwrap_err()));
        assert!(is_malformed(&ordering.check(order(0, 2), false).unwrap_err()));
    }
}
