use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::ids;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::u24::U24;

/// a peer can not plausibly have that many datagrams in flight
const MAX_RANGE_LEN: u32 = 0x1_0000;

/// A compact representation of acknowledged (or missing) datagram sequence numbers: either a
///  single number or an inclusive contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Single(U24),
    Range(U24, U24),
}

impl Record {
    /// Compresses a set of sequence numbers into records. Ranges are maximal contiguous runs,
    ///  i.e. records never overlap, never merge non-contiguous values, and a contiguous run is
    ///  never split. A run crossing the wrap from 0xffffff to 0 becomes a single wrapped range,
    ///  placed first.
    pub fn compress(sequence_numbers: impl IntoIterator<Item = U24>) -> Vec<Record> {
        let mut raw = sequence_numbers.into_iter()
            .map(U24::to_raw)
            .collect::<Vec<_>>();
        raw.sort_unstable();
        raw.dedup();

        let mut result = Vec::new();
        let mut iter = raw.into_iter();
        let Some(first) = iter.next() else {
            return result;
        };

        let mut start = first;
        let mut end = first;
        for n in iter {
            if n == end + 1 {
                end = n;
                continue;
            }
            result.push(Self::from_bounds(start, end));
            start = n;
            end = n;
        }
        result.push(Self::from_bounds(start, end));

        if result.len() > 1 && first == 0 && end == U24::MASK {
            let (_, first_end) = result[0].bounds();
            result.pop();
            result[0] = Record::Range(U24::from_raw(start), first_end);
        }
        result
    }

    fn bounds(&self) -> (U24, U24) {
        match *self {
            Record::Single(n) => (n, n),
            Record::Range(start, end) => (start, end),
        }
    }

    fn from_bounds(start: u32, end: u32) -> Record {
        if start == end {
            Record::Single(U24::from_raw(start))
        }
        else {
            Record::Range(U24::from_raw(start), U24::from_raw(end))
        }
    }

    pub fn sequence_numbers(&self) -> impl Iterator<Item = U24> {
        let (start, end) = self.bounds();
        start.to(end.next())
    }

    pub fn contains(&self, sequence_number: U24) -> bool {
        match *self {
            Record::Single(n) => n == sequence_number,
            Record::Range(start, end) => sequence_number.distance_from(start) <= end.distance_from(start),
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        match self {
            Record::Single(n) => {
                buf.put_bool(true);
                buf.put_u24_le(*n);
            }
            Record::Range(start, end) => {
                buf.put_bool(false);
                buf.put_u24_le(*start);
                buf.put_u24_le(*end);
            }
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Record> {
        if buf.get_bool_checked()? {
            Ok(Record::Single(buf.get_u24_le_checked()?))
        }
        else {
            let start = buf.get_u24_le_checked()?;
            let end = buf.get_u24_le_checked()?;
            if start.is_after(end) {
                return Err(ProtocolError::malformed(format!("record range {}..={} is inverted", start, end)));
            }
            if end.distance_from(start) >= MAX_RANGE_LEN {
                return Err(ProtocolError::malformed(format!("record range {}..={} is implausibly long", start, end)));
            }
            Ok(Record::Range(start, end))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack,
}

/// ACK (0xc0) or NACK (0xa0) datagram:
///
/// ```ascii
/// 0: id (u8)
/// 1: number of records (u16)
/// 3: records - u8 'is single' flag, u24 LE start, u24 LE end if it is a range
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub kind: AckKind,
    pub records: Vec<Record>,
}

impl AckPacket {
    /// Upper bound for the number of records in one datagram - ranged records are 7 bytes,
    ///  so this fits a minimum MTU with room to spare
    pub const MAX_RECORDS: usize = 48;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(match self.kind {
            AckKind::Ack => ids::ACK,
            AckKind::Nack => ids::NACK,
        });
        buf.put_u16(self.records.len() as u16);
        for record in &self.records {
            record.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckPacket> {
        let kind = match buf.get_u8_checked()? {
            ids::ACK => AckKind::Ack,
            ids::NACK => AckKind::Nack,
            id => return Err(ProtocolError::malformed(format!("{:#04x} is neither ACK nor NACK", id))),
        };
        let num_records = buf.get_u16_checked()? as usize;
        let mut records = Vec::with_capacity(num_records.min(Self::MAX_RECORDS));
        for _ in 0..num_records {
            records.push(Record::deser(buf)?);
        }
        Ok(AckPacket { kind, records })
    }

    pub fn sequence_numbers(&self) -> impl Iterator<Item = U24> + '_ {
        self.records.iter().flat_map(Record::sequence_numbers)
    }

    /// Checking membership is bounded by the number of records, while expanding ranges is
    ///  bounded only by what a peer chooses to send
    pub fn contains(&self, sequence_number: U24) -> bool {
        self.records.iter().any(|r| r.contains(sequence_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::error::is_malformed;

    fn single(n: u32) -> Record {
        Record::Single(U24::from_raw(n))
    }
    fn range(a: u32, b: u32) -> Record {
        Record::Range(U24::from_raw(a), U24::from_raw(b))
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![4], vec![single(4)])]
    #[case::mixed(vec![1, 2, 3, 5, 7, 8, 9], vec![range(1, 3), single(5), range(7, 9)])]
    #[case::unsorted(vec![9, 1, 8, 3, 2, 7, 5], vec![range(1, 3), single(5), range(7, 9)])]
    #[case::pair(vec![10, 11], vec![range(10, 11)])]
    #[case::all_gaps(vec![0, 2, 4], vec![single(0), single(2), single(4)])]
    #[case::duplicates(vec![3, 3, 4], vec![range(3, 4)])]
    #[case::across_wrap(vec![0xff_fffe, 0xff_ffff, 0, 1, 5], vec![range(0xff_fffe, 1), single(5)])]
    #[case::single_before_wrap(vec![0xff_ffff, 0, 7], vec![range(0xff_ffff, 0), single(7)])]
    #[case::top_without_zero(vec![1, 0xff_ffff], vec![single(1), single(0xff_ffff)])]
    fn test_compress(#[case] sequence_numbers: Vec<u32>, #[case] expected: Vec<Record>) {
        let records = Record::compress(sequence_numbers.iter().map(|&n| U24::from_raw(n)));
        assert_eq!(records, expected);
    }

    #[test]
    fn test_compress_is_lossless() {
        let input = vec![1u32, 2, 3, 5, 7, 8, 9];
        let packet = AckPacket {
            kind: AckKind::Ack,
            records: Record::compress(input.iter().map(|&n| U24::from_raw(n))),
        };
        let expanded = packet.sequence_numbers().map(U24::to_raw).collect::<Vec<_>>();
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_wire_layout() {
        let packet = AckPacket {
            kind: AckKind::Nack,
            records: vec![single(5), range(7, 9)],
        };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[
            0xa0, 0, 2,
            1, 5, 0, 0,
            0, 7, 0, 0, 9, 0, 0,
        ]);

        let mut parse_buf: &[u8] = &buf;
        assert_eq!(AckPacket::deser(&mut parse_buf).unwrap(), packet);
    }

    #[rstest]
    #[case::single_hit(single(5), 5, true)]
    #[case::single_miss(single(5), 6, false)]
    #[case::range_start(range(7, 9), 7, true)]
    #[case::range_end(range(7, 9), 9, true)]
    #[case::range_below(range(7, 9), 6, false)]
    #[case::range_above(range(7, 9), 10, false)]
    #[case::wrapped_range(range(0xff_fffe, 1), 0, true)]
    #[case::wrapped_range_miss(range(0xff_fffe, 1), 2, false)]
    fn test_contains(#[case] record: Record, #[case] n: u32, #[case] expected: bool) {
        assert_eq!(record.contains(U24::from_raw(n)), expected);
        let packet = AckPacket { kind: AckKind::Ack, records: vec![single(100), record] };
        assert_eq!(packet.contains(U24::from_raw(n)), expected);
    }

    #[rstest]
    #[case::wrong_id(vec![0x84, 0, 0])]
    #[case::truncated(vec![0xc0, 0, 2, 1, 5, 0, 0])]
    #[case::inverted_range(vec![0xc0, 0, 1, 0, 9, 0, 0, 7, 0, 0])]
    #[case::huge_range(vec![0xc0, 0, 1, 0, 0, 0, 0, 0xff, 0xff, 0x7f])]
    fn test_deser_malformed(#[case] raw: Vec<u8>) {
        let mut parse_buf: &[u8] = &raw;
        assert!(is_malformed(&AckPacket::deser(&mut parse_buf).unwrap_err()));
    }
}
