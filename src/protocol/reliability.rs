use num_enum::{IntoPrimitive, TryFromPrimitive};

/// RakNet's reliability modes. The numeric values are part of the wire format (top three bits
///  of a frame's flags).
///
/// All classification is derived from the variant - frames never store 'is reliable' etc.
///  redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub fn is_reliable(self) -> bool {
        matches!(self,
            Reliability::Reliable
            | Reliability::ReliableOrdered
            | Reliability::ReliableSequenced
            | Reliability::ReliableWithAckReceipt
            | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_sequenced(self) -> bool {
        matches!(self, Reliability::UnreliableSequenced | Reliability::ReliableSequenced)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Reliability::ReliableOrdered | Reliability::ReliableOrderedWithAckReceipt)
    }

    /// frames in these modes carry an order index and an order channel
    pub fn is_ordered_or_sequenced(self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }

    /// Fragments must be reliable for reassembly to ever complete, so unreliable modes are
    ///  upgraded to their reliable counterpart when a payload is split
    pub fn for_fragments(self) -> Reliability {
        match self {
            Reliability::Unreliable => Reliability::Reliable,
            Reliability::UnreliableSequenced => Reliability::ReliableSequenced,
            Reliability::UnreliableWithAckReceipt => Reliability::ReliableWithAckReceipt,
            other => other,
        }
    }
}
