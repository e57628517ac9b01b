use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::ProtocolError;
use crate::protocol::frame::Frame;

struct PartialMessage {
    count: u32,
    fragments: FxHashMap<u32, Frame>,
}

/// Reassembly table for fragmented messages, keyed by fragment id.
///
/// An entry is complete exactly when it holds `count` distinct fragment indices; it is removed
///  when it is reassembled, and otherwise lives as long as the session.
pub struct FragmentAssembler {
    max_fragment_count: u32,
    max_open: usize,
    open: FxHashMap<u16, PartialMessage>,
}

impl FragmentAssembler {
    pub fn new(max_fragment_count: u32, max_open: usize) -> FragmentAssembler {
        FragmentAssembler {
            max_fragment_count,
            max_open,
            open: FxHashMap::default(),
        }
    }

    pub fn num_open(&self) -> usize {
        self.open.len()
    }

    /// Fails if the frame is a fragment that [FragmentAssembler::add] would reject, without
    ///  changing any state
    pub fn check(&self, frame: &Frame) -> anyhow::Result<()> {
        let Some(header) = frame.fragment else {
            return Ok(());
        };

        if header.count > self.max_fragment_count {
            return Err(ProtocolError::malformed(format!("fragment count {} exceeds the limit of {}", header.count, self.max_fragment_count)));
        }
        if header.index >= header.count {
            return Err(ProtocolError::malformed(format!("fragment index {} out of range for count {}", header.index, header.count)));
        }

        match self.open.get(&header.id) {
            Some(partial) if partial.count != header.count => {
                Err(ProtocolError::malformed(format!("fragment count {} conflicts with count {} of earlier fragments for id {}", header.count, partial.count, header.id)))
            }
            None if self.open.len() >= self.max_open => {
                Err(ProtocolError::malformed(format!("more than {} fragmented messages in flight", self.max_open)))
            }
            _ => Ok(()),
        }
    }

    /// Adds a fragment, returning the reassembled frame once all of its siblings are present.
    ///
    /// The reassembled frame carries the reliability, sequence and order metadata of the
    ///  fragments, no fragment header, and the concatenated payload.
    pub fn add(&mut self, frame: Frame) -> anyhow::Result<Option<Frame>> {
        self.check(&frame)?;
        let Some(header) = frame.fragment else {
            return Ok(Some(frame));
        };

        let partial = self.open.entry(header.id)
            .or_insert_with(|| PartialMessage {
                count: header.count,
                fragments: FxHashMap::default(),
            });
        partial.fragments.entry(header.index).or_insert(frame);

        if partial.fragments.len() < partial.count as usize {
            trace!("fragment id {}: {} of {} fragments present", header.id, partial.fragments.len(), partial.count);
            return Ok(None);
        }

        let Some(mut partial) = self.open.remove(&header.id) else {
            return Ok(None);
        };
        trace!("fragment id {}: reassembling {} fragments", header.id, partial.count);

        let total_len = partial.fragments.values().map(|f| f.payload.len()).sum();
        let mut payload = BytesMut::with_capacity(total_len);
        let mut first = None;
        for index in 0..partial.count {
            let Some(fragment) = partial.fragments.remove(&index) else {
                return Err(ProtocolError::malformed(format!("fragment {} missing for id {}", index, header.id)));
            };
            payload.put_slice(&fragment.payload);
            if first.is_none() {
                first = Some(fragment);
            }
        }

        Ok(first.map(|first| Frame {
            fragment: None,
            payload: payload.freeze(),
            ..first
        }))
    }
}
