//! Outbound message assembly.
//!
//! [`FrameBuilder`] owns one message's byte buffer along with the state the
//! wire format threads through it: the differential timestamp cursor and the
//! deferred-skip flag. Runs of matched ranges collapse into a single skip
//! emitted lazily just before the next real payload, which keeps messages
//! proportional to the symmetric difference instead of the bucket count.
//!
//! A [`Checkpoint`] snapshots the builder so the engine can discard a range
//! that would overflow the frame-size limit and replace it with a remainder
//! fingerprint.

use crate::encoding::push_varint;
use crate::types::{Bound, Fingerprint, Id};
use crate::Error;

/// Wire range payload discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Skip = 0,
    Fingerprint = 1,
    IdList = 2,
}

impl TryFrom<u64> for Mode {
    type Error = Error;

    fn try_from(mode: u64) -> Result<Self, Error> {
        match mode {
            0 => Ok(Mode::Skip),
            1 => Ok(Mode::Fingerprint),
            2 => Ok(Mode::IdList),
            m => Err(Error::UnexpectedMode(m)),
        }
    }
}

pub(crate) struct FrameBuilder {
    buf: Vec<u8>,
    last_timestamp_out: u64,
    pending_skip: bool,
}

pub(crate) struct Checkpoint {
    len: usize,
    last_timestamp_out: u64,
    pending_skip: bool,
}

impl FrameBuilder {
    pub fn new(version: u8) -> Self {
        FrameBuilder {
            buf: vec![version],
            last_timestamp_out: 0,
            pending_skip: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.buf.len(),
            last_timestamp_out: self.last_timestamp_out,
            pending_skip: self.pending_skip,
        }
    }

    pub fn rollback(&mut self, checkpoint: &Checkpoint) {
        self.buf.truncate(checkpoint.len);
        self.last_timestamp_out = checkpoint.last_timestamp_out;
        self.pending_skip = checkpoint.pending_skip;
    }

    /// Defer a skip; it is emitted only if a later range needs the cursor.
    pub fn mark_skip(&mut self) {
        self.pending_skip = true;
    }

    /// Emit the deferred skip range, if any, closing at `prev_bound`.
    pub fn flush_skip(&mut self, prev_bound: &Bound) {
        if !self.pending_skip {
            return;
        }
        self.pending_skip = false;
        self.push_bound(prev_bound);
        push_varint(&mut self.buf, Mode::Skip as u64);
    }

    pub fn push_fingerprint_range(&mut self, upper: &Bound, fingerprint: &Fingerprint) {
        self.push_bound(upper);
        push_varint(&mut self.buf, Mode::Fingerprint as u64);
        self.buf.extend_from_slice(fingerprint.bytes());
    }

    pub fn push_id_list_range(&mut self, upper: &Bound, ids: &[Id]) {
        self.push_bound(upper);
        push_varint(&mut self.buf, Mode::IdList as u64);
        push_varint(&mut self.buf, ids.len() as u64);
        for id in ids {
            self.buf.extend_from_slice(id.bytes());
        }
    }

    pub(crate) fn push_bound(&mut self, bound: &Bound) {
        self.push_timestamp(bound.timestamp());
        push_varint(&mut self.buf, bound.id_len() as u64);
        self.buf.extend_from_slice(bound.id_prefix());
    }

    pub(crate) fn push_timestamp(&mut self, timestamp: u64) {
        if timestamp == u64::MAX {
            self.last_timestamp_out = u64::MAX;
            push_varint(&mut self.buf, 0);
            return;
        }

        let delta = timestamp.wrapping_sub(self.last_timestamp_out);
        self.last_timestamp_out = timestamp;
        push_varint(&mut self.buf, delta.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_is_deferred_until_needed() {
        let mut frame = FrameBuilder::new(0x61);
        frame.mark_skip();
        frame.mark_skip();
        assert_eq!(frame.len(), 1);

        let bound = Bound::with_timestamp(9);
        frame.flush_skip(&bound);
        assert!(frame.len() > 1);

        // a second flush emits nothing
        let len = frame.len();
        frame.flush_skip(&bound);
        assert_eq!(frame.len(), len);
    }

    #[test]
    fn test_rollback_restores_state() {
        let mut frame = FrameBuilder::new(0x61);
        frame.push_timestamp(50);
        let checkpoint = frame.checkpoint();
        let len = frame.len();

        frame.mark_skip();
        frame.flush_skip(&Bound::with_timestamp(60));
        frame.push_id_list_range(&Bound::infinite(), &[]);
        assert!(frame.len() > len);

        frame.rollback(&checkpoint);
        assert_eq!(frame.len(), len);

        // timestamp state is restored too: re-encoding 51 must produce the
        // same delta as it would have before the discarded output
        frame.push_timestamp(51);
        let bytes = frame.into_bytes();
        assert_eq!(*bytes.last().unwrap(), 2); // (51 - 50) + 1
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::try_from(0).unwrap(), Mode::Skip);
        assert_eq!(Mode::try_from(1).unwrap(), Mode::Fingerprint);
        assert_eq!(Mode::try_from(2).unwrap(), Mode::IdList);
        assert_eq!(Mode::try_from(3), Err(Error::UnexpectedMode(3)));
    }
}
