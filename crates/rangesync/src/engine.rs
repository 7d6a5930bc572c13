//! The reconciliation state machine.
//!
//! Two parties each bind a [`Reconciler`] to a storage; the initiator calls
//! [`initiate`](Reconciler::initiate) once and the parties then pass the
//! resulting byte strings back and forth through
//! [`reconcile`](Reconciler::reconcile) /
//! [`reconcile_with_ids`](Reconciler::reconcile_with_ids) until the
//! initiator's call returns `None`. Continuation across messages rides on
//! the wire (a trailing remainder fingerprint), not on engine state: apart
//! from its role, an engine carries nothing between calls.

use hashbrown::HashSet;
use tracing::{debug, trace};

use crate::encoding;
use crate::frame::{FrameBuilder, Mode};
use crate::storage::Storage;
use crate::types::{Bound, Fingerprint, Id, Item, FINGERPRINT_SIZE, ID_SIZE};
use crate::{Error, Result};

/// Version byte spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 0x61;

// Reserved version window. Bytes inside it from a peer are negotiable;
// anything else is garbage.
const VERSION_LOW: u8 = 0x60;
const VERSION_HIGH: u8 = 0x6f;

const BUCKETS: usize = 16;
const DOUBLE_BUCKETS: usize = BUCKETS * 2;

// Headroom reserved when enforcing the frame size limit, covering the worst
// case bound + mode + remainder fingerprint still to be appended.
const FRAME_SAFETY_MARGIN: usize = 200;

pub struct Reconciler<'a, S: Storage> {
    storage: Option<&'a S>,
    frame_size_limit: u64,
    is_initiator: bool,
}

impl<'a, S: Storage> Reconciler<'a, S> {
    /// `frame_size_limit` of 0 means unlimited; any other value must be at
    /// least 4096.
    pub fn new(frame_size_limit: u64) -> Result<Self> {
        if frame_size_limit != 0 && frame_size_limit < 4096 {
            return Err(Error::FrameSizeLimitTooSmall);
        }
        Ok(Reconciler {
            storage: None,
            frame_size_limit,
            is_initiator: false,
        })
    }

    /// Bind the storage this engine reconciles. The storage must not be
    /// mutated for as long as the engine is in use.
    pub fn bind_storage(&mut self, storage: &'a S) {
        self.storage = Some(storage);
    }

    /// Open the dialogue. Only one side calls this, once; it becomes the
    /// initiator and collects have/need ids from then on.
    pub fn initiate(&mut self) -> Result<Vec<u8>> {
        let storage = self.storage.ok_or(Error::StorageNotBound)?;
        if self.is_initiator {
            return Err(Error::AlreadyInitiated);
        }
        self.is_initiator = true;

        let mut frame = FrameBuilder::new(PROTOCOL_VERSION);
        self.split_range(storage, &mut frame, 0, storage.size(), &Bound::infinite())?;

        debug!(
            items = storage.size(),
            bytes = frame.len(),
            "initiated reconciliation"
        );
        Ok(frame.into_bytes())
    }

    /// Answer one message as the responder.
    pub fn reconcile(&mut self, query: &[u8]) -> Result<Vec<u8>> {
        if self.is_initiator {
            return Err(Error::InitiatorRoleViolation);
        }
        let mut have_ids = Vec::new();
        let mut need_ids = Vec::new();
        self.reconcile_aux(query, &mut have_ids, &mut need_ids)
    }

    /// Process one message as the initiator, accumulating the ids only we
    /// hold into `have_ids` and the ids only the peer holds into `need_ids`.
    /// Returns `None` when the dialogue is complete.
    pub fn reconcile_with_ids(
        &mut self,
        query: &[u8],
        have_ids: &mut Vec<Id>,
        need_ids: &mut Vec<Id>,
    ) -> Result<Option<Vec<u8>>> {
        if !self.is_initiator {
            return Err(Error::ResponderRoleViolation);
        }

        let output = self.reconcile_aux(query, have_ids, need_ids)?;
        if output.len() == 1 {
            return Ok(None);
        }
        Ok(Some(output))
    }

    fn reconcile_aux(
        &mut self,
        mut query: &[u8],
        have_ids: &mut Vec<Id>,
        need_ids: &mut Vec<Id>,
    ) -> Result<Vec<u8>> {
        let storage = self.storage.ok_or(Error::StorageNotBound)?;
        let bytes_in = query.len();

        // cursor state is per-message
        let mut last_timestamp_in = 0u64;
        let mut frame = FrameBuilder::new(PROTOCOL_VERSION);

        let version = encoding::take_byte(&mut query)?;
        if !(VERSION_LOW..=VERSION_HIGH).contains(&version) {
            return Err(Error::InvalidProtocolVersion(version));
        }
        if version != PROTOCOL_VERSION {
            if self.is_initiator {
                return Err(Error::InvalidProtocolVersion(version));
            }
            // echo our version so the peer can tell what we speak
            return Ok(frame.into_bytes());
        }

        let mut prev_bound = Bound::zero();
        let mut prev_index = 0usize;
        let mut ranges = 0usize;

        while !query.is_empty() {
            ranges += 1;
            let checkpoint = frame.checkpoint();

            let curr_bound = encoding::decode_bound(&mut query, &mut last_timestamp_in)?;
            let mode = Mode::try_from(encoding::decode_varint(&mut query)?)?;

            let lower = prev_index;
            let mut upper = storage.find_lower_bound(prev_index, &curr_bound)?;

            // set when the responder cuts an id list short; `committed`
            // marks output that must survive a frame-limit rollback
            let mut truncated = false;
            let mut committed = false;

            match mode {
                Mode::Skip => frame.mark_skip(),

                Mode::Fingerprint => {
                    let theirs =
                        Fingerprint::try_from(encoding::take_bytes(&mut query, FINGERPRINT_SIZE)?)?;
                    let ours = storage.fingerprint(lower, upper)?;

                    if theirs == ours {
                        frame.mark_skip();
                    } else {
                        frame.flush_skip(&prev_bound);
                        self.split_range(storage, &mut frame, lower, upper, &curr_bound)?;
                    }
                }

                Mode::IdList => {
                    let num_ids = encoding::decode_varint(&mut query)?;
                    let mut their_ids: HashSet<Id> = HashSet::with_capacity(
                        (num_ids as usize).min(query.len() / ID_SIZE + 1),
                    );
                    for _ in 0..num_ids {
                        their_ids.insert(Id::try_from(encoding::take_bytes(&mut query, ID_SIZE)?)?);
                    }

                    if self.is_initiator {
                        storage.iterate(lower, upper, |item, _| {
                            if !their_ids.remove(&item.id) {
                                // we hold it, they don't
                                have_ids.push(item.id);
                            }
                            true
                        })?;
                        // what remains is theirs alone
                        need_ids.extend(their_ids.drain());
                        frame.mark_skip();
                    } else {
                        frame.flush_skip(&prev_bound);

                        let frame_size_limit = self.frame_size_limit as usize;
                        let emitted = frame.len();
                        let mut response_ids: Vec<Id> = Vec::new();
                        let mut last_kept: Option<Item> = None;
                        let mut cut: Option<(usize, Bound)> = None;

                        storage.iterate(lower, upper, |item, index| {
                            if frame_size_limit != 0
                                && emitted + response_ids.len() * ID_SIZE + FRAME_SAFETY_MARGIN
                                    > frame_size_limit
                            {
                                let bound = match &last_kept {
                                    Some(prev) => Bound::between(prev, item),
                                    None => Bound::from_item(item),
                                };
                                cut = Some((index, bound));
                                return false;
                            }
                            response_ids.push(item.id);
                            last_kept = Some(*item);
                            true
                        })?;

                        let mut end_bound = curr_bound;
                        if let Some((cut_index, cut_bound)) = cut {
                            // shrink so the remainder fingerprint below
                            // covers everything we left out
                            upper = cut_index;
                            end_bound = cut_bound;
                            truncated = true;
                        }

                        frame.push_id_list_range(&end_bound, &response_ids);
                        committed = true;
                    }
                }
            }

            let frame_full = self.frame_size_limit != 0
                && frame.len() + FRAME_SAFETY_MARGIN > self.frame_size_limit as usize;

            if truncated || frame_full {
                // stop here: drop any uncommitted output for this range and
                // hand the peer one fingerprint covering all we did not get to
                if !committed {
                    frame.rollback(&checkpoint);
                }
                let remainder = storage.fingerprint(upper, storage.size())?;
                frame.push_fingerprint_range(&Bound::infinite(), &remainder);
                debug!(
                    bytes = frame.len(),
                    processed = upper,
                    "frame size limit reached, emitting remainder fingerprint"
                );
                break;
            }

            prev_index = upper;
            prev_bound = curr_bound;
        }

        trace!(
            ranges,
            bytes_in,
            bytes_out = frame.len(),
            have = have_ids.len(),
            need = need_ids.len(),
            "processed message"
        );
        Ok(frame.into_bytes())
    }

    /// Describe `lower..upper` to the peer: a flat id list when small,
    /// otherwise 16 bucket fingerprints with minimal bounds between them.
    fn split_range(
        &self,
        storage: &S,
        frame: &mut FrameBuilder,
        lower: usize,
        upper: usize,
        upper_bound: &Bound,
    ) -> Result<()> {
        let num_elems = upper - lower;

        if num_elems < DOUBLE_BUCKETS {
            let mut ids: Vec<Id> = Vec::with_capacity(num_elems);
            storage.iterate(lower, upper, |item, _| {
                ids.push(item.id);
                true
            })?;
            frame.push_id_list_range(upper_bound, &ids);
            return Ok(());
        }

        let items_per_bucket = num_elems / BUCKETS;
        let buckets_with_extra = num_elems % BUCKETS;
        let mut curr = lower;

        for bucket in 0..BUCKETS {
            let bucket_size = items_per_bucket + usize::from(bucket < buckets_with_extra);
            let fingerprint = storage.fingerprint(curr, curr + bucket_size)?;
            curr += bucket_size;

            let bucket_bound = if curr == upper {
                *upper_bound
            } else {
                Bound::between(&storage.get_item(curr - 1)?, &storage.get_item(curr)?)
            };

            frame.push_fingerprint_range(&bucket_bound, &fingerprint);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::vector::VectorStorage;

    fn sealed(count: u64) -> VectorStorage {
        let mut storage = VectorStorage::new();
        for n in 0..count {
            let mut bytes = [0u8; ID_SIZE];
            bytes[..8].copy_from_slice(&n.to_le_bytes());
            storage.insert(100 + n, Id::new(bytes)).unwrap();
        }
        storage.seal().unwrap();
        storage
    }

    #[test]
    fn test_frame_size_limit_validation() {
        assert!(Reconciler::<VectorStorage>::new(0).is_ok());
        assert!(Reconciler::<VectorStorage>::new(4096).is_ok());
        assert_eq!(
            Reconciler::<VectorStorage>::new(4095).err(),
            Some(Error::FrameSizeLimitTooSmall)
        );
    }

    #[test]
    fn test_initiate_requires_storage() {
        let mut engine = Reconciler::<VectorStorage>::new(0).unwrap();
        assert_eq!(engine.initiate(), Err(Error::StorageNotBound));
    }

    #[test]
    fn test_initiate_twice_fails() {
        let storage = sealed(3);
        let mut engine = Reconciler::new(0).unwrap();
        engine.bind_storage(&storage);
        engine.initiate().unwrap();
        assert_eq!(engine.initiate(), Err(Error::AlreadyInitiated));
    }

    #[test]
    fn test_role_violations() {
        let storage = sealed(3);

        let mut initiator = Reconciler::new(0).unwrap();
        initiator.bind_storage(&storage);
        let msg = initiator.initiate().unwrap();
        assert_eq!(initiator.reconcile(&msg), Err(Error::InitiatorRoleViolation));

        let mut responder = Reconciler::new(0).unwrap();
        responder.bind_storage(&storage);
        let mut have = Vec::new();
        let mut need = Vec::new();
        assert_eq!(
            responder.reconcile_with_ids(&msg, &mut have, &mut need),
            Err(Error::ResponderRoleViolation)
        );
    }

    #[test]
    fn test_version_byte_leads_every_message() {
        let storage = sealed(5);
        let mut engine = Reconciler::new(0).unwrap();
        engine.bind_storage(&storage);
        let msg = engine.initiate().unwrap();
        assert_eq!(msg[0], PROTOCOL_VERSION);
    }

    #[test]
    fn test_responder_echoes_version_on_mismatch() {
        let storage = sealed(5);
        let mut responder = Reconciler::new(0).unwrap();
        responder.bind_storage(&storage);

        // in-window but unsupported version: echo ours, no ranges
        let reply = responder.reconcile(&[0x62, 0xff, 0xff]).unwrap();
        assert_eq!(reply, vec![PROTOCOL_VERSION]);
    }

    #[test]
    fn test_out_of_window_version_is_fatal() {
        let storage = sealed(5);
        let mut responder = Reconciler::new(0).unwrap();
        responder.bind_storage(&storage);
        assert_eq!(
            responder.reconcile(&[0x41]),
            Err(Error::InvalidProtocolVersion(0x41))
        );
    }

    #[test]
    fn test_initiator_rejects_foreign_version() {
        let storage = sealed(5);
        let mut initiator = Reconciler::new(0).unwrap();
        initiator.bind_storage(&storage);
        initiator.initiate().unwrap();

        let mut have = Vec::new();
        let mut need = Vec::new();
        assert_eq!(
            initiator.reconcile_with_ids(&[0x62], &mut have, &mut need),
            Err(Error::InvalidProtocolVersion(0x62))
        );
    }

    #[test]
    fn test_unknown_mode_is_fatal() {
        let storage = sealed(1);
        let mut responder = Reconciler::new(0).unwrap();
        responder.bind_storage(&storage);

        // version, bound (timestamp delta 1 = 0, no prefix), mode 7
        let query = vec![PROTOCOL_VERSION, 0x01, 0x00, 0x07];
        assert_eq!(responder.reconcile(&query), Err(Error::UnexpectedMode(7)));
    }

    #[test]
    fn test_truncated_message_is_fatal() {
        let storage = sealed(1);
        let mut responder = Reconciler::new(0).unwrap();
        responder.bind_storage(&storage);

        // fingerprint mode with no fingerprint bytes
        let query = vec![PROTOCOL_VERSION, 0x01, 0x00, 0x01];
        assert_eq!(
            responder.reconcile(&query),
            Err(Error::ParseEndsPrematurely)
        );
    }

    #[test]
    fn test_small_set_initiates_with_id_list() {
        let storage = sealed(DOUBLE_BUCKETS as u64 - 1);
        let mut engine = Reconciler::new(0).unwrap();
        engine.bind_storage(&storage);
        let msg = engine.initiate().unwrap();

        // version + bound(infinite) + mode + count + ids
        let expected = 1 + 2 + 1 + 1 + (DOUBLE_BUCKETS - 1) * ID_SIZE;
        assert_eq!(msg.len(), expected);
    }

    #[test]
    fn test_large_set_initiates_with_bucket_fingerprints() {
        let storage = sealed(DOUBLE_BUCKETS as u64);
        let mut engine = Reconciler::new(0).unwrap();
        engine.bind_storage(&storage);
        let msg = engine.initiate().unwrap();

        // sixteen fingerprint ranges, no id payloads
        assert!(msg.len() < DOUBLE_BUCKETS * ID_SIZE);
        let mut fingerprint_modes = 0;
        // count mode bytes by re-parsing: version, then per range a bound,
        // a mode varint and a 16-byte fingerprint
        let mut cursor = &msg[1..];
        let mut last_in = 0u64;
        while !cursor.is_empty() {
            encoding::decode_bound(&mut cursor, &mut last_in).unwrap();
            let mode = encoding::decode_varint(&mut cursor).unwrap();
            assert_eq!(mode, Mode::Fingerprint as u64);
            encoding::take_bytes(&mut cursor, FINGERPRINT_SIZE).unwrap();
            fingerprint_modes += 1;
        }
        assert_eq!(fingerprint_modes, BUCKETS);
    }

    #[test]
    fn test_empty_storage_initiates_with_empty_id_list() {
        let storage = sealed(0);
        let mut engine = Reconciler::new(0).unwrap();
        engine.bind_storage(&storage);
        let msg = engine.initiate().unwrap();

        // version + infinite bound + IdList mode + zero count
        assert_eq!(msg, vec![PROTOCOL_VERSION, 0x00, 0x00, 0x02, 0x00]);
    }
}
