//! Frame metadata carried in RTP header extensions
//!
//! Each logical field (frame id, one duration per sender stage, completion
//! timestamp) gets a tag. Slots on the wire are [`SLOT_WIDTH`] bytes wide, so a
//! field wider than one slot is split big-endian over consecutive one-byte
//! extension ids. The receiver reads every tag independently: a field with any
//! missing or malformed slot decodes as unknown instead of zero.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use thiserror::Error;
use webrtc::rtp::header::Header;

use crate::pipeline::types::{StreamId, Timestamp};

/// Width in bytes of one extension element
pub const SLOT_WIDTH: usize = 2;

/// Widest field a tag may declare
pub const MAX_FIELD_WIDTH: usize = 8;

/// First and last element ids of the one-byte extension form
pub const FIRST_SLOT_ID: u8 = 1;
pub const LAST_SLOT_ID: u8 = 14;

pub const FRAME_ID_WIDTH: usize = 4;
pub const DURATION_WIDTH: usize = 4;
pub const TIMESTAMP_WIDTH: usize = 8;

/// RFC 8285 profile marker of the one-byte extension form
const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct SlotRejected(pub String);

/// Write access to the extension slots of an outgoing packet
pub trait ExtensionWriter {
    fn is_writable(&self) -> bool;

    fn write_slot(&mut self, id: u8, payload: &[u8]) -> Result<(), SlotRejected>;

    /// Slots still free, if the writer can tell up front
    fn free_slots(&self) -> Option<usize> {
        None
    }
}

/// Read access to the extension slots of an incoming packet
pub trait ExtensionReader {
    fn read_slot(&self, id: u8) -> Option<Bytes>;
}

impl ExtensionWriter for Header {
    fn is_writable(&self) -> bool {
        true
    }

    fn write_slot(&mut self, id: u8, payload: &[u8]) -> Result<(), SlotRejected> {
        self.set_extension(id, Bytes::copy_from_slice(payload))
            .map_err(|e| SlotRejected(e.to_string()))
    }

    fn free_slots(&self) -> Option<usize> {
        // Two-byte form is not used by this codec, its capacity is not ours to judge
        if self.extension && self.extension_profile != EXTENSION_PROFILE_ONE_BYTE {
            return None;
        }
        let ids = usize::from(LAST_SLOT_ID - FIRST_SLOT_ID + 1);
        Some(ids.saturating_sub(self.extensions.len()))
    }
}

impl ExtensionReader for Header {
    fn read_slot(&self, id: u8) -> Option<Bytes> {
        self.get_extension(id)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("tag {tag}: width {width} is not a multiple of {SLOT_WIDTH} in 1..={MAX_FIELD_WIDTH}")]
    BadWidth { tag: u8, width: usize },

    #[error("layout needs a frame id and a timestamp tag, got {0} tags")]
    TooFewTags(usize),

    #[error("layout needs {needed} slots, only {available} ids exist")]
    TooManySlots { needed: usize, available: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet buffer is not writable")]
    NotWritable,

    #[error("packet has room for {free} extension slots, {needed} needed")]
    NoRoom { needed: usize, free: usize },

    #[error("extension slot {id} rejected: {reason}")]
    ExtensionSpace { id: u8, reason: String },

    #[error("tag {tag}: value {value} does not fit in {width} bytes")]
    FieldOverflow { tag: u8, value: u64, width: usize },

    #[error("expected {expected} stage durations, got {got}")]
    StageCount { expected: usize, got: usize },

    #[error("tag {tag} missing from packet")]
    MissingTag { tag: u8 },
}

/// Per-frame metadata exchanged between sender and receiver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    pub frame_id: Option<u64>,
    pub stage_durations: Vec<Option<Duration>>,
    /// Sender wall clock when the frame left the pipeline
    pub completed_at: Option<Timestamp>,
}

impl FrameMetadata {
    pub fn unknown(stage_count: usize) -> Self {
        Self {
            frame_id: None,
            stage_durations: vec![None; stage_count],
            completed_at: None,
        }
    }

    /// Overwrite every field that `newer` knows; unknown fields keep their value
    pub fn merge_from(&mut self, newer: &FrameMetadata) {
        if newer.frame_id.is_some() {
            self.frame_id = newer.frame_id;
        }
        if self.stage_durations.len() < newer.stage_durations.len() {
            self.stage_durations.resize(newer.stage_durations.len(), None);
        }
        for (slot, value) in self.stage_durations.iter_mut().zip(&newer.stage_durations) {
            if value.is_some() {
                *slot = *value;
            }
        }
        if newer.completed_at.is_some() {
            self.completed_at = newer.completed_at;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSpec {
    tag: u8,
    width: usize,
    first_slot: u8,
}

impl FieldSpec {
    fn slots(&self) -> impl Iterator<Item = u8> {
        let count = (self.width / SLOT_WIDTH) as u8;
        self.first_slot..self.first_slot + count
    }
}

/// Validated mapping of tags onto extension slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataLayout {
    fields: Vec<FieldSpec>,
}

impl MetadataLayout {
    /// Standard layout: frame id, `stage_count` durations, completion timestamp
    pub fn new(stage_count: usize) -> Result<Self, LayoutError> {
        let mut widths = Vec::with_capacity(stage_count + 2);
        widths.push(FRAME_ID_WIDTH);
        widths.extend(std::iter::repeat_n(DURATION_WIDTH, stage_count));
        widths.push(TIMESTAMP_WIDTH);
        Self::with_widths(&widths)
    }

    /// Layout with an explicit width per tag, tag `i` at index `i`
    pub fn with_widths(widths: &[usize]) -> Result<Self, LayoutError> {
        let available = (LAST_SLOT_ID - FIRST_SLOT_ID + 1) as usize;
        let needed: usize = widths.iter().map(|w| w / SLOT_WIDTH).sum();
        if widths.len() < 2 {
            return Err(LayoutError::TooFewTags(widths.len()));
        }

        let mut fields = Vec::with_capacity(widths.len());
        let mut next_slot = FIRST_SLOT_ID as usize;
        for (tag, &width) in widths.iter().enumerate() {
            let tag = tag as u8;
            if width == 0 || width % SLOT_WIDTH != 0 || width > MAX_FIELD_WIDTH {
                return Err(LayoutError::BadWidth { tag, width });
            }
            if needed > available {
                return Err(LayoutError::TooManySlots { needed, available });
            }
            fields.push(FieldSpec {
                tag,
                width,
                first_slot: next_slot as u8,
            });
            next_slot += width / SLOT_WIDTH;
        }

        Ok(Self { fields })
    }

    pub fn tag_count(&self) -> usize {
        self.fields.len()
    }

    pub fn stage_count(&self) -> usize {
        self.fields.len().saturating_sub(2)
    }

    pub fn slots_used(&self) -> usize {
        self.fields.iter().map(|f| f.width / SLOT_WIDTH).sum()
    }

    /// Stamp `meta` into `out`, returning the number of fields written
    ///
    /// Values and, when the writer reports it, free slot count are checked
    /// before anything is written. A writer that rejects a slot midway leaves
    /// the fields before it stamped; the receiver decodes the rest as unknown.
    pub fn encode(
        &self,
        meta: &FrameMetadata,
        out: &mut dyn ExtensionWriter,
    ) -> Result<usize, CodecError> {
        if !out.is_writable() {
            return Err(CodecError::NotWritable);
        }
        if meta.stage_durations.len() != self.stage_count() {
            return Err(CodecError::StageCount {
                expected: self.stage_count(),
                got: meta.stage_durations.len(),
            });
        }

        let mut pending = Vec::with_capacity(self.fields.len());
        for (field, value) in self.fields.iter().zip(self.raw_values(meta)) {
            let Some(value) = value else { continue };
            pending.push((field, to_field_bytes(field, value)?));
        }

        let needed: usize = pending.iter().map(|(field, _)| field.width / SLOT_WIDTH).sum();
        if let Some(free) = out.free_slots() {
            if needed > free {
                return Err(CodecError::NoRoom { needed, free });
            }
        }

        for (field, bytes) in &pending {
            for (id, chunk) in field.slots().zip(bytes.chunks(SLOT_WIDTH)) {
                out.write_slot(id, chunk)
                    .map_err(|e| CodecError::ExtensionSpace { id, reason: e.0 })?;
            }
        }

        Ok(pending.len())
    }

    /// Read every tag independently; incomplete fields come back as `None`
    pub fn decode(&self, input: &dyn ExtensionReader) -> FrameMetadata {
        let values: Vec<Option<u64>> = self
            .fields
            .iter()
            .map(|field| read_field(field, input))
            .collect();

        let last = values.len() - 1;
        FrameMetadata {
            frame_id: values[0],
            stage_durations: values[1..last]
                .iter()
                .map(|v| v.map(Duration::from_micros))
                .collect(),
            completed_at: values[last].and_then(|v| i64::try_from(v).ok().map(Timestamp::from_micros)),
        }
    }

    fn raw_values(&self, meta: &FrameMetadata) -> Vec<Option<u64>> {
        let mut values = Vec::with_capacity(self.fields.len());
        values.push(meta.frame_id);
        values.extend(
            meta.stage_durations
                .iter()
                .map(|d| d.map(|d| d.as_micros().min(u64::MAX as u128) as u64)),
        );
        // A wall clock before the epoch is not representable
        values.push(meta.completed_at.and_then(|t| u64::try_from(t.micros).ok()));
        values
    }
}

fn to_field_bytes(field: &FieldSpec, value: u64) -> Result<Vec<u8>, CodecError> {
    if field.width < 8 && value >> (8 * field.width) != 0 {
        return Err(CodecError::FieldOverflow {
            tag: field.tag,
            value,
            width: field.width,
        });
    }
    Ok(value.to_be_bytes()[8 - field.width..].to_vec())
}

fn read_field(field: &FieldSpec, input: &dyn ExtensionReader) -> Option<u64> {
    let mut value = 0u64;
    for id in field.slots() {
        let slot = input.read_slot(id)?;
        if slot.len() != SLOT_WIDTH {
            return None;
        }
        for byte in slot.iter() {
            value = (value << 8) | *byte as u64;
        }
    }
    Some(value)
}

/// Logs a tag once when it goes missing, not on every frame it stays missing
#[derive(Debug)]
pub struct MissingTagTracker {
    stream: StreamId,
    present: Vec<bool>,
}

impl MissingTagTracker {
    pub fn new(stream: StreamId, tag_count: usize) -> Self {
        Self {
            stream,
            present: vec![true; tag_count],
        }
    }

    /// Returns the tags that just went from present to missing
    pub fn observe(&mut self, decoded: &FrameMetadata) -> Vec<CodecError> {
        let mut seen = Vec::with_capacity(self.present.len());
        seen.push(decoded.frame_id.is_some());
        seen.extend(decoded.stage_durations.iter().map(Option::is_some));
        seen.push(decoded.completed_at.is_some());

        let mut lost = Vec::new();
        for (tag, (was, now)) in self.present.iter_mut().zip(seen).enumerate() {
            let tag = tag as u8;
            if *was && !now {
                let err = CodecError::MissingTag { tag };
                warn!("[{}] {}", self.stream, err);
                lost.push(err);
            } else if !*was && now {
                debug!("[{}] tag {} present again", self.stream, tag);
            }
            *was = now;
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{StreamRole, StreamSide};
    use std::collections::HashMap;
    use webrtc::rtp::packet::Packet;
    use webrtc::util::{Marshal, Unmarshal};

    #[derive(Default)]
    struct Slots {
        map: HashMap<u8, Bytes>,
        read_only: bool,
        capacity: Option<usize>,
        reject_from: Option<u8>,
    }

    impl ExtensionWriter for Slots {
        fn is_writable(&self) -> bool {
            !self.read_only
        }

        fn write_slot(&mut self, id: u8, payload: &[u8]) -> Result<(), SlotRejected> {
            if self.reject_from.is_some_and(|first| id >= first) {
                return Err(SlotRejected("no room".into()));
            }
            self.map.insert(id, Bytes::copy_from_slice(payload));
            Ok(())
        }

        fn free_slots(&self) -> Option<usize> {
            self.capacity.map(|c| c.saturating_sub(self.map.len()))
        }
    }

    impl ExtensionReader for Slots {
        fn read_slot(&self, id: u8) -> Option<Bytes> {
            self.map.get(&id).cloned()
        }
    }

    fn sample() -> FrameMetadata {
        FrameMetadata {
            frame_id: Some(42),
            stage_durations: vec![
                Some(Duration::from_micros(1_200)),
                Some(Duration::from_micros(5_400)),
                Some(Duration::from_micros(300)),
            ],
            completed_at: Some(Timestamp::from_micros(1_760_000_000_123_456)),
        }
    }

    #[test]
    fn test_standard_layout_fits_one_byte_ids() {
        let layout = MetadataLayout::new(3).unwrap();
        assert_eq!(layout.tag_count(), 5);
        assert_eq!(layout.stage_count(), 3);
        assert_eq!(layout.slots_used(), 12);

        assert_eq!(
            MetadataLayout::new(5),
            Err(LayoutError::TooManySlots {
                needed: 16,
                available: 14
            })
        );
        assert_eq!(
            MetadataLayout::with_widths(&[4, 3, 8]),
            Err(LayoutError::BadWidth { tag: 1, width: 3 })
        );
        assert!(MetadataLayout::with_widths(&[16, 8]).is_err());
        assert_eq!(MetadataLayout::with_widths(&[4]), Err(LayoutError::TooFewTags(1)));
    }

    #[test]
    fn test_rtp_header_carries_metadata() {
        let layout = MetadataLayout::new(3).unwrap();
        let mut header = Header {
            version: 2,
            payload_type: 26,
            sequence_number: 7,
            ssrc: 0xdead_beef,
            ..Default::default()
        };

        assert_eq!(layout.encode(&sample(), &mut header), Ok(5));

        let packet = Packet {
            header,
            payload: Bytes::from_static(&[0u8; 32]),
        };
        let mut raw = packet.marshal().unwrap();
        let parsed = Packet::unmarshal(&mut raw).unwrap();

        assert_eq!(parsed.header.get_extension(1).map(|b| b.len()), Some(SLOT_WIDTH));
        assert_eq!(layout.decode(&parsed.header), sample());
    }

    #[test]
    fn test_missing_slot_decodes_as_unknown() {
        let layout = MetadataLayout::new(3).unwrap();
        let mut slots = Slots::default();
        layout.encode(&sample(), &mut slots).unwrap();

        // Tag 3 (packetize duration) sits in slots 7..=8
        slots.map.remove(&8);
        let decoded = layout.decode(&slots);
        assert_eq!(decoded.frame_id, Some(42));
        assert_eq!(decoded.stage_durations[1], Some(Duration::from_micros(5_400)));
        assert_eq!(decoded.stage_durations[2], None);
        assert_eq!(decoded.completed_at, sample().completed_at);

        // A slot of the wrong size is as good as missing
        slots.map.insert(1, Bytes::from_static(&[1]));
        assert_eq!(layout.decode(&slots).frame_id, None);
    }

    #[test]
    fn test_unknown_fields_are_not_written() {
        let layout = MetadataLayout::new(3).unwrap();
        let mut slots = Slots::default();
        let meta = FrameMetadata {
            frame_id: Some(1),
            ..FrameMetadata::unknown(3)
        };
        assert_eq!(layout.encode(&meta, &mut slots), Ok(1));
        assert_eq!(slots.map.len(), 2);
        assert_eq!(layout.decode(&slots), meta);
    }

    #[test]
    fn test_encode_failures_are_typed() {
        let layout = MetadataLayout::new(3).unwrap();

        let mut read_only = Slots {
            read_only: true,
            ..Default::default()
        };
        assert_eq!(layout.encode(&sample(), &mut read_only), Err(CodecError::NotWritable));

        let mut too_big = sample();
        too_big.frame_id = Some(1 << 32);
        let mut slots = Slots::default();
        assert!(matches!(
            layout.encode(&too_big, &mut slots),
            Err(CodecError::FieldOverflow { tag: 0, .. })
        ));
        assert!(slots.map.is_empty());

        let mut cramped = Slots {
            capacity: Some(4),
            ..Default::default()
        };
        assert!(matches!(
            layout.encode(&sample(), &mut cramped),
            Err(CodecError::NoRoom { needed: 12, free: 4 })
        ));
        assert!(cramped.map.is_empty());

        let mut short = sample();
        short.stage_durations.pop();
        assert_eq!(
            layout.encode(&short, &mut Slots::default()),
            Err(CodecError::StageCount { expected: 3, got: 2 })
        );
    }

    #[test]
    fn test_rejected_slot_leaves_rest_unknown() {
        let layout = MetadataLayout::new(3).unwrap();
        let mut slots = Slots {
            reject_from: Some(5),
            ..Default::default()
        };
        assert!(matches!(
            layout.encode(&sample(), &mut slots),
            Err(CodecError::ExtensionSpace { id: 5, .. })
        ));

        let decoded = layout.decode(&slots);
        assert_eq!(decoded.frame_id, Some(42));
        assert_eq!(decoded.stage_durations, vec![Some(Duration::from_micros(1_200)), None, None]);
        assert_eq!(decoded.completed_at, None);
    }

    #[test]
    fn test_header_reports_free_slots() {
        let layout = MetadataLayout::new(3).unwrap();
        let mut header = Header::default();
        assert_eq!(header.free_slots(), Some(14));

        for id in 1..=10 {
            header.set_extension(id, Bytes::from_static(&[0])).unwrap();
        }
        assert_eq!(header.free_slots(), Some(4));
        assert_eq!(
            layout.encode(&sample(), &mut header),
            Err(CodecError::NoRoom { needed: 12, free: 4 })
        );
        assert_eq!(header.get_extension(1), Some(Bytes::from_static(&[0])));
    }

    #[test]
    fn test_latest_known_values_persist() {
        let mut latest = FrameMetadata::unknown(3);
        latest.merge_from(&sample());

        let mut partial = FrameMetadata::unknown(3);
        partial.frame_id = Some(43);
        latest.merge_from(&partial);

        assert_eq!(latest.frame_id, Some(43));
        assert_eq!(latest.stage_durations, sample().stage_durations);
        assert_eq!(latest.completed_at, sample().completed_at);
    }

    #[test]
    fn test_missing_tag_reported_once_per_transition() {
        let stream = StreamId::new(StreamRole::Receiver, StreamSide::Left);
        let mut tracker = MissingTagTracker::new(stream, 5);

        let mut missing = sample();
        missing.stage_durations[2] = None;

        assert!(tracker.observe(&sample()).is_empty());
        assert_eq!(tracker.observe(&missing), vec![CodecError::MissingTag { tag: 3 }]);
        assert!(tracker.observe(&missing).is_empty());
        assert!(tracker.observe(&sample()).is_empty());
        assert_eq!(tracker.observe(&missing).len(), 1);
    }
}
