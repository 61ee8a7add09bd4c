//! Marker-delimited, length-prefixed payload framing.
//!
//! Wire format: `marker (0..N bytes) || length (4 bytes) || payload`.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default payload marker.
pub const DEFAULT_MARKER: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

/// Size of the length segment following the marker.
pub const LENGTH_SEGMENT: usize = 4;

/// Default upper bound accepted for a decoded payload length (16MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Framing error
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
}

/// Byte order used for the length segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

/// Outcome of probing a buffer for a frame header.
///
/// The three cases must stay distinct: callers read more bytes on
/// `NeedMore`, report on `Desynchronized` and size the payload on `Length`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthProbe {
    /// Header not fully buffered yet.
    NeedMore,
    /// Buffer does not start with the marker.
    Desynchronized,
    /// Decoded payload length.
    Length(u32),
}

impl LengthProbe {
    /// Integer form: `-1` need more, `0` desynchronized, otherwise the length.
    ///
    /// A zero-length frame also maps to `0`.
    pub fn sentinel(&self) -> i64 {
        match self {
            LengthProbe::NeedMore => -1,
            LengthProbe::Desynchronized => 0,
            LengthProbe::Length(n) => i64::from(*n),
        }
    }
}

/// Prepend marker and length to `payload`.
pub fn add_header(payload: &[u8], marker: &[u8], order: ByteOrder) -> Result<Vec<u8>, FramingError> {
    let length = u32::try_from(payload.len())
        .map_err(|_| FramingError::TooLarge(payload.len(), u32::MAX as usize))?;

    let mut framed = Vec::with_capacity(marker.len() + LENGTH_SEGMENT + payload.len());
    framed.extend_from_slice(marker);
    match order {
        ByteOrder::LittleEndian => framed.put_u32_le(length),
        ByteOrder::BigEndian => framed.put_u32(length),
    }
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// True iff `buffer` starts with `marker`. An empty marker always matches.
pub fn has_marker(buffer: &[u8], marker: &[u8]) -> bool {
    buffer.starts_with(marker)
}

/// Decode the payload length from the first `valid_bytes` of `buffer`.
pub fn extract_length(buffer: &[u8], valid_bytes: usize, marker: &[u8], order: ByteOrder) -> LengthProbe {
    let header_len = marker.len() + LENGTH_SEGMENT;
    if valid_bytes < header_len || buffer.len() < header_len {
        return LengthProbe::NeedMore;
    }

    if !has_marker(buffer, marker) {
        return LengthProbe::Desynchronized;
    }

    let mut segment = &buffer[marker.len()..header_len];
    let length = match order {
        ByteOrder::LittleEndian => segment.get_u32_le(),
        ByteOrder::BigEndian => segment.get_u32(),
    };
    LengthProbe::Length(length)
}

/// Framing settings for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameCodec {
    marker: Vec<u8>,
    order: ByteOrder,
    max_payload_size: usize,
}

impl FrameCodec {
    /// Create a codec with the given marker and byte order
    pub fn new(marker: impl Into<Vec<u8>>, order: ByteOrder) -> Self {
        Self {
            marker: marker.into(),
            order,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Limit the payload length accepted by [`FrameCodec::probe`] callers
    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn marker(&self) -> &[u8] {
        &self.marker
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Marker plus length segment.
    pub fn header_len(&self) -> usize {
        self.marker.len() + LENGTH_SEGMENT
    }

    /// Frame `payload` for transmission
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
        if payload.len() > self.max_payload_size {
            return Err(FramingError::TooLarge(payload.len(), self.max_payload_size));
        }
        add_header(payload, &self.marker, self.order)
    }

    /// Probe the first `valid_bytes` of `buffer` for a header
    pub fn probe(&self, buffer: &[u8], valid_bytes: usize) -> LengthProbe {
        extract_length(buffer, valid_bytes, &self.marker, self.order)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER.to_vec(), ByteOrder::LittleEndian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout_little_endian() {
        let framed = add_header(b"hi", &DEFAULT_MARKER, ByteOrder::LittleEndian).unwrap();
        assert_eq!(framed, vec![0xAA, 0xBB, 0xCC, 0xDD, 2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn test_header_layout_big_endian() {
        let framed = add_header(&[7u8; 3], &[0x01], ByteOrder::BigEndian).unwrap();
        assert_eq!(framed, vec![0x01, 0, 0, 0, 3, 7, 7, 7]);
    }

    #[test]
    fn test_empty_marker_still_prefixes_length() {
        let framed = add_header(b"abc", &[], ByteOrder::LittleEndian).unwrap();
        assert_eq!(framed.len(), 7);
        assert_eq!(extract_length(&framed, 4, &[], ByteOrder::LittleEndian), LengthProbe::Length(3));
    }

    #[test]
    fn test_partial_header_needs_more() {
        let framed = add_header(b"hello", &DEFAULT_MARKER, ByteOrder::LittleEndian).unwrap();
        let probe = extract_length(&framed, 7, &DEFAULT_MARKER, ByteOrder::LittleEndian);
        assert_eq!(probe, LengthProbe::NeedMore);
        assert_eq!(probe.sentinel(), -1);
    }

    #[test]
    fn test_marker_mismatch_desynchronizes() {
        let mut framed = add_header(b"hello", &DEFAULT_MARKER, ByteOrder::LittleEndian).unwrap();
        framed[0] = 0x00;
        let probe = extract_length(&framed, 8, &DEFAULT_MARKER, ByteOrder::LittleEndian);
        assert_eq!(probe, LengthProbe::Desynchronized);
        assert_eq!(probe.sentinel(), 0);
    }

    #[test]
    fn test_has_marker_empty() {
        assert!(has_marker(&[], &[]));
        assert!(has_marker(&[1, 2, 3], &[]));
        assert!(!has_marker(&[0xAA], &DEFAULT_MARKER));
    }

    #[test]
    fn test_codec_header_len() {
        assert_eq!(FrameCodec::default().header_len(), 8);
        assert_eq!(FrameCodec::new(Vec::new(), ByteOrder::BigEndian).header_len(), 4);
    }

    #[test]
    fn test_encode_respects_max_payload() {
        let codec = FrameCodec::default().with_max_payload_size(4);
        assert!(codec.encode(b"four").is_ok());
        assert!(matches!(codec.encode(b"fives"), Err(FramingError::TooLarge(5, 4))));
    }

    fn byte_order() -> impl Strategy<Value = ByteOrder> {
        prop_oneof![Just(ByteOrder::LittleEndian), Just(ByteOrder::BigEndian)]
    }

    proptest! {
        #[test]
        fn prop_length_round_trip(
            payload in prop::collection::vec(any::<u8>(), 0..4096),
            marker in prop::collection::vec(any::<u8>(), 0..8),
            order in byte_order(),
        ) {
            let framed = add_header(&payload, &marker, order)?;
            prop_assert_eq!(framed.len(), marker.len() + LENGTH_SEGMENT + payload.len());
            let probe = extract_length(&framed, marker.len() + LENGTH_SEGMENT, &marker, order);
            prop_assert_eq!(probe, LengthProbe::Length(payload.len() as u32));
            prop_assert_eq!(&framed[marker.len() + LENGTH_SEGMENT..], payload.as_slice());
        }

        #[test]
        fn prop_short_buffer_needs_more(
            buffer in prop::collection::vec(any::<u8>(), 0..32),
            marker in prop::collection::vec(any::<u8>(), 0..8),
            order in byte_order(),
            shortfall in 1usize..12,
        ) {
            let valid = (marker.len() + LENGTH_SEGMENT).saturating_sub(shortfall);
            prop_assert_eq!(extract_length(&buffer, valid, &marker, order), LengthProbe::NeedMore);
        }

        #[test]
        fn prop_mismatched_marker_desynchronizes(
            marker in prop::collection::vec(any::<u8>(), 1..8),
            tail in prop::collection::vec(any::<u8>(), 4..16),
            flip in any::<u8>(),
        ) {
            let mut buffer = marker.clone();
            buffer[0] = buffer[0].wrapping_add(flip.max(1));
            buffer.extend_from_slice(&tail);
            let valid = buffer.len();
            prop_assert_eq!(
                extract_length(&buffer, valid, &marker, ByteOrder::LittleEndian),
                LengthProbe::Desynchronized
            );
        }
    }
}
