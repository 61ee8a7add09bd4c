//! Receive buffer owned by a session's read loop.

/// Default receive buffer capacity (32KB)
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 32 * 1024;

/// Growable receive buffer with offset and payload tracking.
///
/// `payload_length` is `None` until a frame header has been decoded.
#[derive(Debug)]
pub struct TransportBuffer {
    bytes: Vec<u8>,
    write_offset: usize,
    payload_length: Option<usize>,
    reallocations: u32,
}

impl TransportBuffer {
    /// Allocate a buffer of `capacity` zeroed bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity.max(1)],
            write_offset: 0,
            payload_length: None,
            reallocations: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn payload_length(&self) -> Option<usize> {
        self.payload_length
    }

    /// Number of times the storage has been grown.
    pub fn reallocations(&self) -> u32 {
        self.reallocations
    }

    /// Bytes written so far for the current header or payload.
    pub fn filled(&self) -> &[u8] {
        &self.bytes[..self.write_offset]
    }

    /// Slice the next read should fill.
    ///
    /// Unframed reads get the whole capacity. Framed reads get the rest of
    /// the header (`header_len`) while the length is unknown, then the rest
    /// of the payload.
    pub fn read_window(&mut self, header_len: Option<usize>) -> &mut [u8] {
        let target = match (header_len, self.payload_length) {
            (None, _) => self.bytes.len(),
            (Some(header_len), None) => header_len,
            (Some(_), Some(length)) => length,
        };
        self.ensure_capacity(target);
        &mut self.bytes[self.write_offset..target]
    }

    /// Record `n` freshly read bytes.
    pub fn advance(&mut self, n: usize) {
        self.write_offset = (self.write_offset + n).min(self.bytes.len());
    }

    /// Switch from header to payload accumulation.
    ///
    /// The header bytes are consumed, so the write offset restarts at zero.
    /// Storage grows to at least `length` in a single reallocation.
    pub fn begin_payload(&mut self, length: usize) {
        self.write_offset = 0;
        self.payload_length = Some(length);
        self.ensure_capacity(length);
    }

    /// The accumulated payload, if complete.
    pub fn payload(&self) -> Option<&[u8]> {
        match self.payload_length {
            Some(length) if self.write_offset == length => Some(&self.bytes[..length]),
            _ => None,
        }
    }

    /// Prepare for the next header.
    pub fn reset(&mut self) {
        self.write_offset = 0;
        self.payload_length = None;
    }

    fn ensure_capacity(&mut self, needed: usize) {
        if needed > self.bytes.len() {
            self.bytes.resize(needed, 0);
            self.reallocations += 1;
        }
    }
}

impl Default for TransportBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RECEIVE_BUFFER_SIZE)
    }
}
