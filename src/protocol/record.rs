//! Record marking.
//!
//! A record is one or more fragments, each preceded by a 4-byte big-endian marker.
//! The top bit of the marker flags the last fragment of the record and the low 31
//! bits give the fragment length.
//!
//! ```text
//! +--------------------+------------------+--------------------+-----
//! | 0 | len (31 bits)  | fragment bytes   | 1 | len (31 bits)  | ...
//! +--------------------+------------------+--------------------+-----
//! ```
use super::{Decoded, ProtocolError};

/// Fragments and whole records at or above this size are rejected as corrupt.
pub const FRAGMENT_MAX: usize = 32 * 1024 * 1024;

pub const MARKER_LEN: usize = 4;

const LAST_FRAGMENT: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    #[default]
    RecordFragmentMarker,
    RecordFragment,
    /// The fragment outlived the read that delivered its marker.
    LongRecordFragment,
    Done,
}

/// Reassembles records from arbitrarily chunked input.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    state: DecodeState,
    marker: [u8; MARKER_LEN],
    marker_len: usize,
    remaining: usize,
    last: bool,
    record: Vec<u8>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Feeds bytes from `input`, consuming only what belongs to the current record.
    ///
    /// A decoder that returned a record starts the next one on its following call.
    pub fn decode(&mut self, input: &mut &[u8]) -> Result<Decoded<Vec<u8>>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::RecordFragmentMarker => {
                    let wanted = MARKER_LEN - self.marker_len;
                    let n = wanted.min(input.len());
                    self.marker[self.marker_len..self.marker_len + n].copy_from_slice(&input[..n]);
                    self.marker_len += n;
                    *input = &input[n..];
                    if self.marker_len < MARKER_LEN {
                        return Ok(Decoded::NeedMore(MARKER_LEN - self.marker_len));
                    }

                    let marker = u32::from_be_bytes(self.marker);
                    let len = (marker & !LAST_FRAGMENT) as usize;
                    if len >= FRAGMENT_MAX {
                        return Err(ProtocolError::FragmentTooLarge(len));
                    }
                    let total = self.record.len() + len;
                    if total >= FRAGMENT_MAX {
                        return Err(ProtocolError::RecordTooLarge(total));
                    }

                    self.last = marker & LAST_FRAGMENT != 0;
                    self.remaining = len;
                    self.marker_len = 0;
                    // Grow with the bytes actually received, not the declared length.
                    self.record.reserve(len.min(input.len()));
                    self.state = DecodeState::RecordFragment;
                }
                DecodeState::RecordFragment | DecodeState::LongRecordFragment => {
                    let n = self.remaining.min(input.len());
                    self.record.extend_from_slice(&input[..n]);
                    self.remaining -= n;
                    *input = &input[n..];

                    if self.remaining > 0 {
                        self.state = DecodeState::LongRecordFragment;
                        return Ok(Decoded::NeedMore(self.remaining));
                    }
                    if self.last {
                        self.state = DecodeState::Done;
                        return Ok(Decoded::Done(std::mem::take(&mut self.record)));
                    }
                    self.state = DecodeState::RecordFragmentMarker;
                }
                DecodeState::Done => *self = Self::default(),
            }
        }
    }
}

/// Starts an outgoing record: a buffer holding a placeholder marker, ready for the body.
pub fn start() -> Vec<u8> {
    vec![0; MARKER_LEN]
}

/// Patches the marker of a buffer made by [`start`] once the body is complete,
/// sealing it as a single last fragment.
pub fn finish(buffer: &mut [u8]) -> Result<(), ProtocolError> {
    let len = buffer.len().saturating_sub(MARKER_LEN);
    if len >= FRAGMENT_MAX {
        return Err(ProtocolError::FragmentTooLarge(len));
    }
    let marker = LAST_FRAGMENT | len as u32;
    buffer[..MARKER_LEN].copy_from_slice(&marker.to_be_bytes());
    Ok(())
}

/// Frames `payload` as a single-fragment record.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut buffer = start();
    buffer.extend_from_slice(payload);
    finish(&mut buffer)?;
    Ok(buffer)
}
