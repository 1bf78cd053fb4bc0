/// Packet framing for finder characteristic streams
///
/// Outbound application packets are framed with a 4-byte little-endian length
/// prefix holding the total frame size (prefix included), then cut into chunks
/// that fit the link MTU. Inbound chunks are accumulated until a whole frame is
/// present, at which point the payload (prefix stripped) is queued.
///
/// Wire format: [total_len: u32 LE | payload...] where total_len = 4 + payload.len()

use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a declared frame length
pub const DEFAULT_MAX_FRAME_LEN: u32 = 65_536;

/// Errors for framing and reassembly
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Chunk size must be at least 1")]
    InvalidChunkSize,
    #[error("Payload too large to frame: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Split `data` into consecutive chunks of at most `max_chunk_size` bytes
///
/// Empty input yields no chunks. Concatenating the chunks in order gives back
/// `data` exactly.
pub fn chunk(data: &[u8], max_chunk_size: usize) -> Result<Vec<Vec<u8>>, FrameError> {
    if max_chunk_size == 0 {
        return Err(FrameError::InvalidChunkSize);
    }
    Ok(data
        .chunks(max_chunk_size)
        .map(|slice| slice.to_vec())
        .collect())
}

/// Prefix `payload` with its total frame length
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    frame_with_limit(payload, u32::MAX)
}

/// Like [`frame`], rejecting frames longer than `max_frame_len`
pub fn frame_with_limit(payload: &[u8], max_frame_len: u32) -> Result<Vec<u8>, FrameError> {
    let total = payload
        .len()
        .checked_add(LENGTH_PREFIX_SIZE)
        .and_then(|total| u32::try_from(total).ok())
        .filter(|total| *total <= max_frame_len)
        .ok_or(FrameError::PayloadTooLarge(payload.len()))?;

    let mut framed = Vec::with_capacity(total as usize);
    framed.extend_from_slice(&total.to_le_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Stateful reconstruction of length-prefixed packets from a chunk stream
///
/// Completed packets wait in a FIFO queue. Consumers peek with
/// [`oldest_packet`](Self::oldest_packet) and drop the packet with
/// [`remove_packet`](Self::remove_packet) once they are done with it, so a
/// consumer that fails halfway can retry on the same packet.
#[derive(Debug)]
pub struct PacketReassembler {
    /// Bytes of the packet currently being accumulated
    buffer: Vec<u8>,
    /// Total frame length, known once the prefix has arrived
    expected_len: Option<usize>,
    completed: VecDeque<Vec<u8>>,
    max_frame_len: u32,
}

impl PacketReassembler {
    pub fn new(max_frame_len: u32) -> Self {
        Self {
            buffer: Vec::new(),
            expected_len: None,
            completed: VecDeque::new(),
            max_frame_len,
        }
    }

    pub fn new_default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }

    /// Append a chunk and move every frame it completes to the queue
    ///
    /// Returns the number of packets completed by this chunk. A chunk may
    /// complete several frames at once. On a malformed prefix the partial
    /// buffer is dropped and the next chunk starts a fresh packet; packets
    /// already completed stay queued.
    pub fn add_chunk(&mut self, chunk: &[u8]) -> Result<usize, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut completed = 0;
        // Start of the first byte not yet moved into a packet
        let mut consumed = 0;

        loop {
            let available = self.buffer.len() - consumed;
            let expected = match self.expected_len {
                Some(expected) => expected,
                None => {
                    if available < LENGTH_PREFIX_SIZE {
                        break;
                    }
                    let expected = self.read_prefix(consumed)?;
                    self.expected_len = Some(expected);
                    expected
                }
            };

            if available < expected {
                break;
            }

            let payload = self.buffer[consumed + LENGTH_PREFIX_SIZE..consumed + expected].to_vec();
            debug!("Packet reassembled: {} payload bytes", payload.len());
            self.completed.push_back(payload);
            self.expected_len = None;
            consumed += expected;
            completed += 1;
        }

        self.buffer.drain(..consumed);
        Ok(completed)
    }

    /// Decode the length prefix starting at `offset`. Resets on a bad prefix.
    fn read_prefix(&mut self, offset: usize) -> Result<usize, FrameError> {
        let declared = u32::from_le_bytes([
            self.buffer[offset],
            self.buffer[offset + 1],
            self.buffer[offset + 2],
            self.buffer[offset + 3],
        ]);

        let problem = if (declared as usize) < LENGTH_PREFIX_SIZE {
            Some(format!(
                "declared length {} is shorter than the {}-byte prefix",
                declared, LENGTH_PREFIX_SIZE
            ))
        } else if declared > self.max_frame_len {
            Some(format!(
                "declared length {} exceeds limit {}",
                declared, self.max_frame_len
            ))
        } else {
            None
        };

        match problem {
            Some(reason) => {
                warn!(
                    "Dropping {} buffered bytes: {}",
                    self.buffer.len() - offset,
                    reason
                );
                self.reset();
                Err(FrameError::MalformedFrame(reason))
            }
            None => Ok(declared as usize),
        }
    }

    /// Oldest completed packet, left in the queue
    pub fn oldest_packet(&self) -> Option<&[u8]> {
        self.completed.front().map(Vec::as_slice)
    }

    /// Remove and return the oldest completed packet
    pub fn remove_packet(&mut self) -> Option<Vec<u8>> {
        self.completed.pop_front()
    }

    /// Number of completed packets waiting to be consumed
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Bytes accumulated towards the next packet
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Total length of the packet in progress, once its prefix has arrived
    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    /// Drop the packet in progress. Completed packets are kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = None;
    }
}

impl Default for PacketReassembler {
    fn default() -> Self {
        Self::new_default()
    }
}
