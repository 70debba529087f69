//! Bundle framing: packing messages into datagrams and recovering the unseen
//! suffix from a received one.
//!
//! Datagram layout, little-endian throughout:
//!
//! ```text
//! [count:u8] { [number:u16][length:u16][type:u8][body:length-1] } * count
//! ```
//!
//! Senders list the newest message first and repeat a window of recent
//! messages in every datagram, so any single datagram lost in transit is
//! recovered by the next one. The receiver keeps the number of the last message
//! it accepted and takes only the entries that come after it.

use crate::error::FrameError;
use crate::message::{Body, Message};
use crate::wire::WireWriter;

/// Most messages a single datagram may declare.
pub const MAX_MESSAGES: usize = 32;

/// Shortest datagram that can hold a message header.
pub const MIN_DATAGRAM_LEN: usize = 5;

const ENTRY_HEADER_LEN: usize = 4;

/// Numbers below this count as a continuation past 0xFFFF.
const WRAP_LOW: u16 = 0x20;
/// Last-accepted numbers above this allow wraparound continuation.
const WRAP_HIGH: u16 = 0xFFDF;
/// Numbers above this are stale when the last accepted number is low.
const STALE_HIGH: u16 = 0xFFBF;
/// Last-accepted numbers below this reject near-top numbers as stale.
const STALE_LOW: u16 = 0x40;

/// Packs `messages`, newest first, into one datagram.
///
/// Entries are added in order while the datagram stays within `limit` bytes
/// and [`MAX_MESSAGES`]. The first message is always included so a caller can
/// never produce an empty datagram.
pub fn pack(messages: &[Message], limit: usize) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(limit.min(2048));
    w.write_u8(0);
    let mut count = 0u8;

    for message in messages.iter().take(MAX_MESSAGES) {
        let entry = message.encode_entry();
        if count > 0 && w.len() + entry.len() > limit {
            break;
        }
        w.write_bytes(&entry);
        count += 1;
    }

    let mut datagram = w.into_inner();
    datagram[0] = count;
    datagram
}

/// Returns true when `number` was already seen given `last_accepted`.
pub fn is_stale(number: u16, last_accepted: u16) -> bool {
    if number <= last_accepted {
        // Low numbers right after the top of the range continue the sequence.
        !(number < WRAP_LOW && last_accepted > WRAP_HIGH)
    } else {
        number > STALE_HIGH && last_accepted < STALE_LOW
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Reads one entry at `offset`, returning the message and the next offset.
fn read_entry(bytes: &[u8], offset: usize) -> Result<(Message, usize), FrameError> {
    if bytes.len() < offset + ENTRY_HEADER_LEN {
        return Err(FrameError::TruncatedHeader { offset });
    }
    let number = read_u16(bytes, offset);
    let length = read_u16(bytes, offset + 2);
    let start = offset + ENTRY_HEADER_LEN;
    let remaining = bytes.len() - start;

    if length < 2 || length as usize > remaining {
        return Err(FrameError::InvalidLength { length, remaining });
    }

    let tag = bytes[start];
    let body_bytes = &bytes[start + 1..start + length as usize];
    let body = Body::decode(tag, body_bytes)
        .map_err(|source| FrameError::Message { number, source })?;

    Ok((Message { number, body }, start + length as usize))
}

/// Recovers the messages in `datagram` that follow `last_accepted`.
///
/// The result is in ascending (processing) order. Any structural or decode
/// failure rejects the whole datagram.
pub fn unpack(datagram: &[u8], last_accepted: u16) -> Result<Vec<Message>, FrameError> {
    if datagram.len() < MIN_DATAGRAM_LEN {
        return Err(FrameError::TooShort(datagram.len()));
    }
    let count = datagram[0];
    if count == 0 || count as usize > MAX_MESSAGES {
        return Err(FrameError::InvalidCount(count));
    }

    // The common case is a datagram whose newest entry is exactly the next
    // message; everything behind it has been seen already.
    let first_number = read_u16(datagram, 1);
    if first_number == last_accepted.wrapping_add(1) {
        let (message, _) = read_entry(datagram, 1)?;
        return Ok(vec![message]);
    }

    let mut accepted = Vec::new();
    let mut offset = 1;
    for _ in 0..count {
        if datagram.len() < offset + ENTRY_HEADER_LEN {
            return Err(FrameError::TruncatedHeader { offset });
        }
        if is_stale(read_u16(datagram, offset), last_accepted) {
            break;
        }
        let (message, next) = read_entry(datagram, offset)?;
        accepted.push(message);
        offset = next;
    }

    accepted.reverse();
    Ok(accepted)
}
