//! Little-endian primitives shared by the message codec and the bundle framer.
//!
//! Strings travel as NUL-terminated single-byte text. Every byte maps to the
//! Unicode code point of the same value when reading; characters above U+00FF
//! are replaced with `?` when writing.

use crate::error::FormatError;

/// Appends wire primitives to a growable buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buffer: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Writes `value` followed by the NUL terminator.
    pub fn write_string(&mut self, value: &str) {
        self.buffer.extend(value.chars().map(|c| {
            let code = c as u32;
            if code <= 0xFF {
                code as u8
            } else {
                b'?'
            }
        }));
        self.buffer.push(0);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// True when every character of `value` has a single-byte encoding.
pub fn is_latin1(value: &str) -> bool {
    value.chars().all(|c| u32::from(c) <= 0xFF)
}

/// Cursor over a received message body.
///
/// Reads fail with a [`FormatError`] naming the message being decoded so the
/// caller can report which field was truncated.
pub struct WireReader<'a> {
    buffer: &'a [u8],
    position: usize,
    message: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(message: &'static str, buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
            message,
        }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    fn take(&mut self, count: usize, field: &str) -> Result<&'a [u8], FormatError> {
        if self.remaining() < count {
            return Err(FormatError::new(
                self.message,
                format!(
                    "truncated reading {field}: need {count} bytes, have {}",
                    self.remaining()
                ),
            ));
        }
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self, field: &str) -> Result<u8, FormatError> {
        Ok(self.take(1, field)?[0])
    }

    pub fn read_u16(&mut self, field: &str) -> Result<u16, FormatError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self, field: &str) -> Result<u32, FormatError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, count: usize, field: &str) -> Result<Vec<u8>, FormatError> {
        Ok(self.take(count, field)?.to_vec())
    }

    pub fn read_string(&mut self, field: &str) -> Result<String, FormatError> {
        let rest = &self.buffer[self.position.min(self.buffer.len())..];
        let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            FormatError::new(self.message, format!("unterminated string in {field}"))
        })?;
        let value = rest[..end].iter().map(|&b| b as char).collect();
        self.position += end + 1;
        Ok(value)
    }

    /// Reads the single `0x00` marker byte several bodies start with.
    pub fn expect_zero(&mut self, field: &str) -> Result<(), FormatError> {
        let value = self.read_u8(field)?;
        if value != 0 {
            return Err(FormatError::new(
                self.message,
                format!("expected 0x00 in {field}, found 0x{value:02x}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_little_endian() {
        let mut writer = WireWriter::new();
        writer.write_u16(0x1234);
        writer.write_u32(0xAABBCCDD);
        assert_eq!(
            writer.into_inner(),
            vec![0x34, 0x12, 0xDD, 0xCC, 0xBB, 0xAA]
        );
    }

    #[test]
    fn test_string_encoding_replaces_wide_chars() {
        let mut writer = WireWriter::new();
        writer.write_string("é€");
        assert_eq!(writer.into_inner(), vec![0xE9, b'?', 0]);
        assert!(is_latin1("é"));
        assert!(!is_latin1("é€"));
    }

    #[test]
    fn test_read_string_and_position() {
        let data = [b'a', b'b', 0, 7];
        let mut reader = WireReader::new("Test", &data);
        assert_eq!(reader.read_string("name").unwrap(), "ab");
        assert_eq!(reader.position(), 3);
        assert_eq!(reader.read_u8("value").unwrap(), 7);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_unterminated_string_fails() {
        let data = [b'a', b'b'];
        let mut reader = WireReader::new("Test", &data);
        let err = reader.read_string("name").unwrap_err();
        assert_eq!(err.message, "Test");
        assert!(err.cause.contains("unterminated"));
    }

    #[test]
    fn test_truncated_integer_fails() {
        let data = [1];
        let mut reader = WireReader::new("Test", &data);
        assert!(reader.read_u16("id").is_err());
    }

    #[test]
    fn test_expect_zero() {
        let data = [0, 1];
        let mut reader = WireReader::new("Test", &data);
        assert!(reader.expect_zero("marker").is_ok());
        assert!(reader.expect_zero("marker").is_err());
    }
}
