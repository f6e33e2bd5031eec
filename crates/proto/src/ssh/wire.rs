//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Writers append to a [`BytesMut`]; readers take the message slice plus a
//! cursor (`offset`) that is advanced past every field they consume. All
//! readers fail with [`WispError::ProtocolViolation`] on truncated input and
//! never panic.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use wisp_proto::ssh::wire::{put_string, put_u32, read_string, read_u32};
//!
//! let mut buf = BytesMut::new();
//! put_u32(&mut buf, 7);
//! put_string(&mut buf, b"ssh-userauth");
//!
//! let mut offset = 0;
//! assert_eq!(read_u32(&buf, &mut offset).unwrap(), 7);
//! assert_eq!(read_string(&buf, &mut offset).unwrap(), b"ssh-userauth");
//! ```

use bytes::{BufMut, BytesMut};
use wisp_platform::{WispError, WispResult};

/// Appends a `uint32`.
pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

/// Appends a `boolean`.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Appends a length-prefixed `string`.
pub fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Appends a comma-separated `name-list`.
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_string(buf, names.join(",").as_bytes());
}

/// Appends an `mpint` from unsigned big-endian magnitude bytes.
///
/// Leading zeros are stripped and a zero byte is prepended when the high bit
/// is set, so the value is always encoded as non-negative.
pub fn put_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.first().map_or(false, |&b| b & 0x80 != 0) {
        buf.put_u32(trimmed.len() as u32 + 1);
        buf.put_u8(0);
    } else {
        buf.put_u32(trimmed.len() as u32);
    }
    buf.put_slice(trimmed);
}

fn truncated(what: &str, offset: usize) -> WispError {
    WispError::ProtocolViolation(format!("Truncated {} at offset {}", what, offset))
}

/// Reads a single byte.
pub fn read_u8(data: &[u8], offset: &mut usize) -> WispResult<u8> {
    let byte = *data.get(*offset).ok_or_else(|| truncated("byte", *offset))?;
    *offset += 1;
    Ok(byte)
}

/// Reads a `boolean`.
pub fn read_bool(data: &[u8], offset: &mut usize) -> WispResult<bool> {
    read_u8(data, offset).map(|b| b != 0)
}

/// Reads a `uint32`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> WispResult<u32> {
    let end = offset
        .checked_add(4)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| truncated("uint32", *offset))?;
    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset = end;
    Ok(value)
}

/// Reads `len` raw bytes.
pub fn read_bytes<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> WispResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| truncated("bytes", *offset))?;
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}

/// Reads a length-prefixed `string` as raw bytes.
pub fn read_string<'a>(data: &'a [u8], offset: &mut usize) -> WispResult<&'a [u8]> {
    let len = read_u32(data, offset)? as usize;
    read_bytes(data, offset, len).map_err(|_| truncated("string", *offset))
}

/// Reads a length-prefixed `string` that must be UTF-8.
pub fn read_utf8(data: &[u8], offset: &mut usize) -> WispResult<String> {
    let bytes = read_string(data, offset)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| WispError::ProtocolViolation("String is not valid UTF-8".to_string()))
}

/// Reads a `name-list`.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> WispResult<Vec<String>> {
    let list = read_utf8(data, offset)?;
    if list.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(list.split(',').map(String::from).collect())
    }
}

/// Reads an `mpint`, returning its magnitude without the sign byte.
pub fn read_mpint<'a>(data: &'a [u8], offset: &mut usize) -> WispResult<&'a [u8]> {
    let raw = read_string(data, offset)?;
    if raw.first().map_or(false, |&b| b & 0x80 != 0) {
        return Err(WispError::ProtocolViolation(
            "Negative mpint is not allowed here".to_string(),
        ));
    }
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    Ok(&raw[start..])
}

/// Returns an error unless the message starts with `expected`.
pub fn expect_message(data: &[u8], expected: u8, name: &str) -> WispResult<()> {
    match data.first() {
        Some(&t) if t == expected => Ok(()),
        Some(&t) => Err(WispError::ProtocolViolation(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected, name, t
        ))),
        None => Err(WispError::ProtocolViolation(format!(
            "{} message is empty",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpint_encoding() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00, 0x00, 0x80, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0x00, 0x80, 0x01]);

        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00, 0x7f]);
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0x7f]);

        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0, 0]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_mpint_read_strips_sign_byte() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0xff, 0x01]);

        let mut offset = 0;
        assert_eq!(read_mpint(&buf, &mut offset).unwrap(), &[0xff, 0x01]);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_name_list_empty_and_multiple() {
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &[]);
        put_name_list(&mut buf, &["a".to_string(), "b".to_string()]);

        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).unwrap().is_empty());
        assert_eq!(read_name_list(&buf, &mut offset).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_truncated_string_is_protocol_violation() {
        let data = [0, 0, 0, 10, b'a', b'b'];
        let mut offset = 0;
        assert!(matches!(
            read_string(&data, &mut offset),
            Err(WispError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_huge_length_does_not_overflow() {
        let data = [0xff, 0xff, 0xff, 0xff];
        let mut offset = 0;
        assert!(read_string(&data, &mut offset).is_err());
    }

    #[test]
    fn test_expect_message() {
        assert!(expect_message(&[21], 21, "SSH_MSG_NEWKEYS").is_ok());
        assert!(expect_message(&[20], 21, "SSH_MSG_NEWKEYS").is_err());
        assert!(expect_message(&[], 21, "SSH_MSG_NEWKEYS").is_err());
    }
}
