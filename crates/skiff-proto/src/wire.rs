//! Primitive wire encoding.
//!
//! All integers are big-endian. `bytes` is a `u64` length followed by
//! the raw bytes, `str` is `bytes` holding UTF-8, `optional<T>` is a
//! one-byte present flag followed by `T`, and `list<T>` is a `u64`
//! count followed by the elements.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Errors raised while encoding, decoding or interpreting packets.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// An I/O error on the underlying byte pair.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended in the middle of a packet.
    #[error("unexpected EOF in data stream")]
    UnexpectedEof,

    /// A `str` field did not hold valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A `bool` field held a byte other than 0 or 1.
    #[error("invalid boolean value {0:#04x}")]
    InvalidBool(u8),

    /// A packet id that is not registered on this side.
    #[error("received invalid packet id '{0}'")]
    UnknownPacketId(u32),

    /// The peer answered a request with a packet of the wrong type.
    /// This is a bug on one side of the connection.
    #[error("invalid response '{got}' from remote dispatcher (expected {expected}); this is a bug")]
    UnexpectedResponse {
        /// The packet kind that was expected.
        expected: &'static str,
        /// The packet kind that arrived.
        got: &'static str,
    },

    /// The remote reported an OS error while handling a request.
    #[error("remote error: {msg}")]
    RemoteOs {
        /// The remote errno value.
        errno: i64,
        /// The rendered errno description.
        strerror: String,
        /// The full error message.
        msg: String,
    },

    /// The remote rejected a request field.
    #[error("invalid value given for field '{field}': {message}")]
    InvalidField {
        /// The rejected field name.
        field: String,
        /// Why the value was rejected.
        message: String,
    },

    /// The remote failed to spawn a requested process.
    #[error("remote process error: {0}")]
    Process(String),
}

impl ProtoError {
    /// Maps the short-read flavor of I/O errors onto
    /// [`ProtoError::UnexpectedEof`] so session teardown is reported
    /// uniformly.
    fn from_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtoError::UnexpectedEof
        } else {
            ProtoError::Io(e)
        }
    }
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), ProtoError> {
    r.read_exact(buf).map_err(ProtoError::from_read)
}

pub(crate) fn write_bool<W: Write>(w: &mut W, v: bool) -> Result<(), ProtoError> {
    Ok(w.write_all(&[u8::from(v)])?)
}

pub(crate) fn read_bool<R: Read>(r: &mut R) -> Result<bool, ProtoError> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    match buf[0] {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(ProtoError::InvalidBool(b)),
    }
}

pub(crate) fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<(), ProtoError> {
    Ok(w.write_all(&v.to_be_bytes())?)
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32, ProtoError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<(), ProtoError> {
    Ok(w.write_all(&v.to_be_bytes())?)
}

pub(crate) fn read_i32<R: Read>(r: &mut R) -> Result<i32, ProtoError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

pub(crate) fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<(), ProtoError> {
    Ok(w.write_all(&v.to_be_bytes())?)
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> Result<u64, ProtoError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<(), ProtoError> {
    Ok(w.write_all(&v.to_be_bytes())?)
}

pub(crate) fn read_i64<R: Read>(r: &mut R) -> Result<i64, ProtoError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

pub(crate) fn write_bytes<W: Write>(w: &mut W, v: &[u8]) -> Result<(), ProtoError> {
    write_u64(w, v.len() as u64)?;
    Ok(w.write_all(v)?)
}

pub(crate) fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, ProtoError> {
    let len = usize::try_from(read_u64(r)?).map_err(|_| ProtoError::UnexpectedEof)?;
    let mut buf = vec![0u8; len];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

pub(crate) fn write_str<W: Write>(w: &mut W, v: &str) -> Result<(), ProtoError> {
    write_bytes(w, v.as_bytes())
}

pub(crate) fn read_str<R: Read>(r: &mut R) -> Result<String, ProtoError> {
    String::from_utf8(read_bytes(r)?).map_err(|_| ProtoError::InvalidUtf8)
}

pub(crate) fn write_opt<W: Write, T, F>(w: &mut W, v: Option<&T>, f: F) -> Result<(), ProtoError>
where
    T: ?Sized,
    F: FnOnce(&mut W, &T) -> Result<(), ProtoError>,
{
    write_bool(w, v.is_some())?;
    match v {
        Some(v) => f(w, v),
        None => Ok(()),
    }
}

pub(crate) fn read_opt<R: Read, T, F>(r: &mut R, f: F) -> Result<Option<T>, ProtoError>
where
    F: FnOnce(&mut R) -> Result<T, ProtoError>,
{
    if read_bool(r)? {
        Ok(Some(f(r)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn write_str_list<W: Write>(w: &mut W, v: &[String]) -> Result<(), ProtoError> {
    write_u64(w, v.len() as u64)?;
    for s in v {
        write_str(w, s)?;
    }
    Ok(())
}

pub(crate) fn read_str_list<R: Read>(r: &mut R) -> Result<Vec<String>, ProtoError> {
    let count = usize::try_from(read_u64(r)?).map_err(|_| ProtoError::UnexpectedEof)?;
    let mut out = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        out.push(read_str(r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_u32_big_endian() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4]);
        assert_eq!(read_u32(&mut Cursor::new(buf)).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_i32_negative() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -1).unwrap();
        assert_eq!(buf, vec![0xff; 4]);
        assert_eq!(read_i32(&mut Cursor::new(buf)).unwrap(), -1);
    }

    #[test]
    fn test_bytes_length_prefixed() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hi").unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_opt_none_is_single_byte() {
        let mut buf = Vec::new();
        write_opt(&mut buf, None::<&str>, |w, v| write_str(w, v)).unwrap();
        assert_eq!(buf, vec![0]);
    }

    #[test]
    fn test_short_read_is_eof() {
        let err = read_u64(&mut Cursor::new(vec![1, 2])).unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedEof));
    }

    #[test]
    fn test_bool_roundtrip_and_invalid() {
        let mut buf = Vec::new();
        write_bool(&mut buf, true).unwrap();
        assert!(read_bool(&mut Cursor::new(buf)).unwrap());
        let err = read_bool(&mut Cursor::new(vec![2])).unwrap_err();
        assert!(matches!(err, ProtoError::InvalidBool(2)));
    }

    #[test]
    fn test_str_list_roundtrip() {
        let mut buf = Vec::new();
        let v = vec!["a".to_owned(), "bc".to_owned()];
        write_str_list(&mut buf, &v).unwrap();
        assert_eq!(read_str_list(&mut Cursor::new(buf)).unwrap(), v);
    }
}
