use std::str;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProxyError, ProxyResult};

pub(crate) fn get_cstring(buf: &mut BytesMut) -> Option<String> {
    let mut i = 0;

    // with bound check to prevent invalid format
    while i < buf.remaining() && buf[i] != b'\0' {
        i += 1;
    }

    if i >= buf.remaining() {
        return None;
    }

    // i+1: include the '\0'
    let string_buf = buf.split_to(i + 1);

    if i == 0 {
        None
    } else {
        Some(String::from_utf8_lossy(&string_buf[..i]).into_owned())
    }
}

pub(crate) fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(b'\0');
}

/// Length of an optional cstring on the wire, trailing `\0` included. `None`
/// is encoded as a bare `\0`.
pub(crate) fn option_string_len(s: &Option<String>) -> usize {
    s.as_ref().map(|s| s.len()).unwrap_or(0) + 1
}

pub(crate) fn put_option_cstring(buf: &mut BytesMut, s: &Option<String>) {
    if let Some(s) = s {
        put_cstring(buf, s);
    } else {
        buf.put_u8(b'\0');
    }
}

/// Frame a length-prefixed packet out of `buf` and decode it with
/// `decode_fn`. `offset` is the number of bytes in front of the length field
/// (1 for typed messages, 0 for startup-family packets). Returns `None` when
/// the buffer does not yet hold the complete packet.
pub(crate) fn decode_packet<T, F>(
    buf: &mut BytesMut,
    offset: usize,
    decode_fn: F,
) -> ProxyResult<Option<T>>
where
    F: Fn(&mut BytesMut, usize) -> ProxyResult<T>,
{
    if buf.remaining() < offset + 4 {
        return Ok(None);
    }

    let full_len = (&buf[offset..offset + 4]).get_i32();
    if full_len < 4 {
        return Err(ProxyError::InvalidStartupMessage);
    }
    let full_len = full_len as usize;

    if buf.remaining() < offset + full_len {
        return Ok(None);
    }

    buf.advance(offset + 4);
    let mut body = buf.split_to(full_len - 4);
    decode_fn(&mut body, full_len).map(Some)
}
