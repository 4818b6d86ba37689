use bytes::{Buf, BufMut, BytesMut};

use super::codec;
use super::Message;
use crate::error::ProxyResult;

/// Completion tag of a statement, e.g. `SELECT 2` or `INSERT 0 1`
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new)]
pub struct CommandComplete {
    pub tag: String,
}

pub const MESSAGE_TYPE_BYTE_COMMAND_COMPLETE: u8 = b'C';

impl Message for CommandComplete {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_COMMAND_COMPLETE)
    }

    fn message_length(&self) -> usize {
        5 + self.tag.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        codec::put_cstring(buf, &self.tag);
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let tag = codec::get_cstring(buf).unwrap_or_default();
        Ok(CommandComplete::new(tag))
    }
}

/// Response to an empty query string
#[derive(PartialEq, Eq, Debug, new)]
pub struct EmptyQueryResponse;

pub const MESSAGE_TYPE_BYTE_EMPTY_QUERY_RESPONSE: u8 = b'I';

impl Message for EmptyQueryResponse {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_EMPTY_QUERY_RESPONSE)
    }

    #[inline]
    fn message_length(&self) -> usize {
        4
    }

    fn encode_body(&self, _buf: &mut BytesMut) -> ProxyResult<()> {
        Ok(())
    }

    fn decode_body(_buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        Ok(EmptyQueryResponse)
    }
}

pub const READY_STATUS_IDLE: u8 = b'I';
pub const READY_STATUS_TRANSACTION: u8 = b'T';
pub const READY_STATUS_FAILED_TRANSACTION: u8 = b'E';

#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new)]
pub struct ReadyForQuery {
    pub status: u8,
}

pub const MESSAGE_TYPE_BYTE_READY_FOR_QUERY: u8 = b'Z';

impl Message for ReadyForQuery {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_READY_FOR_QUERY)
    }

    #[inline]
    fn message_length(&self) -> usize {
        5
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_u8(self.status);
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let status = buf.get_u8();
        Ok(ReadyForQuery::new(status))
    }
}

fn encode_field_pairs(fields: &[(u8, String)], buf: &mut BytesMut) {
    for (code, value) in fields {
        buf.put_u8(*code);
        codec::put_cstring(buf, value);
    }
    buf.put_u8(b'\0');
}

fn decode_field_pairs(buf: &mut BytesMut) -> Vec<(u8, String)> {
    let mut fields = Vec::new();
    loop {
        let code = buf.get_u8();
        if code == b'\0' {
            return fields;
        }
        let value = codec::get_cstring(buf).unwrap_or_default();
        fields.push((code, value));
    }
}

fn field_pairs_len(fields: &[(u8, String)]) -> usize {
    4 + fields.iter().map(|f| f.1.len() + 2).sum::<usize>() + 1
}

/// Error report, a list of (field-type, value) pairs
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, Default, new)]
pub struct ErrorResponse {
    pub fields: Vec<(u8, String)>,
}

pub const MESSAGE_TYPE_BYTE_ERROR_RESPONSE: u8 = b'E';

impl Message for ErrorResponse {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_ERROR_RESPONSE)
    }

    fn message_length(&self) -> usize {
        field_pairs_len(&self.fields)
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        encode_field_pairs(&self.fields, buf);
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        Ok(ErrorResponse::new(decode_field_pairs(buf)))
    }
}

/// Warning report, same shape as `ErrorResponse`
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, Default, new)]
pub struct NoticeResponse {
    pub fields: Vec<(u8, String)>,
}

pub const MESSAGE_TYPE_BYTE_NOTICE_RESPONSE: u8 = b'N';

impl Message for NoticeResponse {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_NOTICE_RESPONSE)
    }

    fn message_length(&self) -> usize {
        field_pairs_len(&self.fields)
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        encode_field_pairs(&self.fields, buf);
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        Ok(NoticeResponse::new(decode_field_pairs(buf)))
    }
}
