use bytes::BytesMut;

use super::Message;
use crate::error::ProxyResult;

/// Graceful end of session, sent by the frontend
#[derive(PartialEq, Eq, Debug, Default, new)]
pub struct Terminate;

pub const MESSAGE_TYPE_BYTE_TERMINATE: u8 = b'X';

impl Message for Terminate {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_TERMINATE)
    }

    #[inline]
    fn message_length(&self) -> usize {
        4
    }

    fn encode_body(&self, _buf: &mut BytesMut) -> ProxyResult<()> {
        Ok(())
    }

    fn decode_body(_buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        Ok(Terminate)
    }
}
