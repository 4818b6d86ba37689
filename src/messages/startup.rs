use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec;
use super::Message;
use crate::error::{ProxyError, ProxyResult};

/// Postgresql wire protocol startup message.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new)]
pub struct Startup {
    #[new(value = "3")]
    pub protocol_number_major: u16,
    #[new(value = "0")]
    pub protocol_number_minor: u16,
    #[new(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Default for Startup {
    fn default() -> Startup {
        Startup::new()
    }
}

impl Startup {
    const MINIMUM_STARTUP_MESSAGE_LEN: usize = 8;

    /// Only protocol 3.0 is spoken here.
    fn is_protocol_version_supported(version: i32) -> bool {
        version == 196608
    }
}

impl Message for Startup {
    fn message_length(&self) -> usize {
        let param_length = self
            .parameters
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum::<usize>();
        // length:4 + protocol_number:4 + params + terminating \0
        9 + param_length
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_u16(self.protocol_number_major);
        buf.put_u16(self.protocol_number_minor);

        for (k, v) in self.parameters.iter() {
            codec::put_cstring(buf, k);
            codec::put_cstring(buf, v);
        }
        // parameter block ends with an empty cstring
        codec::put_cstring(buf, "");

        Ok(())
    }

    fn decode(buf: &mut BytesMut) -> ProxyResult<Option<Self>> {
        if buf.remaining() >= Self::MINIMUM_STARTUP_MESSAGE_LEN {
            let packet_version = (&buf[4..8]).get_i32();
            if !Self::is_protocol_version_supported(packet_version) {
                return Err(ProxyError::InvalidProtocolVersion(packet_version));
            }
        }

        codec::decode_packet(buf, 0, Self::decode_body)
    }

    fn decode_body(buf: &mut BytesMut, msg_len: usize) -> ProxyResult<Self> {
        if msg_len <= Self::MINIMUM_STARTUP_MESSAGE_LEN {
            return Err(ProxyError::InvalidStartupMessage);
        }

        let protocol_number_major = buf.get_u16();
        let protocol_number_minor = buf.get_u16();

        let mut parameters = BTreeMap::new();
        while let Some(key) = codec::get_cstring(buf) {
            let value = codec::get_cstring(buf).unwrap_or_default();
            parameters.insert(key, value);
        }

        Ok(Startup {
            protocol_number_major,
            protocol_number_minor,
            parameters,
        })
    }
}

/// `SslRequest` is the encrypted-transport sentinel: a length-prefixed packet
/// with a magic body and no message type byte. The receiving side answers
/// with a single byte, 'S' to proceed with a TLS handshake or 'N' to stay in
/// plaintext.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new, Default)]
pub struct SslRequest;

impl SslRequest {
    pub const BODY_MAGIC_NUMBER: i32 = 80877103;
    pub const BODY_SIZE: usize = 8;
}

impl Message for SslRequest {
    #[inline]
    fn message_length(&self) -> usize {
        Self::BODY_SIZE
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_i32(Self::BODY_MAGIC_NUMBER);
        Ok(())
    }

    fn decode_body(_buf: &mut BytesMut, _full_len: usize) -> ProxyResult<Self> {
        unreachable!();
    }

    /// Check if the buffer begins with an `SslRequest` and consume it if so.
    fn decode(buf: &mut BytesMut) -> ProxyResult<Option<Self>> {
        if buf.remaining() >= Self::BODY_SIZE
            && (&buf[0..4]).get_i32() == Self::BODY_SIZE as i32
            && (&buf[4..8]).get_i32() == Self::BODY_MAGIC_NUMBER
        {
            buf.advance(Self::BODY_SIZE);
            Ok(Some(SslRequest))
        } else {
            Ok(None)
        }
    }
}

/// Magic body of the GSSAPI encryption sentinel. Always refused.
pub const GSSENC_REQUEST_MAGIC_NUMBER: i32 = 80877104;

/// Magic body of the cancel-request sentinel. Cancellation is not honored;
/// a session opened with this packet is simply closed.
pub const CANCEL_REQUEST_MAGIC_NUMBER: i32 = 80877102;

/// Authentication response family, sent by the backend
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Authentication {
    Ok,                   // code 0
    CleartextPassword,    // code 3
    MD5Password(Vec<u8>), // code 5, with 4 bytes of md5 salt

    SASL(Vec<String>),   // code 10, with server supported sasl mechanisms
    SASLContinue(Bytes), // code 11, with authentication data
    SASLFinal(Bytes),    // code 12, with additional authentication data
}

pub const MESSAGE_TYPE_BYTE_AUTHENTICATION: u8 = b'R';

impl Message for Authentication {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_AUTHENTICATION)
    }

    #[inline]
    fn message_length(&self) -> usize {
        match self {
            Authentication::Ok | Authentication::CleartextPassword => 8,
            Authentication::MD5Password(_) => 12,
            Authentication::SASL(methods) => {
                8 + methods.iter().map(|v| v.len() + 1).sum::<usize>() + 1
            }
            Authentication::SASLContinue(data) => 8 + data.len(),
            Authentication::SASLFinal(data) => 8 + data.len(),
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        match self {
            Authentication::Ok => buf.put_i32(0),
            Authentication::CleartextPassword => buf.put_i32(3),
            Authentication::MD5Password(salt) => {
                buf.put_i32(5);
                buf.put_slice(salt.as_ref());
            }
            Authentication::SASL(methods) => {
                buf.put_i32(10);
                for method in methods {
                    codec::put_cstring(buf, method);
                }
                buf.put_u8(b'\0');
            }
            Authentication::SASLContinue(data) => {
                buf.put_i32(11);
                buf.put_slice(data.as_ref());
            }
            Authentication::SASLFinal(data) => {
                buf.put_i32(12);
                buf.put_slice(data.as_ref());
            }
        }
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, msg_len: usize) -> ProxyResult<Self> {
        let code = buf.get_i32();
        let msg = match code {
            0 => Authentication::Ok,
            3 => Authentication::CleartextPassword,
            5 => {
                let mut salt_vec = vec![0; 4];
                buf.copy_to_slice(&mut salt_vec);
                Authentication::MD5Password(salt_vec)
            }
            10 => {
                let mut methods = Vec::new();
                while let Some(method) = codec::get_cstring(buf) {
                    methods.push(method);
                }
                Authentication::SASL(methods)
            }
            11 => Authentication::SASLContinue(buf.split_to(msg_len - 8).freeze()),
            12 => Authentication::SASLFinal(buf.split_to(msg_len - 8).freeze()),
            _ => {
                return Err(ProxyError::InvalidMessageType(code as u8));
            }
        };

        Ok(msg)
    }
}

pub const MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY: u8 = b'p';

/// Several frontend messages share the type byte 'p':
///
/// * Password
/// * SASLInitialResponse
/// * SASLResponse
///
/// They cannot be told apart without context, so the decoder produces this
/// raw holder and the authentication state machine coerces it into the
/// concrete type it expects.
#[non_exhaustive]
#[derive(Debug)]
pub enum PasswordMessageFamily {
    /// The type of message is unknown.
    Raw(BytesMut),
    /// Password message
    Password(Password),
    /// SASLInitialResponse
    SASLInitialResponse(SASLInitialResponse),
    /// SASLResponse
    SASLResponse(SASLResponse),
}

impl Message for PasswordMessageFamily {
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY)
    }

    fn message_length(&self) -> usize {
        match self {
            PasswordMessageFamily::Raw(body) => body.len() + 4,
            PasswordMessageFamily::Password(inner) => inner.message_length(),
            PasswordMessageFamily::SASLInitialResponse(inner) => inner.message_length(),
            PasswordMessageFamily::SASLResponse(inner) => inner.message_length(),
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        match self {
            PasswordMessageFamily::Raw(body) => {
                buf.put_slice(body.as_ref());
                Ok(())
            }
            PasswordMessageFamily::Password(inner) => inner.encode_body(buf),
            PasswordMessageFamily::SASLInitialResponse(inner) => inner.encode_body(buf),
            PasswordMessageFamily::SASLResponse(inner) => inner.encode_body(buf),
        }
    }

    fn decode_body(buf: &mut BytesMut, full_len: usize) -> ProxyResult<Self> {
        let body = buf.split_to(full_len - 4);
        Ok(PasswordMessageFamily::Raw(body))
    }
}

impl PasswordMessageFamily {
    /// Coerce the raw message into `Password`
    pub fn into_password(self) -> ProxyResult<Password> {
        if let PasswordMessageFamily::Raw(mut body) = self {
            let len = body.len() + 4;
            Password::decode_body(&mut body, len)
        } else {
            unreachable!(
                "Do not coerce password message when it has a concrete type {:?}",
                self
            )
        }
    }

    /// Coerce the raw message into `SASLInitialResponse`
    pub fn into_sasl_initial_response(self) -> ProxyResult<SASLInitialResponse> {
        if let PasswordMessageFamily::Raw(mut body) = self {
            let len = body.len() + 4;
            SASLInitialResponse::decode_body(&mut body, len)
        } else {
            unreachable!(
                "Do not coerce password message when it has a concrete type {:?}",
                self
            )
        }
    }

    /// Coerce the raw message into `SASLResponse`
    pub fn into_sasl_response(self) -> ProxyResult<SASLResponse> {
        if let PasswordMessageFamily::Raw(mut body) = self {
            let len = body.len() + 4;
            SASLResponse::decode_body(&mut body, len)
        } else {
            unreachable!(
                "Do not coerce password message when it has a concrete type {:?}",
                self
            )
        }
    }
}

/// Cleartext password packet sent from the frontend
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new)]
pub struct Password {
    pub password: String,
}

impl Message for Password {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY)
    }

    fn message_length(&self) -> usize {
        5 + self.password.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        codec::put_cstring(buf, &self.password);
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let pass = codec::get_cstring(buf).unwrap_or_default();
        Ok(Password::new(pass))
    }
}

#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new)]
pub struct SASLInitialResponse {
    pub auth_method: String,
    pub data: Option<Bytes>,
}

impl Message for SASLInitialResponse {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY)
    }

    #[inline]
    fn message_length(&self) -> usize {
        4 + self.auth_method.len() + 1 + 4 + self.data.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        codec::put_cstring(buf, &self.auth_method);
        if let Some(ref data) = self.data {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data.as_ref());
        } else {
            buf.put_i32(-1);
        }
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _full_len: usize) -> ProxyResult<Self> {
        let auth_method = codec::get_cstring(buf).unwrap_or_default();
        let data_len = buf.get_i32();
        let data = if data_len == -1 {
            None
        } else {
            Some(buf.split_to(data_len as usize).freeze())
        };

        Ok(SASLInitialResponse { auth_method, data })
    }
}

#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new)]
pub struct SASLResponse {
    pub data: Bytes,
}

impl Message for SASLResponse {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PASSWORD_MESSAGE_FAMILY)
    }

    #[inline]
    fn message_length(&self) -> usize {
        4 + self.data.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_slice(self.data.as_ref());
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, full_len: usize) -> ProxyResult<Self> {
        let data = buf.split_to(full_len - 4).freeze();
        Ok(SASLResponse { data })
    }
}

/// Parameter ack sent from the backend after authentication success
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

pub const MESSAGE_TYPE_BYTE_PARAMETER_STATUS: u8 = b'S';

impl Message for ParameterStatus {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_PARAMETER_STATUS)
    }

    fn message_length(&self) -> usize {
        4 + 2 + self.name.len() + self.value.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        codec::put_cstring(buf, &self.name);
        codec::put_cstring(buf, &self.value);
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let name = codec::get_cstring(buf).unwrap_or_default();
        let value = codec::get_cstring(buf).unwrap_or_default();
        Ok(ParameterStatus::new(name, value))
    }
}

/// `BackendKeyData`, sent after authentication. The secret it carries would
/// normally key the cancel-request side channel; this proxy emits it for
/// client compatibility only.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug, new)]
pub struct BackendKeyData {
    pub pid: i32,
    pub secret_key: i32,
}

pub const MESSAGE_TYPE_BYTE_BACKEND_KEY_DATA: u8 = b'K';

impl Message for BackendKeyData {
    #[inline]
    fn message_type() -> Option<u8> {
        Some(MESSAGE_TYPE_BYTE_BACKEND_KEY_DATA)
    }

    #[inline]
    fn message_length(&self) -> usize {
        12
    }

    fn encode_body(&self, buf: &mut BytesMut) -> ProxyResult<()> {
        buf.put_i32(self.pid);
        buf.put_i32(self.secret_key);
        Ok(())
    }

    fn decode_body(buf: &mut BytesMut, _: usize) -> ProxyResult<Self> {
        let pid = buf.get_i32();
        let secret_key = buf.get_i32();
        Ok(BackendKeyData { pid, secret_key })
    }
}
