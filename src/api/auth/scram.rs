//! Server side of SCRAM-SHA-256 as specified by
//! [RFC5802](https://www.rfc-editor.org/rfc/rfc5802), with the
//! `tls-server-end-point` channel binding of
//! [RFC5929](https://www.rfc-editor.org/rfc/rfc5929).
//!
//! The exchange runs against a stored verifier (salt, StoredKey, ServerKey);
//! the cleartext password is never needed here. ClientKey is recovered from
//! the proof, `H(ClientKey)` is compared against StoredKey in constant time.

use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroU32;
use std::ops::BitXor;
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::{constant_time, digest, hmac as ring_hmac, pbkdf2};

use crate::credentials::UserCredential;
use crate::error::{ProxyError, ProxyResult};

pub const SCRAM_ITERATIONS: usize = 4096;
pub const SCRAM_SALT_LEN: usize = 16;
const SCRAM_NONCE_LEN: usize = 18;

/// Compute the salted password from a raw password as defined in RFC5802:
///
/// ```text
/// SaltedPassword := Hi(Normalize(password), salt, i)
/// ```
pub fn gen_salted_password(password: &str, salt: &[u8], iters: usize) -> Vec<u8> {
    // when saslprep fails, postgres uses the original password rather than
    // rejecting it
    let normalized_pass = stringprep::saslprep(password).unwrap_or(Cow::Borrowed(password));
    let pass_bytes = normalized_pass.as_ref().as_bytes();
    hi(pass_bytes, salt, iters)
}

pub fn random_salt() -> Vec<u8> {
    rand::random::<[u8; SCRAM_SALT_LEN]>().to_vec()
}

pub fn random_nonce() -> String {
    STANDARD.encode(rand::random::<[u8; SCRAM_NONCE_LEN]>())
}

fn hi(normalized_password: &[u8], salt: &[u8], iterations: usize) -> Vec<u8> {
    let mut buf = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(iterations as u32).unwrap(),
        salt,
        normalized_password,
        &mut buf,
    );
    buf.to_vec()
}

pub(crate) fn hmac(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mac = ring_hmac::Key::new(ring_hmac::HMAC_SHA256, key);
    ring_hmac::sign(&mac, msg).as_ref().to_vec()
}

pub(crate) fn h(msg: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, msg).as_ref().to_vec()
}

pub(crate) fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| l.bitxor(r))
        .collect()
}

/// Compute the `tls-server-end-point` binding data for a server certificate:
/// SHA-256 over the DER encoding of the first certificate in the PEM input.
pub fn compute_cert_signature(certs_pem: &[u8]) -> ProxyResult<Vec<u8>> {
    let mut reader = std::io::BufReader::new(certs_pem);
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| ProxyError::InvalidScramMessage("no certificate in pem".to_owned()))??;
    Ok(h(cert.as_ref()))
}

fn decode_str(data: &[u8]) -> ProxyResult<&str> {
    std::str::from_utf8(data).map_err(|e| ProxyError::InvalidScramMessage(e.to_string()))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CBindFlag {
    CbName(String),
    N,
    Y,
}

impl fmt::Display for CBindFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CbName(name) => {
                f.write_str("p=")?;
                f.write_str(name)
            }
            Self::N => f.write_str("n"),
            Self::Y => f.write_str("y"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Gs2Header {
    pub c_bind_flag: CBindFlag,
    pub authzid: Option<String>,
}

impl fmt::Display for Gs2Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.c_bind_flag.fmt(f)?;
        f.write_str(",")?;
        if let Some(authzid) = &self.authzid {
            f.write_str("a=")?;
            f.write_str(authzid)?;
        }
        f.write_str(",")
    }
}

/// Parsed client-first-message. `bare` keeps the received
/// client-first-message-bare verbatim, extensions included, because it goes
/// into AuthMessage byte for byte.
#[derive(Debug)]
pub(crate) struct ClientFirst {
    pub gs2header: Gs2Header,
    pub username: String,
    pub nonce: String,
    pub bare: String,
}

impl FromStr for ClientFirst {
    type Err = ProxyError;

    fn from_str(s: &str) -> ProxyResult<Self> {
        // client-first-message = gs2-header client-first-message-bare
        // gs2-header = gs2-cbind-flag "," [ authzid ] ","
        // gs2-cbind-flag = ("p=" cb-name) / "n" / "y"
        // client-first-message-bare =
        //     [reserved-mext ","] username "," nonce ["," extensions]
        let mut parts = s.splitn(3, ',');

        let c_bind_flag = match parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?
        {
            "y" => CBindFlag::Y,
            "n" => CBindFlag::N,
            flag => {
                if let Some(cb_name) = flag.strip_prefix("p=") {
                    CBindFlag::CbName(cb_name.into())
                } else {
                    return Err(ProxyError::InvalidScramMessage(s.to_owned()));
                }
            }
        };

        let authzid = parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?;
        let authzid = if let Some(saslname) = authzid.strip_prefix("a=") {
            Some(saslname.to_owned())
        } else if authzid.is_empty() {
            None
        } else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };

        let bare = parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?;

        let mut bare_parts = bare.split(',');
        let reserved_mext_or_username = bare_parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?;
        let username = if reserved_mext_or_username.starts_with("m=") {
            bare_parts
                .next()
                .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?
        } else {
            reserved_mext_or_username
        };
        let Some(username) = username.strip_prefix("n=") else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };

        let Some(nonce) = bare_parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?
            .strip_prefix("r=")
        else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };
        if nonce.is_empty() {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        }

        Ok(Self {
            gs2header: Gs2Header {
                c_bind_flag,
                authzid,
            },
            username: username.to_owned(),
            nonce: nonce.to_owned(),
            bare: bare.to_owned(),
        })
    }
}

#[derive(Debug, new)]
pub(crate) struct ServerFirst {
    pub nonce: String,
    pub salt: String,
    pub iteration_count: usize,
}

impl FromStr for ServerFirst {
    type Err = ProxyError;

    fn from_str(s: &str) -> ProxyResult<Self> {
        // server-first-message =
        //     [reserved-mext ","] nonce "," salt "," iteration-count ["," extensions]
        let mut parts = s.split(',');

        let reserved_mext_or_nonce = parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?;
        let nonce = if reserved_mext_or_nonce.starts_with("m=") {
            parts
                .next()
                .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?
        } else {
            reserved_mext_or_nonce
        };
        let Some(nonce) = nonce.strip_prefix("r=") else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };

        let Some(salt) = parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?
            .strip_prefix("s=")
        else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };

        let Some(iteration_count) = parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?
            .strip_prefix("i=")
        else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };
        let Ok(iteration_count) = iteration_count.parse() else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };

        Ok(Self {
            nonce: nonce.to_owned(),
            salt: salt.to_owned(),
            iteration_count,
        })
    }
}

impl fmt::Display for ServerFirst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r={},s={},i={}", self.nonce, self.salt, self.iteration_count)
    }
}

/// Parsed client-final-message. `without_proof` keeps the received prefix
/// verbatim for AuthMessage.
#[derive(Debug)]
pub(crate) struct ClientFinal {
    pub channel_binding: String,
    pub nonce: String,
    pub proof: String,
    pub without_proof: String,
}

impl FromStr for ClientFinal {
    type Err = ProxyError;

    fn from_str(s: &str) -> ProxyResult<Self> {
        // client-final-message = channel-binding "," nonce ["," extensions] "," proof
        // channel-binding = "c=" base64
        // proof = "p=" base64
        let Some(proof_at) = s.rfind(",p=") else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };
        let without_proof = &s[..proof_at];
        let proof = &s[proof_at + 3..];

        let mut parts = without_proof.split(',');

        let Some(channel_binding) = parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?
            .strip_prefix("c=")
        else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };

        let Some(nonce) = parts
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?
            .strip_prefix("r=")
        else {
            return Err(ProxyError::InvalidScramMessage(s.to_owned()));
        };

        Ok(Self {
            channel_binding: channel_binding.to_owned(),
            nonce: nonce.to_owned(),
            proof: proof.to_owned(),
            without_proof: without_proof.to_owned(),
        })
    }
}

#[derive(Debug)]
pub(crate) enum ServerFinal {
    Success { verifier: String },
    Error { value: String },
}

impl FromStr for ServerFinal {
    type Err = ProxyError;

    fn from_str(s: &str) -> ProxyResult<Self> {
        // server-final-message = (server-error / verifier) ["," extensions]
        let next = s
            .split(',')
            .next()
            .ok_or_else(|| ProxyError::InvalidScramMessage(s.to_owned()))?;
        if let Some(verifier) = next.strip_prefix("v=") {
            Ok(Self::Success {
                verifier: verifier.to_owned(),
            })
        } else if let Some(value) = next.strip_prefix("e=") {
            Ok(Self::Error {
                value: value.to_owned(),
            })
        } else {
            Err(ProxyError::InvalidScramMessage(s.to_owned()))
        }
    }
}

impl fmt::Display for ServerFinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { verifier } => {
                f.write_str("v=")?;
                f.write_str(verifier)
            }
            Self::Error { value } => {
                f.write_str("e=")?;
                f.write_str(value)
            }
        }
    }
}

/// State machine for one server-side SCRAM exchange.
#[derive(Debug, new)]
pub struct ScramServer {
    credential: Arc<UserCredential>,
    /// SHA-256 of the server certificate DER, when the session is encrypted
    cert_signature: Option<Arc<Vec<u8>>>,
    /// whether the session runs on an encrypted transport
    secure: bool,
}

impl ScramServer {
    /// Process the client-first-message. Returns the server-first-message
    /// and the follow-up state awaiting the client-final-message.
    pub fn on_client_first(
        self,
        client_first_message: &[u8],
    ) -> ProxyResult<(String, ScramServerInFlight)> {
        let client_first = ClientFirst::from_str(decode_str(client_first_message)?)?;

        let mut nonce = client_first.nonce.clone();
        nonce.push_str(random_nonce().as_str());

        let server_first = ServerFirst::new(
            nonce,
            STANDARD.encode(&self.credential.salt),
            self.credential.iterations,
        );

        Ok((
            server_first.to_string(),
            ScramServerInFlight {
                credential: self.credential,
                cert_signature: self.cert_signature,
                secure: self.secure,
                gs2header: client_first.gs2header,
                client_first_bare: client_first.bare,
                server_first,
            },
        ))
    }
}

/// Follow-up of [`ScramServer`], waiting for the client-final-message.
#[derive(Debug)]
pub struct ScramServerInFlight {
    credential: Arc<UserCredential>,
    cert_signature: Option<Arc<Vec<u8>>>,
    secure: bool,
    gs2header: Gs2Header,
    client_first_bare: String,
    server_first: ServerFirst,
}

impl ScramServerInFlight {
    /// Process the client-final-message. On success returns the
    /// server-final-message carrying the server signature.
    pub fn on_client_final(&self, client_final_message: &[u8]) -> ProxyResult<String> {
        let client_final = ClientFinal::from_str(decode_str(client_final_message)?)?;

        if client_final.nonce != self.server_first.nonce {
            return Err(ProxyError::InvalidScramMessage(
                "nonce mismatch".to_owned(),
            ));
        }

        self.verify_channel_binding(&client_final.channel_binding)?;

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, client_final.without_proof
        );

        let proof = STANDARD
            .decode(&client_final.proof)
            .map_err(|e| ProxyError::InvalidScramMessage(e.to_string()))?;
        let client_signature = hmac(&self.credential.stored_key, auth_message.as_bytes());
        if proof.len() != client_signature.len() {
            return Err(ProxyError::InvalidPassword(
                self.credential.username.clone(),
            ));
        }

        let client_key = xor(&proof, &client_signature);
        let computed_stored_key = h(&client_key);

        if constant_time::verify_slices_are_equal(&computed_stored_key, &self.credential.stored_key)
            .is_err()
        {
            return Err(ProxyError::InvalidPassword(
                self.credential.username.clone(),
            ));
        }

        let server_signature = hmac(&self.credential.server_key, auth_message.as_bytes());
        Ok(ServerFinal::Success {
            verifier: STANDARD.encode(server_signature),
        }
        .to_string())
    }

    /// The `c=` blob must replay the gs2 header the client opened with, and
    /// its flag must match the transport: `n` is honored only on plaintext
    /// sessions, `p=tls-server-end-point` only on encrypted sessions where
    /// the trailing bytes equal SHA-256 of the server certificate DER.
    fn verify_channel_binding(&self, channel_binding: &str) -> ProxyResult<()> {
        let received = STANDARD
            .decode(channel_binding)
            .map_err(|e| ProxyError::InvalidScramMessage(e.to_string()))?;

        match &self.gs2header.c_bind_flag {
            CBindFlag::N => {
                if self.secure {
                    return Err(ProxyError::ChannelBindingMismatch);
                }
                if received != self.gs2header.to_string().as_bytes() {
                    return Err(ProxyError::ChannelBindingMismatch);
                }
                Ok(())
            }
            CBindFlag::CbName(name) if name == "tls-server-end-point" => {
                let Some(cert_signature) = &self.cert_signature else {
                    return Err(ProxyError::ChannelBindingMismatch);
                };
                if !self.secure {
                    return Err(ProxyError::ChannelBindingMismatch);
                }
                let mut expected = self.gs2header.to_string().into_bytes();
                expected.extend_from_slice(cert_signature);
                constant_time::verify_slices_are_equal(&received, &expected)
                    .map_err(|_| ProxyError::ChannelBindingMismatch)
            }
            _ => Err(ProxyError::ChannelBindingMismatch),
        }
    }
}
