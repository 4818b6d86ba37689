//! Client side of the SCRAM-SHA-256 exchange, used when a backend demands
//! SASL authentication from the proxy.

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::constant_time;

use crate::api::auth::scram::{gen_salted_password, h, hmac, random_nonce, xor};
use crate::error::{ProxyError, ProxyResult};

// re-parse helpers shared with the server side
use crate::api::auth::scram::{ServerFinal, ServerFirst};

#[derive(Debug)]
enum ClientState {
    Initial,
    FirstSent,
    FinalSent {
        salted_password: Vec<u8>,
        auth_message: String,
    },
    Done,
}

/// One client-side SCRAM exchange. Channel binding towards backends is not
/// attempted; the gs2 header is always `n,,`.
#[derive(Debug)]
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
    state: ClientState,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> ScramClient {
        ScramClient {
            username: username.to_owned(),
            password: password.to_owned(),
            nonce: random_nonce(),
            state: ClientState::Initial,
        }
    }

    fn bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    /// Produce the client-first-message.
    pub fn client_first(&mut self) -> String {
        self.state = ClientState::FirstSent;
        format!("n,,{}", self.bare())
    }

    /// Consume the server-first-message and produce the client-final-message.
    pub fn client_final(&mut self, server_first_message: &[u8]) -> ProxyResult<String> {
        if !matches!(self.state, ClientState::FirstSent) {
            return Err(ProxyError::InvalidScramMessage(
                "server-first out of order".to_owned(),
            ));
        }

        let server_first_str = std::str::from_utf8(server_first_message)
            .map_err(|e| ProxyError::InvalidScramMessage(e.to_string()))?;
        let server_first = ServerFirst::from_str(server_first_str)?;

        if !server_first.nonce.starts_with(&self.nonce) {
            return Err(ProxyError::InvalidScramMessage(
                "server nonce does not extend client nonce".to_owned(),
            ));
        }

        let salt = STANDARD
            .decode(&server_first.salt)
            .map_err(|e| ProxyError::InvalidScramMessage(e.to_string()))?;
        let salted_password =
            gen_salted_password(&self.password, &salt, server_first.iteration_count);

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = h(&client_key);

        let without_proof = format!("c=biws,r={}", server_first.nonce);
        let auth_message = format!("{},{},{}", self.bare(), server_first_str, without_proof);

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof = STANDARD.encode(xor(&client_key, &client_signature));

        self.state = ClientState::FinalSent {
            salted_password,
            auth_message,
        };

        Ok(format!("{},p={}", without_proof, proof))
    }

    /// Check the server signature in the server-final-message.
    pub fn verify_server_final(&mut self, server_final_message: &[u8]) -> ProxyResult<()> {
        let ClientState::FinalSent {
            salted_password,
            auth_message,
        } = &self.state
        else {
            return Err(ProxyError::InvalidScramMessage(
                "server-final out of order".to_owned(),
            ));
        };

        let server_final_str = std::str::from_utf8(server_final_message)
            .map_err(|e| ProxyError::InvalidScramMessage(e.to_string()))?;
        let verifier = match ServerFinal::from_str(server_final_str)? {
            ServerFinal::Success { verifier } => verifier,
            ServerFinal::Error { value } => {
                return Err(ProxyError::InvalidScramMessage(value));
            }
        };
        let verifier = STANDARD
            .decode(verifier)
            .map_err(|e| ProxyError::InvalidScramMessage(e.to_string()))?;

        let server_key = hmac(salted_password, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());

        constant_time::verify_slices_are_equal(&verifier, &server_signature).map_err(|_| {
            ProxyError::InvalidScramMessage("server signature mismatch".to_owned())
        })?;

        self.state = ClientState::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::api::auth::scram::ScramServer;
    use crate::credentials::UserCredential;

    #[test]
    fn test_client_against_own_server() {
        let credential = Arc::new(UserCredential::from_password("alice", "wonderland"));
        let server = ScramServer::new(credential, None, false);
        let mut client = ScramClient::new("alice", "wonderland");

        let client_first = client.client_first();
        let (server_first, in_flight) = server.on_client_first(client_first.as_bytes()).unwrap();

        let client_final = client.client_final(server_first.as_bytes()).unwrap();
        let server_final = in_flight.on_client_final(client_final.as_bytes()).unwrap();

        client.verify_server_final(server_final.as_bytes()).unwrap();
    }

    #[test]
    fn test_wrong_password_is_rejected_by_server() {
        let credential = Arc::new(UserCredential::from_password("alice", "wonderland"));
        let server = ScramServer::new(credential, None, false);
        let mut client = ScramClient::new("alice", "rabbit");

        let client_first = client.client_first();
        let (server_first, in_flight) = server.on_client_first(client_first.as_bytes()).unwrap();

        let client_final = client.client_final(server_first.as_bytes()).unwrap();
        let err = in_flight
            .on_client_final(client_final.as_bytes())
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidPassword(_)));
    }
}
