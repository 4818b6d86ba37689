//! Credential manager: SCRAM verifiers keyed by user name, loaded from a
//! provider and replaced atomically on reload.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::api::auth::scram::{gen_salted_password, h, hmac, random_salt, SCRAM_ITERATIONS};

pub mod provider;

pub use provider::CredentialProvider;

/// SCRAM-SHA-256 verifier for one user. Only the derived keys are retained;
/// the cleartext password is discarded after derivation.
#[derive(Debug, Clone)]
pub struct UserCredential {
    pub username: String,
    /// 16-byte random salt
    pub salt: Vec<u8>,
    /// iteration count, at least 4096
    pub iterations: usize,
    /// StoredKey = H(HMAC(SaltedPassword, "Client Key"))
    pub stored_key: Vec<u8>,
    /// ServerKey = HMAC(SaltedPassword, "Server Key")
    pub server_key: Vec<u8>,
}

impl UserCredential {
    /// Derive the verifier from a cleartext password.
    pub fn from_password(username: &str, password: &str) -> UserCredential {
        let salt = random_salt();
        let salted_password = gen_salted_password(password, &salt, SCRAM_ITERATIONS);

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = h(&client_key);
        let server_key = hmac(&salted_password, b"Server Key");

        UserCredential {
            username: username.to_owned(),
            salt,
            iterations: SCRAM_ITERATIONS,
            stored_key,
            server_key,
        }
    }

    /// A throwaway verifier used to run the SCRAM exchange to completion for
    /// users that do not exist, so the wire conversation does not reveal
    /// whether a name is known. The random stored key matches no proof.
    pub fn mock(username: &str) -> UserCredential {
        UserCredential {
            username: username.to_owned(),
            salt: random_salt(),
            iterations: SCRAM_ITERATIONS,
            stored_key: rand::random::<[u8; 32]>().to_vec(),
            server_key: rand::random::<[u8; 32]>().to_vec(),
        }
    }
}

/// Thread-safe verifier store. Lookups are read-mostly; a reload swaps the
/// whole map in one write.
#[derive(Debug, Default)]
pub struct CredentialStore {
    users: RwLock<Arc<HashMap<String, Arc<UserCredential>>>>,
}

impl CredentialStore {
    pub fn new() -> CredentialStore {
        CredentialStore::default()
    }

    /// Build the store from cleartext `user -> password` pairs, deriving
    /// verifiers on the spot.
    pub fn from_passwords(credentials: &HashMap<String, String>) -> CredentialStore {
        let store = CredentialStore::new();
        store.replace(credentials);
        store
    }

    pub fn lookup(&self, username: &str) -> Option<Arc<UserCredential>> {
        self.users.read().unwrap().get(username).cloned()
    }

    /// Empty store means trust mode: sessions skip authentication.
    pub fn is_empty(&self) -> bool {
        self.users.read().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap().len()
    }

    /// Atomically replace the whole user set.
    pub fn replace(&self, credentials: &HashMap<String, String>) {
        let users = credentials
            .iter()
            .map(|(username, password)| {
                (
                    username.clone(),
                    Arc::new(UserCredential::from_password(username, password)),
                )
            })
            .collect::<HashMap<_, _>>();

        *self.users.write().unwrap() = Arc::new(users);
    }
}
